//! Error types for telemetry setup and rendering.

use thiserror::Error;

/// Result alias for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Errors produced by the telemetry layer.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The global tracing subscriber could not be installed.
    #[error("tracing subscriber installation failed")]
    Init {
        /// Description of the installation failure.
        detail: String,
    },
    /// The log filter directive was invalid.
    #[error("invalid log filter")]
    Filter {
        /// Offending directive.
        directive: String,
    },
    /// A Prometheus collector could not be registered or encoded.
    #[error("metrics registry failure")]
    Metrics {
        /// Underlying Prometheus error.
        source: prometheus::Error,
    },
    /// Encoded metrics were not valid UTF-8.
    #[error("metrics output not utf-8")]
    Encoding,
}

impl From<prometheus::Error> for TelemetryError {
    fn from(source: prometheus::Error) -> Self {
        Self::Metrics { source }
    }
}
