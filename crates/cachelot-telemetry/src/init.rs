//! Telemetry initialisation primitives and logging configuration.
//!
//! # Design
//! - Centralises logging setup (fmt or JSON) with a single entry point.
//! - Console output always; rotating daily files under the configuration
//!   directory when a log directory is supplied.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{TelemetryError, TelemetryResult};

/// Default logging target when `RUST_LOG` is not provided.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// File name prefix for the rotating log files.
const LOG_FILE_PREFIX: &str = "cachelot.log";

/// Log output format selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Pretty,
    /// Machine-readable JSON lines.
    Json,
}

/// Logging configuration resolved from settings.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Output format for both console and file layers.
    pub format: LogFormat,
    /// Directory receiving rotating daily log files, when any.
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            format: LogFormat::Pretty,
            log_dir: None,
        }
    }
}

/// Configure and install the global tracing subscriber.
///
/// Returns the non-blocking writer guard when file logging is enabled; the
/// caller must keep it alive for the process lifetime or buffered lines are
/// lost on exit.
///
/// # Errors
///
/// Returns an error if the filter directive is invalid or a subscriber has
/// already been installed globally.
pub fn init_logging(config: &LoggingConfig) -> TelemetryResult<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|_| TelemetryError::Filter {
            directive: config.level.clone(),
        })?;

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    let result = match config.format {
        LogFormat::Pretty => registry.with(fmt::layer()).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };

    result.map_err(|err| TelemetryError::Init {
        detail: err.to_string(),
    })?;
    Ok(guard)
}
