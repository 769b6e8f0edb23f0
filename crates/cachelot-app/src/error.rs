//! # Design
//!
//! - Centralize application-level errors for bootstrap and orchestration.
//! - Keep error messages constant while carrying context fields.
//! - Map startup failures onto the documented process exit codes.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias for application operations.
pub type AppResult<T> = Result<T, AppError>;

/// Exit code for an orderly shutdown.
pub const EXIT_OK: i32 = 0;
/// Exit code when the instance lock is already held.
pub const EXIT_LOCK_HELD: i32 = 2;
/// Exit code for unrecoverable storage failures at startup.
pub const EXIT_STORAGE: i32 = 3;
/// Exit code for unrecoverable configuration failures.
pub const EXIT_CONFIG: i32 = 4;

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration loading or validation failed.
    #[error("configuration operation failed")]
    Config {
        /// Operation identifier.
        operation: &'static str,
        /// Source configuration error.
        source: cachelot_config::ConfigError,
    },
    /// The instance lock is held by another process.
    #[error("instance lock held")]
    LockHeld {
        /// Lock file path.
        path: PathBuf,
    },
    /// Tracker persistence failed.
    #[error("tracker operation failed")]
    Tracker {
        /// Operation identifier.
        operation: &'static str,
        /// Source tracker error.
        source: cachelot_data::DataError,
    },
    /// Relocation primitives failed during startup.
    #[error("relocation operation failed")]
    FsOps {
        /// Operation identifier.
        operation: &'static str,
        /// Source relocation error.
        source: cachelot_fsops::FsOpsError,
    },
    /// Telemetry setup failed.
    #[error("telemetry operation failed")]
    Telemetry {
        /// Operation identifier.
        operation: &'static str,
        /// Source telemetry error.
        source: cachelot_telemetry::TelemetryError,
    },
    /// The upstream client could not be constructed.
    #[error("upstream client construction failed")]
    Upstream {
        /// Operation identifier.
        operation: &'static str,
        /// Source upstream error.
        source: cachelot_core::UpstreamError,
    },
    /// IO operations failed.
    #[error("io operation failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Optional path involved in the failure.
        path: Option<PathBuf>,
        /// Source IO error.
        source: io::Error,
    },
}

impl AppError {
    pub(crate) const fn config(
        operation: &'static str,
        source: cachelot_config::ConfigError,
    ) -> Self {
        Self::Config { operation, source }
    }

    pub(crate) const fn tracker(
        operation: &'static str,
        source: cachelot_data::DataError,
    ) -> Self {
        Self::Tracker { operation, source }
    }

    pub(crate) const fn fsops(
        operation: &'static str,
        source: cachelot_fsops::FsOpsError,
    ) -> Self {
        Self::FsOps { operation, source }
    }

    pub(crate) const fn telemetry(
        operation: &'static str,
        source: cachelot_telemetry::TelemetryError,
    ) -> Self {
        Self::Telemetry { operation, source }
    }

    pub(crate) const fn upstream(
        operation: &'static str,
        source: cachelot_core::UpstreamError,
    ) -> Self {
        Self::Upstream { operation, source }
    }

    /// Process exit code for this failure.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => EXIT_CONFIG,
            Self::LockHeld { .. } => EXIT_LOCK_HELD,
            Self::Tracker { .. } | Self::FsOps { .. } | Self::Io { .. } => EXIT_STORAGE,
            Self::Telemetry { .. } | Self::Upstream { .. } => 1,
        }
    }
}
