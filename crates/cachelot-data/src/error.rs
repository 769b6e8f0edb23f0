//! Error types for tracker persistence.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias for tracker operations.
pub type DataResult<T> = Result<T, DataError>;

/// Errors produced by the tracker store.
#[derive(Debug, Error)]
pub enum DataError {
    /// A database operation failed.
    #[error("tracker database failure")]
    Sqlx {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Underlying sqlx error.
        source: sqlx::Error,
    },
    /// Schema migration failed on open.
    #[error("tracker migration failure")]
    Migrate {
        /// Underlying migration error.
        source: sqlx::migrate::MigrateError,
    },
    /// A state transition found the row in an unexpected state.
    #[error("tracker state conflict")]
    Conflict {
        /// Operation that conflicted.
        operation: &'static str,
        /// Entity kind involved.
        entity: &'static str,
        /// Identifier of the conflicting row.
        id: String,
    },
    /// The referenced row does not exist.
    #[error("tracker row not found")]
    NotFound {
        /// Entity kind looked up.
        entity: &'static str,
        /// Identifier that failed to resolve.
        id: String,
    },
    /// A persisted column could not be decoded into its domain type.
    #[error("tracker column decode failure")]
    Decode {
        /// Column that failed to decode.
        column: &'static str,
        /// Offending value.
        value: String,
    },
    /// A path column contained invalid UTF-8 and cannot be persisted.
    #[error("tracker path not utf-8")]
    PathNotUtf8 {
        /// Field the path was bound to.
        field: &'static str,
        /// Offending path.
        path: PathBuf,
    },
}

impl DataError {
    pub(crate) const fn sqlx(operation: &'static str, source: sqlx::Error) -> Self {
        Self::Sqlx { operation, source }
    }

    pub(crate) fn decode(column: &'static str, value: impl Into<String>) -> Self {
        Self::Decode {
            column,
            value: value.into(),
        }
    }
}
