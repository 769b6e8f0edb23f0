//! # Design
//!
//! - Error kinds shared across the engine seams, so adapters and the
//!   orchestrator agree on what is retryable and what is fatal.
//! - Constant messages; context travels in fields.

use thiserror::Error;

/// Result alias for upstream client operations.
pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Failures surfaced by the upstream media server client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    /// All retries exhausted on a transient failure.
    #[error("upstream unavailable")]
    Unavailable {
        /// Operation that exhausted its retry budget.
        operation: &'static str,
        /// Last transport-level failure observed.
        detail: String,
    },
    /// Credentials were rejected.
    #[error("upstream authentication rejected")]
    Auth {
        /// Operation the credential was rejected for.
        operation: &'static str,
    },
    /// The upstream answered with something unparseable.
    #[error("upstream response malformed")]
    Malformed {
        /// Operation whose response failed to parse.
        operation: &'static str,
        /// Parse failure description.
        detail: String,
    },
}

impl UpstreamError {
    /// Whether another attempt could reasonably succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Result alias for list provider refreshes.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Failure of a single list provider refresh. Providers fail independently;
/// a refresh failure marks the list stale but never fails the cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider could not produce items.
    #[error("list provider refresh failed")]
    Failed {
        /// Provider that failed.
        provider: String,
        /// Failure description.
        detail: String,
    },
}

/// Result alias for command surface calls.
pub type CommandResult<T> = Result<T, CommandError>;

/// Failures surfaced by the typed command surface.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    /// The referenced entity does not exist.
    #[error("entity not found")]
    NotFound {
        /// Entity kind (`entry`, `user`, `list`).
        entity: &'static str,
        /// Identifier that failed to resolve.
        id: String,
    },
    /// An argument failed validation.
    #[error("invalid command argument")]
    InvalidArgument {
        /// Field that failed validation.
        field: &'static str,
        /// Machine-readable reason.
        reason: &'static str,
    },
    /// A collaborator failed while executing the command.
    #[error("command execution failed")]
    Failed {
        /// Operation that failed.
        operation: &'static str,
        /// Failure description from the collaborator.
        detail: String,
    },
    /// The daemon is shutting down and no longer accepts commands.
    #[error("service shutting down")]
    ShuttingDown,
}
