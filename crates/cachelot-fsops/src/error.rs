//! # Design
//!
//! - Structured, constant-message errors for relocation primitives.
//! - Capture operation context (paths, byte counts) to make failures
//!   reproducible in tests.
//! - Preserve source errors without interpolating context into messages.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for relocation operations.
pub type FsOpsResult<T> = Result<T, FsOpsError>;

/// Errors produced by the atomic relocator.
#[derive(Debug, Error)]
pub enum FsOpsError {
    /// Reading from a tier failed.
    #[error("relocation read failure")]
    Read {
        /// Operation that triggered the read failure.
        operation: &'static str,
        /// Path involved in the read failure.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Writing to a tier failed.
    #[error("relocation write failure")]
    Write {
        /// Operation that triggered the write failure.
        operation: &'static str,
        /// Path involved in the write failure.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// The fast tier ran out of space mid-copy.
    #[error("fast tier full")]
    FastFull {
        /// Path being written when space ran out.
        path: PathBuf,
        /// Bytes copied before the failure.
        bytes_transferred: u64,
    },
    /// The target filesystem rejected symlink creation.
    #[error("symlinks unsupported on target filesystem")]
    SymlinkUnsupported {
        /// Path the symlink was attempted at.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// The symlink at the logical path no longer points where the tracker
    /// says it should.
    #[error("symlink does not match tracker state")]
    SymlinkMismatch {
        /// Logical path inspected.
        path: PathBuf,
        /// Fast-tier path the tracker expected.
        expected: PathBuf,
    },
    /// The logical path is not a regular file the relocator can take over.
    #[error("logical path is not a regular file")]
    NotRegularFile {
        /// Offending path.
        path: PathBuf,
    },
    /// The path-keyed lock was held and the caller requested non-blocking.
    #[error("relocation lock contended")]
    Contended {
        /// Path whose lock was held.
        path: PathBuf,
    },
    /// The operation was cancelled between copy chunks.
    #[error("relocation cancelled")]
    Cancelled {
        /// Path the cancelled operation applied to.
        path: PathBuf,
    },
    /// The tracker rejected or failed a state transition.
    #[error("tracker operation failed")]
    Tracker {
        /// Operation that failed.
        operation: &'static str,
        /// Underlying tracker error.
        source: cachelot_data::DataError,
    },
}

impl FsOpsError {
    /// Taxonomy label carried in `operation_complete` events.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Read { .. } => "read_error",
            Self::Write { .. } => "write_error",
            Self::FastFull { .. } => "fast_full",
            Self::SymlinkUnsupported { .. } => "symlink_unsupported",
            Self::SymlinkMismatch { .. } => "symlink_mismatch",
            Self::NotRegularFile { .. } => "not_regular_file",
            Self::Contended { .. } => "contended",
            Self::Cancelled { .. } => "cancelled",
            Self::Tracker { .. } => "tracker_conflict",
        }
    }

    pub(crate) fn read(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Read {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn write(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: io::Error,
    ) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::StorageFull {
            return Self::FastFull {
                path,
                bytes_transferred: 0,
            };
        }
        Self::Write {
            operation,
            path,
            source,
        }
    }

    pub(crate) const fn tracker(
        operation: &'static str,
        source: cachelot_data::DataError,
    ) -> Self {
        Self::Tracker { operation, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn error_kinds_match_the_taxonomy() {
        let read = FsOpsError::read("copy.read", "/library/a.mkv", io::Error::other("io"));
        assert_eq!(read.kind(), "read_error");
        assert!(read.source().is_some());

        let full = FsOpsError::write(
            "copy.write",
            "/mnt/cache/a.mkv",
            io::Error::new(io::ErrorKind::StorageFull, "enospc"),
        );
        assert_eq!(full.kind(), "fast_full");

        let plain = FsOpsError::write("copy.write", "/mnt/cache/a.mkv", io::Error::other("io"));
        assert_eq!(plain.kind(), "write_error");

        let cancelled = FsOpsError::Cancelled {
            path: PathBuf::from("/library/a.mkv"),
        };
        assert_eq!(cancelled.kind(), "cancelled");
    }
}
