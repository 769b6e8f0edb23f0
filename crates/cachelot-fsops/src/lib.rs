#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::cargo,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! Atomic relocation between storage tiers.
//! Layout: `locks.rs` (path-keyed exclusion), `error.rs` (error types),
//! `relocator.rs` (primitives + crash recovery).

pub mod error;
pub mod locks;
pub mod relocator;

pub use error::{FsOpsError, FsOpsResult};
pub use locks::{PathLockGuard, PathLocks};
pub use relocator::{
    LockMode, ReconcileReport, RecoveryReport, Relocator, RelocatorConfig, probe_symlink_support,
};
