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

//! Cachelot daemon: composition root, instance lock, cycle orchestration,
//! and the typed command surface consumed by external transports.

pub mod bootstrap;
pub mod cycles;
pub mod error;
pub mod lock;
pub mod orchestrator;

#[cfg(test)]
mod tests;

pub use bootstrap::run_app;
pub use error::{AppError, AppResult, EXIT_CONFIG, EXIT_LOCK_HELD, EXIT_OK, EXIT_STORAGE};
pub use lock::InstanceLock;
pub use orchestrator::{CacheOrchestrator, OrchestratorDeps};
