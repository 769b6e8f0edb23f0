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

//! Persistent cache tracker: the durable record of tier placement,
//! attribution, access counts, and lifecycle status, backed by a single
//! SQLite file in the configuration directory.

pub mod error;
pub mod tracker;

pub use error::{DataError, DataResult};
pub use tracker::{StagingRequest, TrackerStore, usage_percent};
