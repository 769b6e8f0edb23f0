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

//! Adapters for the outside world: the serialized, rate-limited, retrying
//! media server client and the import list provider implementations.

pub mod client;
pub mod providers;
pub mod rate;

pub use client::{UpstreamClient, UpstreamClientConfig};
pub use providers::{FeedProvider, provider_for};
pub use rate::{RateGate, RatePolicy};
