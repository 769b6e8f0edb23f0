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

//! Settings loading and validation for Cachelot.
//!
//! The daemon reads one YAML settings file at startup into an immutable
//! [`SettingsSnapshot`]. Unknown keys and out-of-range values reject the
//! load; there is no partial configuration state.

pub mod error;
pub mod loader;
pub mod model;

mod defaults;
mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::load;
pub use model::{
    ActivityWindows, ListDefinition, ListMode, LogFormat, ProviderKind, ReconcileSettings,
    RetentionWindows, Settings, SettingsSnapshot, UpstreamSettings,
};
