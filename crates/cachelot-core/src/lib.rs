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

//! Domain model and engine logic for the Cachelot tiered media cache.
//!
//! This crate is free of IO: the planner and the admission engine are
//! functions over snapshots, and the outside world is reached through the
//! seams in [`service`]. The application crate wires real adapters into
//! those seams; tests wire fakes.

pub mod admission;
pub mod error;
pub mod model;
pub mod planner;
pub mod service;

pub use admission::{
    ActionPlan, AdmissionInput, PlannedRestore, RejectReason, RejectedCandidate, RestoreReason,
    build_plan,
};
pub use error::{
    CommandError, CommandResult, ProviderError, ProviderResult, UpstreamError, UpstreamResult,
};
pub use model::{
    CacheEntry, CacheStatistics, Candidate, CauseOperation, CleanupReport, CycleResult,
    EntryStatus, ExportFormat, ImportList, ListItem, MediaKind, MediaRef, OnDeckSettings, Page,
    PhaseTotals, PlaybackSession, QueryFilter, RelocationMethod, SearchScope, User, UserKind,
    UserSettingsPatch, UserSourceSettings, WatchlistSettings,
};
pub use model::{
    PRIORITY_ACTIVE, PRIORITY_ACTIVE_OTHER, PRIORITY_LIST_BASE, PRIORITY_MANUAL, PRIORITY_ONDECK,
    PRIORITY_WATCHLIST, STALENESS_CAP,
};
pub use model::ActionOutcome;
pub use service::{CacheCommands, CacheInspector, ListProvider, MediaServer};
