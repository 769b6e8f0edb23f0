//! Typed configuration models.
//!
//! # Design
//! - Pure data carriers deserialized from the settings file.
//! - Every section rejects unknown keys so typos fail the load instead of
//!   silently disabling behaviour.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults;

/// Log output format selector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Pretty,
    /// Machine-readable JSON lines.
    Json,
}

/// Connection and throttling parameters for the upstream media server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct UpstreamSettings {
    /// Base URL of the media server API.
    pub base_url: String,
    /// Admin token used for discovery; per-user tokens are fetched with it.
    pub token: String,
    /// Minimum gap between any two upstream requests, in milliseconds.
    #[serde(default = "defaults::min_gap_ms")]
    pub min_gap_ms: u64,
    /// Maximum upstream requests within any sliding 60 second window.
    #[serde(default = "defaults::max_per_minute")]
    pub max_per_minute: u32,
    /// Hard per-request timeout, in seconds.
    #[serde(default = "defaults::timeout_s")]
    pub timeout_s: u64,
    /// Maximum retry attempts for transient failures.
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential retry backoff, in seconds.
    #[serde(default = "defaults::retry_delay_s")]
    pub retry_delay_s: u64,
    /// How long discovered per-user tokens stay cached, in hours.
    #[serde(default = "defaults::token_cache_hours")]
    pub token_cache_hours: u64,
}

impl UpstreamSettings {
    /// Minimum inter-request gap as a [`Duration`].
    #[must_use]
    pub const fn min_gap(&self) -> Duration {
        Duration::from_millis(self.min_gap_ms)
    }

    /// Per-request timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }

    /// Retry backoff base as a [`Duration`].
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_s)
    }

    /// Token cache lifetime as a [`Duration`].
    #[must_use]
    pub const fn token_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.token_cache_hours * 3_600)
    }
}

/// Activity windows deciding which users a cycle still enumerates, in days
/// since the user was last seen upstream. `0` means no bound.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct ActivityWindows {
    /// Window for the server owner account.
    pub owner_days: u32,
    /// Window for household accounts.
    pub household_days: u32,
    /// Window for guest accounts.
    pub guest_days: u32,
}

impl Default for ActivityWindows {
    fn default() -> Self {
        Self {
            owner_days: 0,
            household_days: defaults::HOUSEHOLD_ACTIVITY_DAYS,
            guest_days: defaults::GUEST_ACTIVITY_DAYS,
        }
    }
}

/// Per-source retention clocks, in days an entry may outlive its cause
/// before the retention phase schedules a restore. `0` means no clock.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct RetentionWindows {
    /// Retention for entries cached because a session was playing them.
    pub active_days: u32,
    /// Retention for Up Next entries.
    pub ondeck_days: u32,
    /// Retention for watchlist entries.
    pub watchlist_days: u32,
    /// Retention for import-list entries.
    pub list_days: u32,
    /// Retention for manually cached entries.
    pub manual_days: u32,
    /// How long `removed` tracker rows are kept for audit before pruning.
    pub removed_retention_days: u32,
}

impl Default for RetentionWindows {
    fn default() -> Self {
        Self {
            active_days: 1,
            ondeck_days: 7,
            watchlist_days: 14,
            list_days: 7,
            manual_days: 0,
            removed_retention_days: defaults::REMOVED_RETENTION_DAYS,
        }
    }
}

/// External list matching mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ListMode {
    /// Drop items that cannot be matched to a library path.
    Strict,
    /// Keep fetching until `count_cap` matched items are found.
    Fill,
}

/// Provider behind an import list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Currently trending titles.
    Trending,
    /// All-time popular titles.
    Popular,
    /// A user's personal list on the upstream server.
    Personal,
    /// The first N titles of a ranked feed.
    TopN,
    /// Arbitrary JSON feed fetched from a URL.
    CustomUrl,
}

impl ProviderKind {
    /// Stable lowercase label for logs and persistence.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trending => "trending",
            Self::Popular => "popular",
            Self::Personal => "personal",
            Self::TopN => "top_n",
            Self::CustomUrl => "custom_url",
        }
    }
}

/// Declaration of one import list in the settings file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ListDefinition {
    /// Unique list name; doubles as the `list:<name>` cause label.
    pub name: String,
    /// Provider implementation backing the list.
    pub provider: ProviderKind,
    /// Feed URL for the `custom_url` provider.
    #[serde(default)]
    pub url: Option<String>,
    /// Upstream user whose personal list is fetched, for `personal`.
    #[serde(default)]
    pub user: Option<String>,
    /// Bias added to the list priority base.
    #[serde(default)]
    pub priority_bias: i32,
    /// Refresh period for this provider, in seconds.
    #[serde(default = "defaults::list_refresh_period_s")]
    pub refresh_period_s: u64,
    /// Matching mode for unmatched items.
    pub mode: ListMode,
    /// Maximum number of matched items the list contributes.
    #[serde(default = "defaults::list_count_cap")]
    pub count_cap: usize,
}

impl ListDefinition {
    /// Refresh period as a [`Duration`].
    #[must_use]
    pub const fn refresh_period(&self) -> Duration {
        Duration::from_secs(self.refresh_period_s)
    }
}

/// Reconciler behaviour toggles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct ReconcileSettings {
    /// Delete fast-root files with no tracker row instead of leaving them.
    pub delete_unknown: bool,
}

/// Root settings document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Directory the fast tier lives under.
    pub fast_root: PathBuf,
    /// Directories the slow tier lives under.
    pub slow_roots: Vec<PathBuf>,
    /// Hard size limit for the fast tier, in bytes.
    pub fast_limit_bytes: u64,
    /// Period between scheduled cycles, in seconds.
    #[serde(default = "defaults::cycle_period_s")]
    pub cycle_period_s: u64,
    /// Period between standalone reconciler passes, in seconds.
    #[serde(default = "defaults::reconcile_period_s")]
    pub reconcile_period_s: u64,
    /// Upper bound on concurrently running relocations.
    #[serde(default = "defaults::max_concurrent_relocations")]
    pub max_concurrent_relocations: usize,
    /// Bounded queue depth for each event bus subscriber.
    #[serde(default = "defaults::subscriber_queue_depth")]
    pub subscriber_queue_depth: usize,
    /// Number of cycle results retained for inspection.
    #[serde(default = "defaults::cycle_history")]
    pub cycle_history: usize,
    /// Upstream media server connection and throttling.
    pub upstream: UpstreamSettings,
    /// Per-user-kind activity windows.
    #[serde(default)]
    pub activity: ActivityWindows,
    /// Per-source retention windows.
    #[serde(default)]
    pub retention: RetentionWindows,
    /// Import list declarations.
    #[serde(default)]
    pub lists: Vec<ListDefinition>,
    /// Reconciler behaviour.
    #[serde(default)]
    pub reconcile: ReconcileSettings,
    /// Default log level when `RUST_LOG` is not provided.
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Settings {
    /// Cycle period as a [`Duration`].
    #[must_use]
    pub const fn cycle_period(&self) -> Duration {
        Duration::from_secs(self.cycle_period_s)
    }

    /// Reconcile period as a [`Duration`].
    #[must_use]
    pub const fn reconcile_period(&self) -> Duration {
        Duration::from_secs(self.reconcile_period_s)
    }
}

/// Immutable, validated configuration handed to every cycle.
///
/// Carries the settings document plus the directory the daemon keeps its
/// durable state in (tracker database, lock file, logs, cycle results).
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsSnapshot {
    /// Validated settings document.
    pub settings: Settings,
    /// Directory containing the settings file and all durable daemon state.
    pub config_dir: PathBuf,
}

impl SettingsSnapshot {
    /// Path of the tracker database file.
    #[must_use]
    pub fn tracker_path(&self) -> PathBuf {
        self.config_dir.join("tracker.db")
    }

    /// Path of the instance lock file.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.config_dir.join("cachelot.lock")
    }

    /// Path of the cycle result ring file.
    #[must_use]
    pub fn cycles_path(&self) -> PathBuf {
        self.config_dir.join("cycles.json")
    }

    /// Directory rotating log files are written to.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.config_dir.join("logs")
    }
}
