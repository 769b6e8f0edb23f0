//! Domain types shared across the cache engine.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use cachelot_events::{CacheHealth, CyclePhase, OperationType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Priority base for a file a session is actively playing.
pub const PRIORITY_ACTIVE: i64 = 1_000;
/// Priority base for manually cached entries.
pub const PRIORITY_MANUAL: i64 = 900;
/// Priority base for Up Next items.
pub const PRIORITY_ONDECK: i64 = 800;
/// Priority base for sessions owned by users outside the enabled roster.
pub const PRIORITY_ACTIVE_OTHER: i64 = 700;
/// Priority base for watchlist items.
pub const PRIORITY_WATCHLIST: i64 = 500;
/// Priority base for import-list items, before the list bias.
pub const PRIORITY_LIST_BASE: i64 = 400;

/// Upper bound on the staleness deduction, preserving class ordering.
pub const STALENESS_CAP: i64 = 200;

/// Media classification reported by the upstream server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Feature-length title.
    Movie,
    /// Single episode of a show.
    Episode,
}

impl MediaKind {
    /// Stable lowercase label for logs and persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Movie => "movie",
            Self::Episode => "episode",
        }
    }
}

/// A library file as reported by the upstream server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaRef {
    /// Filesystem path the upstream serves this file from.
    pub logical_path: PathBuf,
    /// Size reported by the upstream; authoritative size is read at relocation.
    pub size_bytes_hint: u64,
    /// Opaque upstream identifier.
    pub upstream_id: String,
    /// Media classification.
    pub kind: MediaKind,
    /// When the owning user last watched this title, if known.
    pub last_watched_at: Option<DateTime<Utc>>,
    /// When this title became available in the library, if known.
    pub available_since: Option<DateTime<Utc>>,
}

/// One in-flight playback session upstream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaybackSession {
    /// Opaque upstream session identifier.
    pub session_key: String,
    /// User the session belongs to, when resolvable.
    pub user_id: Option<Uuid>,
    /// File being played.
    pub media: MediaRef,
    /// Whether the logical path currently resolves to the fast tier.
    pub playing_from_fast: bool,
}

/// Upstream account classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserKind {
    /// The server owner.
    Owner,
    /// A managed household account.
    Household,
    /// A shared-access guest.
    Guest,
}

impl UserKind {
    /// Stable lowercase label for logs and persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Household => "household",
            Self::Guest => "guest",
        }
    }

    /// Parse the persisted label back into the enum.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "owner" => Some(Self::Owner),
            "household" => Some(Self::Household),
            "guest" => Some(Self::Guest),
            _ => None,
        }
    }
}

/// Up Next source toggles and bounds for one user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct OnDeckSettings {
    /// Whether the source contributes candidates for this user.
    pub enabled: bool,
    /// How many queued episodes to stage ahead of playback.
    pub episodes_ahead: u32,
    /// Drop items last watched more than this many days ago; `0` = no bound.
    pub max_stale_days: u32,
}

impl Default for OnDeckSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            episodes_ahead: 2,
            max_stale_days: 30,
        }
    }
}

/// Watchlist source toggles and bounds for one user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct WatchlistSettings {
    /// Whether the source contributes candidates for this user.
    pub enabled: bool,
    /// Episodes staged per watchlisted show.
    pub episodes_per_show: u32,
    /// Drop items available longer than this many days; `0` = no bound.
    pub max_available_days: u32,
}

impl Default for WatchlistSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            episodes_per_show: 1,
            max_available_days: 60,
        }
    }
}

/// Per-source toggles and bounds carried by each user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct UserSourceSettings {
    /// Up Next enumeration settings.
    pub ondeck: OnDeckSettings,
    /// Watchlist enumeration settings.
    pub watchlist: WatchlistSettings,
    /// Whether in-flight sessions contribute candidates for this user.
    pub active_enabled: bool,
    /// Whether import lists attribute candidates to this user.
    pub lists_enabled: bool,
}

/// A media server account known to the cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    /// Stable identifier, preserved across restarts.
    pub id: Uuid,
    /// Display name reported by the upstream.
    pub display_name: String,
    /// Account classification.
    pub kind: UserKind,
    /// Opaque access token for per-user upstream queries.
    pub token_opaque: String,
    /// When the user was last seen active upstream.
    pub last_seen: Option<DateTime<Utc>>,
    /// Whether cycles enumerate this user at all.
    pub enabled: bool,
    /// Bias applied to every candidate attributed to this user.
    pub priority_bias: i32,
    /// Per-source settings.
    pub settings: UserSourceSettings,
}

/// Partial update applied to a user through the command surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct UserSettingsPatch {
    /// New enabled flag.
    pub enabled: Option<bool>,
    /// New priority bias; must stay within `[-50, 50]`.
    pub priority_bias: Option<i32>,
    /// Replacement Up Next settings.
    pub ondeck: Option<OnDeckSettings>,
    /// Replacement watchlist settings.
    pub watchlist: Option<WatchlistSettings>,
    /// New active-session toggle.
    pub active_enabled: Option<bool>,
    /// New import-list toggle.
    pub lists_enabled: Option<bool>,
}

/// Why an entry was cached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CauseOperation {
    /// A session was playing the file.
    Active,
    /// The file sat in a user's Up Next queue.
    OnDeck,
    /// The file sat in a user's watchlist.
    Watchlist,
    /// The file came from the named import list.
    List(String),
    /// An operator cached the file explicitly.
    Manual,
    /// The entry records a restore operation.
    Restore,
}

impl CauseOperation {
    /// Persisted label; import lists render as `list:<name>`.
    #[must_use]
    pub fn label(&self) -> String {
        // Keep in sync with `parse`.
        match self {
            Self::Active => "active".to_string(),
            Self::OnDeck => "ondeck".to_string(),
            Self::Watchlist => "watchlist".to_string(),
            Self::List(name) => format!("list:{name}"),
            Self::Manual => "manual".to_string(),
            Self::Restore => "restore".to_string(),
        }
    }

    /// Parse the persisted label back into the enum.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "active" => Some(Self::Active),
            "ondeck" => Some(Self::OnDeck),
            "watchlist" => Some(Self::Watchlist),
            "manual" => Some(Self::Manual),
            "restore" => Some(Self::Restore),
            other => other.strip_prefix("list:").map(|name| {
                Self::List(name.to_string())
            }),
        }
    }

    /// Priority base for entries of this cause class.
    #[must_use]
    pub const fn base_priority(&self) -> i64 {
        match self {
            Self::Active => PRIORITY_ACTIVE,
            Self::Manual => PRIORITY_MANUAL,
            Self::OnDeck => PRIORITY_ONDECK,
            Self::Watchlist => PRIORITY_WATCHLIST,
            Self::List(_) => PRIORITY_LIST_BASE,
            Self::Restore => 0,
        }
    }
}

/// Lifecycle state of a tracker row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Row committed, fast copy in progress, logical path untouched.
    Staging,
    /// Symlink swap committed; the logical path resolves to the fast tier.
    Active,
    /// Tracker row exists but the fast file is missing.
    Orphaned,
    /// Selected for restore; fast file still present.
    PendingRemoval,
    /// Terminal: fast file deleted, original path restored.
    Removed,
}

impl EntryStatus {
    /// Stable lowercase label for persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Active => "active",
            Self::Orphaned => "orphaned",
            Self::PendingRemoval => "pending_removal",
            Self::Removed => "removed",
        }
    }

    /// Parse the persisted label back into the enum.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "staging" => Some(Self::Staging),
            "active" => Some(Self::Active),
            "orphaned" => Some(Self::Orphaned),
            "pending_removal" => Some(Self::PendingRemoval),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }
}

/// How the file was moved between tiers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RelocationMethod {
    /// Copy to the fast tier, then atomically swap a symlink over the
    /// logical path, leaving the original file in place.
    #[default]
    AtomicCopy,
}

impl RelocationMethod {
    /// Stable lowercase label for persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AtomicCopy => "atomic_copy",
        }
    }
}

/// The tracker's central row: one file placed on the fast tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    /// Stable row identifier.
    pub id: Uuid,
    /// Path the media server sees; unique among non-removed rows.
    pub logical_path: PathBuf,
    /// Real slow-tier file backing the logical path.
    pub original_location_path: PathBuf,
    /// Fast-tier copy location.
    pub fast_tier_path: PathBuf,
    /// File size in bytes, recorded at relocation.
    pub size_bytes: u64,
    /// When the entry was created.
    pub cached_at: DateTime<Utc>,
    /// Last time the entry was touched by a cycle or playback.
    pub last_accessed_at: DateTime<Utc>,
    /// Monotonic access counter.
    pub access_count: u64,
    /// Why the entry was cached.
    pub cause: CauseOperation,
    /// User who caused the caching, when attributable.
    pub cause_user_id: Option<Uuid>,
    /// All users associated with this entry.
    pub attributions: BTreeSet<Uuid>,
    /// Lifecycle state.
    pub status: EntryStatus,
    /// Relocation method used.
    pub method: RelocationMethod,
    /// SHA-256 of the file content, hex encoded, when computed.
    pub checksum: Option<String>,
    /// Free-form metadata for operators.
    pub metadata: Value,
}

impl CacheEntry {
    /// Priority of this entry when the eviction engine ranks the tail.
    #[must_use]
    pub const fn priority(&self) -> i64 {
        self.cause.base_priority()
    }
}

/// Aggregate view of the tracker returned by `stats`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheStatistics {
    /// Bytes tracked in `staging` or `active` rows.
    pub total_size_bytes: u64,
    /// Configured fast-tier size limit.
    pub limit_bytes: u64,
    /// Usage as a percentage of the limit.
    pub used_percent: f64,
    /// Number of `active` rows.
    pub file_count: u64,
    /// Number of `staging` rows.
    pub staging_count: u64,
    /// Number of `orphaned` rows.
    pub orphaned_count: u64,
    /// Number of `pending_removal` rows.
    pub pending_removal_count: u64,
    /// Health classification derived from usage.
    pub health: CacheHealth,
}

impl CacheStatistics {
    /// Classify fast-tier health from a usage percentage.
    #[must_use]
    pub fn health_for(used_percent: f64) -> CacheHealth {
        if used_percent >= 95.0 {
            CacheHealth::Critical
        } else if used_percent >= 80.0 {
            CacheHealth::Warning
        } else {
            CacheHealth::Healthy
        }
    }
}

/// A configured import list plus its refresh state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportList {
    /// Stable list identifier.
    pub id: Uuid,
    /// Declaration from the settings file or the command surface.
    pub definition: cachelot_config::ListDefinition,
    /// When the provider last refreshed successfully.
    pub last_refreshed: Option<DateTime<Utc>>,
    /// Whether the last refresh attempt failed.
    pub stale: bool,
}

/// One item produced by a list provider before library matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListItem {
    /// Title used for fallback matching.
    pub title: String,
    /// Release year used for fallback matching.
    pub year: Option<i32>,
    /// External identifiers (`imdb`, `tmdb`, ...) tried first.
    pub external_ids: BTreeMap<String, String>,
    /// Media classification.
    pub kind: MediaKind,
}

/// A potential cache target produced by the planner in one cycle phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Candidate {
    /// Path the candidate would occupy on the fast tier.
    pub logical_path: PathBuf,
    /// Size hint from the upstream, used for admission arithmetic.
    pub size_bytes_hint: u64,
    /// Priority base of the producing phase.
    pub base_priority: i64,
    /// Why the candidate exists.
    pub cause: CauseOperation,
    /// User the candidate is attributed to, when any.
    pub cause_user: Option<Uuid>,
    /// All users associated with the candidate after merging.
    pub attributions: BTreeSet<Uuid>,
    /// Bias inherited from the causing user.
    pub user_bias: i64,
    /// Bounded deduction derived from upstream staleness signals.
    pub staleness_score: i64,
}

impl Candidate {
    /// Priority after user bias and staleness deduction.
    #[must_use]
    pub const fn adjusted_priority(&self) -> i64 {
        self.base_priority + self.user_bias - self.staleness_score
    }

    /// Whether the candidate belongs to the never-rejected active class.
    #[must_use]
    pub const fn is_active_class(&self) -> bool {
        matches!(self.cause, CauseOperation::Active)
    }
}

/// Per-phase counters accumulated by a cycle.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseTotals {
    /// Items enumerated.
    pub scanned: u64,
    /// Files cached.
    pub cached: u64,
    /// Files restored.
    pub restored: u64,
    /// Files evicted.
    pub evicted: u64,
    /// Operations that failed.
    pub errors: u64,
}

/// Outcome of one relocation scheduled by a cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionOutcome {
    /// Logical path the action applied to.
    pub logical_path: PathBuf,
    /// Relocation direction.
    pub operation: OperationType,
    /// Whether the relocation committed.
    pub success: bool,
    /// Error kind when `success` is false.
    pub error: Option<String>,
    /// Bytes moved.
    pub bytes: u64,
}

/// Record of one finished cycle, retained for operator inspection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CycleResult {
    /// Cycle identifier.
    pub id: Uuid,
    /// When the cycle started.
    pub started_at: DateTime<Utc>,
    /// When the cycle finished.
    pub ended_at: DateTime<Utc>,
    /// Counters per executed phase.
    pub phase_totals: BTreeMap<CyclePhase, PhaseTotals>,
    /// Per-relocation outcomes.
    pub actions: Vec<ActionOutcome>,
    /// Whether the cycle bailed out early.
    pub aborted: bool,
}

/// Filter for tracker queries through the command surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryFilter {
    /// Restrict to one lifecycle state.
    pub status: Option<EntryStatus>,
    /// Restrict to one cause label (`ondeck`, `list:<name>`, ...).
    pub cause: Option<String>,
    /// Restrict to entries attributed to one user.
    pub user_id: Option<Uuid>,
    /// Restrict to logical paths under a prefix.
    pub path_prefix: Option<PathBuf>,
    /// Include terminal `removed` rows.
    pub include_removed: bool,
    /// Pagination offset.
    pub offset: u64,
    /// Pagination page size; `0` means the store default.
    pub limit: u64,
}

/// One page of query results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Total matching rows across all pages.
    pub total: u64,
    /// Offset this page starts at.
    pub offset: u64,
}

/// What a `search` query matches against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SearchScope {
    /// Match logical paths only.
    #[default]
    Paths,
    /// Match cause labels only (`ondeck`, `list:<name>`, ...).
    Causes,
    /// Match either.
    All,
}

/// Rendering format for tracker exports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    /// Comma-separated values with a header row.
    Csv,
    /// Pretty-printed JSON array.
    Json,
    /// Aligned human-readable table.
    Text,
}

/// Result of a `cleanup` command invocation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleanupReport {
    /// Tracker rows examined.
    pub scanned: u64,
    /// Orphaned rows found.
    pub orphaned_found: u64,
    /// Rows removed (orphan repair plus pruned audit rows).
    pub removed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_labels_round_trip() {
        let causes = [
            CauseOperation::Active,
            CauseOperation::OnDeck,
            CauseOperation::Watchlist,
            CauseOperation::List("trending".to_string()),
            CauseOperation::Manual,
            CauseOperation::Restore,
        ];
        for cause in causes {
            let label = cause.label();
            assert_eq!(CauseOperation::parse(&label), Some(cause));
        }
        assert!(CauseOperation::parse("bogus").is_none());
    }

    #[test]
    fn status_labels_round_trip() {
        let statuses = [
            EntryStatus::Staging,
            EntryStatus::Active,
            EntryStatus::Orphaned,
            EntryStatus::PendingRemoval,
            EntryStatus::Removed,
        ];
        for status in statuses {
            assert_eq!(EntryStatus::parse(status.as_str()), Some(status));
        }
        assert!(EntryStatus::parse("bogus").is_none());
    }

    #[test]
    fn class_ordering_survives_maximum_staleness() {
        let active = Candidate {
            logical_path: PathBuf::from("/library/a.mkv"),
            size_bytes_hint: 1,
            base_priority: PRIORITY_ACTIVE,
            cause: CauseOperation::Active,
            cause_user: None,
            attributions: BTreeSet::new(),
            user_bias: -50,
            staleness_score: STALENESS_CAP,
        };
        let watchlist = Candidate {
            logical_path: PathBuf::from("/library/b.mkv"),
            size_bytes_hint: 1,
            base_priority: PRIORITY_WATCHLIST,
            cause: CauseOperation::Watchlist,
            cause_user: None,
            attributions: BTreeSet::new(),
            user_bias: 50,
            staleness_score: 0,
        };
        assert!(active.adjusted_priority() > watchlist.adjusted_priority());
    }

    #[test]
    fn health_thresholds() {
        assert_eq!(CacheStatistics::health_for(10.0), CacheHealth::Healthy);
        assert_eq!(CacheStatistics::health_for(80.0), CacheHealth::Warning);
        assert_eq!(CacheStatistics::health_for(95.0), CacheHealth::Critical);
        assert_eq!(CacheStatistics::health_for(120.0), CacheHealth::Critical);
    }
}
