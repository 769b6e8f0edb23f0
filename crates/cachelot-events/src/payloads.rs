//! Typed event payloads shared across the platform.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier assigned to each event emitted by the platform.
pub type EventId = u64;

/// Default per-subscriber queue depth for the broadcast channel.
pub const DEFAULT_SUBSCRIBER_QUEUE_DEPTH: usize = 256;

/// Relocation direction reported in operation events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Copy a file from the slow tier onto the fast tier.
    Cache,
    /// Copy a cached file back to the slow tier and drop the fast copy.
    Restore,
    /// Restore driven by the eviction engine rather than an operator.
    Evict,
}

impl OperationType {
    /// Stable lowercase label for logs and serialized payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Restore => "restore",
            Self::Evict => "evict",
        }
    }
}

/// Severity attached to `log` events on the bus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Diagnostic detail for operators chasing a specific problem.
    Debug,
    /// Routine operational messages.
    Info,
    /// Conditions worth attention that did not fail an operation.
    Warning,
    /// Operation failures.
    Error,
}

impl LogLevel {
    /// Stable lowercase label for serialized payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// Health classification of the fast tier reported in `stats` events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheHealth {
    /// Usage comfortably under the configured limit.
    Healthy,
    /// Usage near or transiently above the limit.
    Warning,
    /// Usage critically above the limit; intervention likely required.
    Critical,
}

impl CacheHealth {
    /// Stable lowercase label for serialized payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Lifecycle state reported in `status` events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Bootstrap is running; commands are not yet accepted.
    Starting,
    /// No cycle in flight.
    Idle,
    /// A cache cycle is in progress.
    CycleRunning,
    /// Shutdown has been requested; in-flight relocations are draining.
    ShuttingDown,
}

impl ServiceState {
    /// Stable lowercase label for serialized payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::CycleRunning => "cycle_running",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// Phases executed by the cycle orchestrator, in order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    /// Refresh the user roster from the upstream server.
    DiscoverUsers,
    /// Enumerate in-flight playback sessions.
    Active,
    /// Enumerate per-user Up Next queues.
    OnDeck,
    /// Enumerate per-user watchlists.
    Watchlist,
    /// Refresh import lists and match them against the library.
    Lists,
    /// Apply per-source retention clocks to tracked entries.
    Retention,
    /// Enforce the fast-tier size limit.
    Eviction,
    /// Verify tracker rows against the filesystem.
    Reconcile,
}

impl CyclePhase {
    /// Stable lowercase label for serialized payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DiscoverUsers => "discover_users",
            Self::Active => "active",
            Self::OnDeck => "ondeck",
            Self::Watchlist => "watchlist",
            Self::Lists => "lists",
            Self::Retention => "retention",
            Self::Eviction => "eviction",
            Self::Reconcile => "reconcile",
        }
    }
}

/// Snapshot of one upstream playback session carried by session events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionInfo {
    /// Opaque upstream identifier for the session.
    pub session_key: String,
    /// User the session belongs to, when known.
    pub user_id: Option<Uuid>,
    /// Library path of the file being played.
    pub logical_path: String,
    /// Whether the path currently resolves to the fast tier.
    pub playing_from_fast: bool,
}

/// Typed domain events surfaced across the system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Service lifecycle changed.
    Status {
        /// New lifecycle state.
        state: ServiceState,
    },
    /// Fast-tier usage snapshot.
    Stats {
        /// Bytes currently staged or active on the fast tier.
        total_size_bytes: u64,
        /// Configured fast-tier size limit in bytes.
        limit_bytes: u64,
        /// Usage as a percentage of the limit.
        used_percent: f64,
        /// Number of tracked files on the fast tier.
        file_count: u64,
        /// Health classification derived from usage.
        health: CacheHealth,
    },
    /// Periodic progress update emitted while a relocation is copying.
    OperationProgress {
        /// Identifier for the relocation operation.
        operation_id: Uuid,
        /// Direction of the relocation.
        operation_type: OperationType,
        /// File name (final path component) being relocated.
        file_name: String,
        /// Completion percentage in `[0, 100]`.
        progress_percent: f64,
        /// Bytes copied so far.
        bytes_transferred: u64,
        /// Total bytes to copy.
        bytes_total: u64,
        /// Observed copy throughput.
        speed_bytes_per_sec: u64,
        /// Estimated seconds remaining, when computable.
        eta_seconds: Option<u64>,
    },
    /// A relocation finished, successfully or not.
    OperationComplete {
        /// Identifier for the relocation operation.
        operation_id: Uuid,
        /// Direction of the relocation.
        operation_type: OperationType,
        /// Logical path the operation applied to.
        file_path: String,
        /// Whether the operation committed.
        success: bool,
        /// Error kind when `success` is false.
        error: Option<String>,
        /// Wall-clock duration of the operation.
        duration_seconds: f64,
        /// Bytes copied before completion or failure.
        bytes_transferred: u64,
    },
    /// A playback session appeared upstream.
    SessionStart {
        /// Snapshot of the new session.
        session: SessionInfo,
    },
    /// A known playback session changed.
    SessionUpdate {
        /// Updated session snapshot.
        session: SessionInfo,
    },
    /// A playback session ended upstream.
    SessionEnd {
        /// Opaque upstream identifier for the ended session.
        session_key: String,
    },
    /// Operator-relevant message mirrored onto the bus.
    Log {
        /// Message severity.
        level: LogLevel,
        /// Human-readable message.
        message: String,
        /// Component that produced the message.
        source: String,
    },
    /// A cycle phase began.
    CycleStart {
        /// Identifier of the running cycle.
        cycle_id: Uuid,
        /// Phase that is starting.
        phase: CyclePhase,
        /// Items the phase expects to process, when known.
        items_total: u64,
    },
    /// Progress within a cycle phase.
    CycleProgress {
        /// Identifier of the running cycle.
        cycle_id: Uuid,
        /// Phase in progress.
        phase: CyclePhase,
        /// Items processed so far in this phase.
        items_processed: u64,
        /// Items the phase expects to process, when known.
        items_total: u64,
        /// Files cached so far in this cycle.
        files_cached: u64,
        /// Files restored so far in this cycle.
        files_restored: u64,
    },
    /// A cycle finished.
    CycleComplete {
        /// Identifier of the finished cycle.
        cycle_id: Uuid,
        /// Last phase that ran.
        phase: CyclePhase,
        /// Items processed across the cycle.
        items_processed: u64,
        /// Items scheduled across the cycle.
        items_total: u64,
        /// Files cached by the cycle.
        files_cached: u64,
        /// Files restored by the cycle.
        files_restored: u64,
        /// Whether the cycle bailed out early (error budget or cancel).
        aborted: bool,
    },
}

impl Event {
    /// Machine-friendly discriminator for transports and metrics labels.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Stats { .. } => "stats",
            Self::OperationProgress { .. } => "operation_progress",
            Self::OperationComplete { .. } => "operation_complete",
            Self::SessionStart { .. } => "session_start",
            Self::SessionUpdate { .. } => "session_update",
            Self::SessionEnd { .. } => "session_end",
            Self::Log { .. } => "log",
            Self::CycleStart { .. } => "cycle_start",
            Self::CycleProgress { .. } => "cycle_progress",
            Self::CycleComplete { .. } => "cycle_complete",
        }
    }
}

/// Metadata wrapper around events. Each envelope tracks the event id and
/// emission timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    /// Monotonic identifier assigned to the wrapped event.
    pub id: EventId,
    /// Timestamp recording when the envelope was produced.
    pub timestamp: DateTime<Utc>,
    /// Wrapped event payload.
    pub event: Event,
}
