//! End-to-end cycle tests over an in-memory upstream fake and a real
//! temporary filesystem.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use cachelot_config::{
    ActivityWindows, ListDefinition, LogFormat, ReconcileSettings, RetentionWindows, Settings,
    SettingsSnapshot, UpstreamSettings,
};
use cachelot_core::error::UpstreamResult;
use cachelot_core::model::{
    CauseOperation, EntryStatus, ExportFormat, ListItem, MediaKind, MediaRef, OnDeckSettings,
    PlaybackSession, QueryFilter, SearchScope, User, UserKind, UserSourceSettings,
};
use cachelot_core::service::{CacheCommands, MediaServer};
use cachelot_data::TrackerStore;
use cachelot_events::{Event, EventBus, OperationType};
use cachelot_fsops::{LockMode, Relocator, RelocatorConfig};
use cachelot_telemetry::Metrics;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::orchestrator::{CacheOrchestrator, OrchestratorDeps};

struct FakeServer {
    users: Vec<User>,
    ondeck: HashMap<Uuid, Vec<MediaRef>>,
    sessions: Vec<PlaybackSession>,
}

#[async_trait]
impl MediaServer for FakeServer {
    async fn list_users(&self) -> UpstreamResult<Vec<User>> {
        Ok(self.users.clone())
    }

    async fn on_deck(
        &self,
        user: &User,
        _episodes_ahead: u32,
        _max_stale_days: u32,
    ) -> UpstreamResult<Vec<MediaRef>> {
        Ok(self.ondeck.get(&user.id).cloned().unwrap_or_default())
    }

    async fn watchlist(
        &self,
        _user: &User,
        _episodes_per_show: u32,
        _max_available_days: u32,
    ) -> UpstreamResult<Vec<MediaRef>> {
        Ok(Vec::new())
    }

    async fn active_sessions(&self) -> UpstreamResult<Vec<PlaybackSession>> {
        Ok(self.sessions.clone())
    }

    async fn match_library(&self, _item: &ListItem) -> UpstreamResult<Option<MediaRef>> {
        Ok(None)
    }
}

fn viewer(episodes_ahead: u32) -> User {
    User {
        id: Uuid::new_v4(),
        display_name: "owner".to_string(),
        kind: UserKind::Owner,
        token_opaque: "tok".to_string(),
        last_seen: None,
        enabled: true,
        priority_bias: 0,
        settings: UserSourceSettings {
            ondeck: OnDeckSettings {
                enabled: true,
                episodes_ahead,
                max_stale_days: 0,
            },
            ..UserSourceSettings::default()
        },
    }
}

fn media(path: &Path, size: u64) -> MediaRef {
    MediaRef {
        logical_path: path.to_path_buf(),
        size_bytes_hint: size,
        upstream_id: path.display().to_string(),
        kind: MediaKind::Movie,
        last_watched_at: None,
        available_since: None,
    }
}

struct Harness {
    _dir: TempDir,
    slow: PathBuf,
    store: TrackerStore,
    events: EventBus,
    relocator: Arc<Relocator>,
    orchestrator: Arc<CacheOrchestrator>,
}

async fn harness(
    limit: u64,
    retention: RetentionWindows,
    server: FakeServer,
) -> Result<Harness> {
    let dir = tempfile::tempdir()?;
    let slow = dir.path().join("slow/media");
    let fast = dir.path().join("fast");
    let config = dir.path().join("config");
    std::fs::create_dir_all(&slow)?;
    std::fs::create_dir_all(&fast)?;
    std::fs::create_dir_all(&config)?;

    let settings = Settings {
        fast_root: fast.clone(),
        slow_roots: vec![slow.clone()],
        fast_limit_bytes: limit,
        cycle_period_s: 300,
        reconcile_period_s: 3_600,
        max_concurrent_relocations: 2,
        subscriber_queue_depth: 512,
        cycle_history: 10,
        upstream: UpstreamSettings {
            base_url: "http://fake.local".to_string(),
            token: "tok".to_string(),
            min_gap_ms: 1_000,
            max_per_minute: 30,
            timeout_s: 30,
            max_retries: 3,
            retry_delay_s: 2,
            token_cache_hours: 24,
        },
        activity: ActivityWindows::default(),
        retention,
        lists: Vec::<ListDefinition>::new(),
        reconcile: ReconcileSettings::default(),
        log_level: "info".to_string(),
        log_format: LogFormat::Pretty,
    };
    let snapshot = SettingsSnapshot {
        settings,
        config_dir: config,
    };

    let store = TrackerStore::open(&snapshot.tracker_path()).await?;
    let events = EventBus::with_queue_depth(512);
    let metrics = Metrics::new()?;
    let relocator = Arc::new(Relocator::new(
        events.clone(),
        metrics.clone(),
        store.clone(),
        RelocatorConfig {
            fast_root: fast,
            limit_bytes: limit,
            max_concurrent: 2,
        },
    ));
    let orchestrator = CacheOrchestrator::new(OrchestratorDeps {
        snapshot,
        events: events.clone(),
        metrics,
        store: store.clone(),
        relocator: Arc::clone(&relocator),
        server: Arc::new(server),
    });

    Ok(Harness {
        _dir: dir,
        slow,
        store,
        events,
        relocator,
        orchestrator,
    })
}

fn write_file(dir: &Path, name: &str, size: usize) -> Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, vec![0u8; size])?;
    Ok(path)
}

#[tokio::test]
async fn cold_start_caches_what_fits_and_rejects_the_rest() -> Result<()> {
    // Limit 10_000 bytes; Up Next A(2000), B(3000), C(6000).
    let user = viewer(3);
    let dir = tempfile::tempdir()?;
    let slow = dir.path().join("premade");
    std::fs::create_dir_all(&slow)?;
    let a = write_file(&slow, "a.mkv", 2_000)?;
    let b = write_file(&slow, "b.mkv", 3_000)?;
    let c = write_file(&slow, "c.mkv", 6_000)?;

    let server = FakeServer {
        users: vec![user.clone()],
        ondeck: HashMap::from([(
            user.id,
            vec![media(&a, 2_000), media(&b, 3_000), media(&c, 6_000)],
        )]),
        sessions: Vec::new(),
    };
    let h = harness(10_000, RetentionWindows::default(), server).await?;
    let mut stream = h.events.subscribe();

    h.orchestrator.run_one_cycle(Uuid::new_v4()).await;

    let a_entry = h.store.find_by_path(&a).await?.expect("A cached");
    let b_entry = h.store.find_by_path(&b).await?.expect("B cached");
    assert_eq!(a_entry.status, EntryStatus::Active);
    assert_eq!(b_entry.status, EntryStatus::Active);
    assert!(h.store.find_by_path(&c).await?.is_none(), "C rejected");

    let stats = h.orchestrator.stats().await?;
    assert_eq!(stats.total_size_bytes, 5_000);
    assert!((stats.used_percent - 50.0).abs() < f64::EPSILON);

    let mut successes = 0;
    let mut cycle_completes = 0;
    while let Some(envelope) =
        tokio::time::timeout(std::time::Duration::from_millis(200), stream.next())
            .await
            .ok()
            .flatten()
    {
        match envelope.event {
            Event::OperationComplete {
                operation_type: OperationType::Cache,
                success: true,
                ..
            } => successes += 1,
            Event::CycleComplete { aborted, .. } => {
                assert!(!aborted);
                cycle_completes += 1;
            }
            _ => {}
        }
    }
    assert_eq!(successes, 2, "exactly two files cached");
    assert_eq!(cycle_completes, 1);

    let cycles = h.orchestrator.recent_cycles().await?;
    assert_eq!(cycles.len(), 1);
    assert!(!cycles[0].aborted);
    Ok(())
}

#[tokio::test]
async fn eviction_under_pressure_restores_the_coldest_entry() -> Result<()> {
    // X and Y (4000 each, watchlist) fill 8000 of 10_000; Z (4000, Up Next)
    // forces one eviction, tie-broken by access count ascending.
    let user = viewer(1);
    let dir = tempfile::tempdir()?;
    let premade = dir.path().join("premade");
    std::fs::create_dir_all(&premade)?;
    let z = write_file(&premade, "z.mkv", 4_000)?;

    let server = FakeServer {
        users: vec![user.clone()],
        ondeck: HashMap::from([(user.id, vec![media(&z, 4_000)])]),
        sessions: Vec::new(),
    };
    let retention = RetentionWindows {
        watchlist_days: 0,
        ..RetentionWindows::default()
    };
    let h = harness(10_000, retention, server).await?;

    let x = write_file(&h.slow, "x.mkv", 4_000)?;
    let y = write_file(&h.slow, "y.mkv", 4_000)?;
    let cancel = CancellationToken::new();
    let x_entry = h
        .relocator
        .cache_to(&x, CauseOperation::Watchlist, None, LockMode::Block, &cancel)
        .await?;
    let y_entry = h
        .relocator
        .cache_to(&y, CauseOperation::Watchlist, None, LockMode::Block, &cancel)
        .await?;
    h.store.touch(y_entry.id, None).await?;

    h.orchestrator.run_one_cycle(Uuid::new_v4()).await;

    let z_entry = h.store.find_by_path(&z).await?.expect("Z cached");
    assert_eq!(z_entry.status, EntryStatus::Active);
    let x_row = h.store.get(x_entry.id).await?.expect("X retained for audit");
    assert_eq!(x_row.status, EntryStatus::Removed, "colder X was evicted");
    let y_row = h.store.get(y_entry.id).await?.expect("Y still tracked");
    assert_eq!(y_row.status, EntryStatus::Active);

    let stats = h.orchestrator.stats().await?;
    assert_eq!(stats.total_size_bytes, 8_000);
    Ok(())
}

#[tokio::test]
async fn run_cycle_is_idempotent_while_queued() -> Result<()> {
    let server = FakeServer {
        users: Vec::new(),
        ondeck: HashMap::new(),
        sessions: Vec::new(),
    };
    let h = harness(10_000, RetentionWindows::default(), server).await?;

    let first = h.orchestrator.run_cycle(None).await?;
    let second = h.orchestrator.run_cycle(None).await?;
    assert_eq!(first, second, "queued cycle id is reused");
    Ok(())
}

#[tokio::test]
async fn cleanup_repairs_orphans_exactly_once() -> Result<()> {
    let server = FakeServer {
        users: Vec::new(),
        ondeck: HashMap::new(),
        sessions: Vec::new(),
    };
    let h = harness(10_000, RetentionWindows::default(), server).await?;
    let payload = vec![5u8; 1_000];
    let logical = h.slow.join("movie.mkv");
    std::fs::write(&logical, &payload)?;
    let cancel = CancellationToken::new();

    let entry = h
        .relocator
        .cache_to(&logical, CauseOperation::Manual, None, LockMode::Block, &cancel)
        .await?;
    std::fs::remove_file(&entry.fast_tier_path)?;
    h.relocator.reconcile(false).await?;

    let report = h.orchestrator.cleanup(true, None).await?;
    assert_eq!(report.orphaned_found, 1);
    assert!(report.removed >= 1);
    assert_eq!(std::fs::read(&logical)?, payload, "original restored");

    let again = h.orchestrator.cleanup(true, None).await?;
    assert_eq!(again.orphaned_found, 0, "cleanup is idempotent");
    Ok(())
}

#[tokio::test]
async fn remove_file_command_is_safe_to_retry() -> Result<()> {
    let server = FakeServer {
        users: Vec::new(),
        ondeck: HashMap::new(),
        sessions: Vec::new(),
    };
    let h = harness(10_000, RetentionWindows::default(), server).await?;
    let logical = write_file(&h.slow, "movie.mkv", 500)?;
    let cancel = CancellationToken::new();

    let entry = h
        .relocator
        .cache_to(&logical, CauseOperation::Manual, None, LockMode::Block, &cancel)
        .await?;

    h.orchestrator
        .remove_file(entry.id, "operator request".to_string(), None)
        .await?;
    assert!(std::fs::symlink_metadata(&logical)?.is_file());

    // The retry observes the terminal state and succeeds quietly.
    h.orchestrator
        .remove_file(entry.id, "operator request".to_string(), None)
        .await?;
    Ok(())
}

#[tokio::test]
async fn query_search_and_export_agree() -> Result<()> {
    let server = FakeServer {
        users: Vec::new(),
        ondeck: HashMap::new(),
        sessions: Vec::new(),
    };
    let h = harness(10_000, RetentionWindows::default(), server).await?;
    let logical = write_file(&h.slow, "unique-name.mkv", 700)?;
    let cancel = CancellationToken::new();
    h.relocator
        .cache_to(&logical, CauseOperation::Manual, None, LockMode::Block, &cancel)
        .await?;

    let page = h.orchestrator.query(QueryFilter::default()).await?;
    assert_eq!(page.total, 1);

    let found = h
        .orchestrator
        .search("unique-name".to_string(), SearchScope::Paths, 10, false)
        .await?;
    assert_eq!(found.len(), 1);

    let by_cause = h
        .orchestrator
        .search("manual".to_string(), SearchScope::Causes, 10, false)
        .await?;
    assert_eq!(by_cause.len(), 1);

    let csv = h
        .orchestrator
        .export(ExportFormat::Csv, QueryFilter::default())
        .await?;
    let text = String::from_utf8(csv)?;
    assert!(text.contains("unique-name.mkv"));
    assert!(text.starts_with("logical_path,"));
    Ok(())
}
