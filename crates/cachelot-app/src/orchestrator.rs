//! Cycle orchestration and the typed command surface.
//!
//! One scheduler task owns the cycle loop. Triggers (periodic tick or
//! `run_cycle`) are absorbed into a single queued cycle while one is in
//! flight, so cycles never overlap. Each cycle walks the fixed phase order,
//! plans retention and admission in one single-threaded step, then executes
//! relocations through the bounded relocator pool.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cachelot_config::{ListDefinition, SettingsSnapshot};
use cachelot_core::admission::{AdmissionInput, PlannedRestore, RestoreReason, build_plan};
use cachelot_core::error::{CommandError, CommandResult};
use cachelot_core::model::{
    ActionOutcome, CacheEntry, CacheStatistics, Candidate, CleanupReport, CycleResult,
    EntryStatus, ExportFormat, ImportList, Page, PhaseTotals, QueryFilter, SearchScope, User,
    UserSettingsPatch,
};
use cachelot_core::planner;
use cachelot_core::service::{CacheCommands, CacheInspector, MediaServer};
use cachelot_data::TrackerStore;
use cachelot_events::{
    CacheHealth, CyclePhase, Event, EventBus, LogLevel, OperationType, ServiceState, SessionInfo,
};
use cachelot_fsops::{LockMode, Relocator};
use cachelot_telemetry::Metrics;
use cachelot_upstream::provider_for;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cycles::CycleLog;

const USER_BIAS_BOUND: i32 = 50;
const ERROR_BUDGET_MIN_OPS: u64 = 4;
const DEFAULT_SEARCH_LIMIT: u64 = 50;

#[derive(Default)]
struct CycleControl {
    running: bool,
    queued: Option<Uuid>,
}

#[derive(Default)]
struct CycleCounters {
    items_processed: u64,
    items_total: u64,
    files_cached: u64,
    files_restored: u64,
}

/// Dependencies handed to the orchestrator at construction.
pub struct OrchestratorDeps {
    /// Immutable settings snapshot.
    pub snapshot: SettingsSnapshot,
    /// Shared event bus.
    pub events: EventBus,
    /// Shared metrics registry.
    pub metrics: Metrics,
    /// Tracker store.
    pub store: TrackerStore,
    /// Relocation service.
    pub relocator: Arc<Relocator>,
    /// Upstream media server client.
    pub server: Arc<dyn MediaServer>,
}

/// Process-wide scheduler sequencing cache cycles and serving commands.
pub struct CacheOrchestrator {
    snapshot: SettingsSnapshot,
    events: EventBus,
    metrics: Metrics,
    store: TrackerStore,
    relocator: Arc<Relocator>,
    server: Arc<dyn MediaServer>,
    cycle_log: CycleLog,
    shutdown: CancellationToken,
    control: Mutex<CycleControl>,
    wakeup: Notify,
    previous_sessions: Mutex<HashMap<String, SessionInfo>>,
    last_candidates: Mutex<Vec<Candidate>>,
}

impl CacheOrchestrator {
    /// Construct the orchestrator.
    #[must_use]
    pub fn new(deps: OrchestratorDeps) -> Arc<Self> {
        let cycle_log = CycleLog::new(
            deps.snapshot.cycles_path(),
            deps.snapshot.settings.cycle_history,
        );
        Arc::new(Self {
            snapshot: deps.snapshot,
            events: deps.events,
            metrics: deps.metrics,
            store: deps.store,
            relocator: deps.relocator,
            server: deps.server,
            cycle_log,
            shutdown: CancellationToken::new(),
            control: Mutex::new(CycleControl::default()),
            wakeup: Notify::new(),
            previous_sessions: Mutex::new(HashMap::new()),
            last_candidates: Mutex::new(Vec::new()),
        })
    }

    /// Token cancelled when shutdown begins; children are handed to
    /// relocations so they can roll back between chunks.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Request an orderly shutdown of the scheduler loops.
    pub fn begin_shutdown(&self) {
        self.publish(Event::Status {
            state: ServiceState::ShuttingDown,
        });
        self.shutdown.cancel();
    }

    /// Scheduler loop: runs cycles on the configured period and on demand.
    /// Returns when shutdown is requested and the in-flight cycle finished.
    pub async fn run_scheduler(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.snapshot.settings.cycle_period());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; that is the warmup cycle.
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.queue_cycle();
                }
                () = self.wakeup.notified() => {}
                () = self.shutdown.cancelled() => break,
            }

            while let Some(cycle_id) = self.take_queued() {
                self.run_one_cycle(cycle_id).await;
                if self.shutdown.is_cancelled() {
                    break;
                }
            }
            if self.shutdown.is_cancelled() {
                break;
            }
        }
        info!("cycle scheduler stopped");
    }

    /// Standalone reconciler loop, independent of the cycle cadence.
    pub async fn run_reconciler(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.snapshot.settings.reconcile_period());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self
                        .relocator
                        .reconcile(self.snapshot.settings.reconcile.delete_unknown)
                        .await
                    {
                        Ok(report) => debug!(
                            verified = report.verified,
                            orphaned = report.orphaned,
                            unknown = report.unknown,
                            "periodic reconcile finished"
                        ),
                        Err(err) => warn!(error = %err, "periodic reconcile failed"),
                    }
                }
                () = self.shutdown.cancelled() => break,
            }
        }
        info!("reconciler stopped");
    }

    fn queue_cycle(&self) -> Uuid {
        let mut control = self.lock_control();
        if let Some(id) = control.queued {
            return id;
        }
        let id = Uuid::new_v4();
        control.queued = Some(id);
        drop(control);
        self.wakeup.notify_one();
        id
    }

    fn take_queued(&self) -> Option<Uuid> {
        let mut control = self.lock_control();
        if control.running {
            return None;
        }
        let id = control.queued.take();
        if id.is_some() {
            control.running = true;
        }
        id
    }

    fn finish_cycle(&self) {
        self.lock_control().running = false;
    }

    pub(crate) async fn run_one_cycle(&self, cycle_id: Uuid) {
        let started_at = Utc::now();
        self.publish(Event::Status {
            state: ServiceState::CycleRunning,
        });
        info!(cycle = %cycle_id, "cycle started");

        let mut phase_totals: BTreeMap<CyclePhase, PhaseTotals> = BTreeMap::new();
        let mut actions: Vec<ActionOutcome> = Vec::new();
        let mut counters = CycleCounters::default();
        let cancel = self.shutdown.child_token();

        let users = self
            .phase_discover_users(cycle_id, &mut phase_totals)
            .await;

        let mut candidates: Vec<Candidate> = Vec::new();
        let mut session_paths: HashSet<PathBuf> = HashSet::new();
        let mut aborted = cancel.is_cancelled();

        if !aborted {
            let (active, paths) = self
                .phase_active(cycle_id, &users, &mut phase_totals)
                .await;
            candidates.extend(active);
            session_paths = paths;
            aborted = cancel.is_cancelled();
        }
        if !aborted {
            let ondeck = self
                .phase_per_user(cycle_id, CyclePhase::OnDeck, &users, &mut phase_totals)
                .await;
            candidates.extend(ondeck);
            aborted = cancel.is_cancelled();
        }
        if !aborted {
            let watchlist = self
                .phase_per_user(cycle_id, CyclePhase::Watchlist, &users, &mut phase_totals)
                .await;
            candidates.extend(watchlist);
            aborted = cancel.is_cancelled();
        }
        if !aborted {
            let lists = self
                .phase_lists(cycle_id, &mut phase_totals)
                .await;
            candidates.extend(lists);
            aborted = cancel.is_cancelled();
        }

        let merged = planner::merge(candidates);
        *self.lock_candidates() = merged.clone();
        counters.items_total = merged.len() as u64;

        if !aborted {
            aborted = self
                .phase_plan_and_execute(
                    cycle_id,
                    &merged,
                    &session_paths,
                    &mut phase_totals,
                    &mut actions,
                    &mut counters,
                    &cancel,
                )
                .await;
        }

        if !aborted {
            self.phase_reconcile(cycle_id, &mut phase_totals).await;
        }

        let last_phase = phase_totals
            .keys()
            .next_back()
            .copied()
            .unwrap_or(CyclePhase::DiscoverUsers);
        let result = CycleResult {
            id: cycle_id,
            started_at,
            ended_at: Utc::now(),
            phase_totals,
            actions,
            aborted,
        };
        if let Err(err) = self.cycle_log.append(result) {
            warn!(error = %err, "failed to persist cycle result");
        }
        self.metrics
            .inc_cycle(if aborted { "aborted" } else { "completed" });
        match self
            .store
            .stats(self.snapshot.settings.fast_limit_bytes)
            .await
        {
            Ok(stats) => self.publish(Event::Stats {
                total_size_bytes: stats.total_size_bytes,
                limit_bytes: stats.limit_bytes,
                used_percent: stats.used_percent,
                file_count: stats.file_count,
                health: stats.health,
            }),
            Err(err) => warn!(error = %err, "failed to compute end-of-cycle stats"),
        }
        self.publish(Event::CycleComplete {
            cycle_id,
            phase: last_phase,
            items_processed: counters.items_processed,
            items_total: counters.items_total,
            files_cached: counters.files_cached,
            files_restored: counters.files_restored,
            aborted,
        });
        self.publish(Event::Status {
            state: ServiceState::Idle,
        });
        info!(
            cycle = %cycle_id,
            cached = counters.files_cached,
            restored = counters.files_restored,
            aborted,
            "cycle finished"
        );
        self.finish_cycle();
    }

    async fn phase_discover_users(
        &self,
        cycle_id: Uuid,
        phase_totals: &mut BTreeMap<CyclePhase, PhaseTotals>,
    ) -> Vec<User> {
        self.phase_start(cycle_id, CyclePhase::DiscoverUsers, 0);
        let mut totals = PhaseTotals::default();

        match self.server.list_users().await {
            Ok(discovered) => {
                totals.scanned = discovered.len() as u64;
                for user in &discovered {
                    if let Err(err) = self.store.upsert_user(user).await {
                        totals.errors += 1;
                        warn!(error = %err, user = %user.display_name, "failed to upsert user");
                    }
                }
            }
            Err(err) => {
                totals.errors += 1;
                warn!(error = %err, "user discovery failed; using stored roster");
                self.log_event(
                    LogLevel::Warning,
                    format!("user discovery failed: {err}"),
                    "cycle",
                );
            }
        }

        let users = match self.store.users().await {
            Ok(users) => users,
            Err(err) => {
                totals.errors += 1;
                warn!(error = %err, "failed to load stored users");
                Vec::new()
            }
        };
        phase_totals.insert(CyclePhase::DiscoverUsers, totals);
        users
    }

    async fn phase_active(
        &self,
        cycle_id: Uuid,
        users: &[User],
        phase_totals: &mut BTreeMap<CyclePhase, PhaseTotals>,
    ) -> (Vec<Candidate>, HashSet<PathBuf>) {
        self.phase_start(cycle_id, CyclePhase::Active, 0);
        let mut totals = PhaseTotals::default();

        let sessions = match self.server.active_sessions().await {
            Ok(sessions) => sessions,
            Err(err) => {
                totals.errors += 1;
                warn!(error = %err, "session enumeration failed");
                phase_totals.insert(CyclePhase::Active, totals);
                return (Vec::new(), HashSet::new());
            }
        };
        totals.scanned = sessions.len() as u64;

        // Diff against the previous poll so subscribers can track sessions.
        let mut current: HashMap<String, SessionInfo> = HashMap::new();
        for session in &sessions {
            current.insert(
                session.session_key.clone(),
                SessionInfo {
                    session_key: session.session_key.clone(),
                    user_id: session.user_id,
                    logical_path: session.media.logical_path.display().to_string(),
                    playing_from_fast: session.playing_from_fast,
                },
            );
        }
        {
            let mut previous = self.lock_sessions();
            for (key, session) in &current {
                match previous.get(key) {
                    None => self.publish(Event::SessionStart {
                        session: session.clone(),
                    }),
                    Some(old) if old != session => self.publish(Event::SessionUpdate {
                        session: session.clone(),
                    }),
                    Some(_) => {}
                }
            }
            for key in previous.keys() {
                if !current.contains_key(key) {
                    self.publish(Event::SessionEnd {
                        session_key: key.clone(),
                    });
                }
            }
            *previous = current;
        }

        let mut session_paths = HashSet::new();
        for session in &sessions {
            session_paths.insert(session.media.logical_path.clone());
            // Keep access bookkeeping for files already served from fast.
            if session.playing_from_fast
                && let Ok(Some(entry)) =
                    self.store.find_by_path(&session.media.logical_path).await
                && let Err(err) = self.store.touch(entry.id, session.user_id).await
            {
                warn!(error = %err, path = %session.media.logical_path.display(),
                      "failed to touch session entry");
            }
        }

        let candidates = planner::active_candidates(&sessions, users);
        phase_totals.insert(CyclePhase::Active, totals);
        (candidates, session_paths)
    }

    async fn phase_per_user(
        &self,
        cycle_id: Uuid,
        phase: CyclePhase,
        users: &[User],
        phase_totals: &mut BTreeMap<CyclePhase, PhaseTotals>,
    ) -> Vec<Candidate> {
        let now = Utc::now();
        let windows = &self.snapshot.settings.activity;
        let eligible: Vec<&User> = users
            .iter()
            .filter(|user| planner::user_is_active(user, windows, now))
            .collect();
        self.phase_start(cycle_id, phase, eligible.len() as u64);
        let mut totals = PhaseTotals::default();
        let mut candidates = Vec::new();

        for (index, user) in eligible.iter().enumerate() {
            if self.shutdown.is_cancelled() {
                break;
            }
            let produced = match phase {
                CyclePhase::OnDeck => {
                    planner::ondeck_candidates(self.server.as_ref(), user, now).await
                }
                _ => planner::watchlist_candidates(self.server.as_ref(), user, now).await,
            };
            match produced {
                Ok(mut found) => {
                    totals.scanned += found.len() as u64;
                    candidates.append(&mut found);
                }
                Err(err) => {
                    totals.errors += 1;
                    warn!(error = %err, user = %user.display_name, phase = phase.as_str(),
                          "per-user enumeration failed");
                }
            }
            self.publish(Event::CycleProgress {
                cycle_id,
                phase,
                items_processed: (index + 1) as u64,
                items_total: eligible.len() as u64,
                files_cached: 0,
                files_restored: 0,
            });
        }

        phase_totals.insert(phase, totals);
        candidates
    }

    async fn phase_lists(
        &self,
        cycle_id: Uuid,
        phase_totals: &mut BTreeMap<CyclePhase, PhaseTotals>,
    ) -> Vec<Candidate> {
        let lists = match self.store.lists().await {
            Ok(lists) => lists,
            Err(err) => {
                warn!(error = %err, "failed to load import lists");
                Vec::new()
            }
        };
        let now = Utc::now();
        let due: Vec<ImportList> = lists
            .into_iter()
            .filter(|list| {
                list.stale
                    || list.last_refreshed.is_none_or(|at| {
                        (now - at).to_std().unwrap_or_default()
                            >= list.definition.refresh_period()
                    })
            })
            .collect();
        self.phase_start(cycle_id, CyclePhase::Lists, due.len() as u64);
        let mut totals = PhaseTotals::default();
        let mut candidates = Vec::new();

        for list in &due {
            if self.shutdown.is_cancelled() {
                break;
            }
            let provider = provider_for(&list.definition, &self.snapshot.settings.upstream);
            match planner::list_candidates(self.server.as_ref(), provider.as_ref(), list).await {
                Ok(mut found) => {
                    totals.scanned += found.len() as u64;
                    candidates.append(&mut found);
                    if let Err(err) = self
                        .store
                        .mark_list_refresh(list.id, Some(Utc::now()), false)
                        .await
                    {
                        warn!(error = %err, list = %list.definition.name,
                              "failed to record list refresh");
                    }
                }
                Err(err) => {
                    totals.errors += 1;
                    self.metrics.inc_provider_failure(list.definition.provider.as_str());
                    warn!(error = %err, list = %list.definition.name, "list refresh failed");
                    self.log_event(
                        LogLevel::Warning,
                        format!("import list '{}' refresh failed: {err}", list.definition.name),
                        "lists",
                    );
                    if let Err(err) = self.store.mark_list_refresh(list.id, None, true).await {
                        warn!(error = %err, list = %list.definition.name,
                              "failed to mark list stale");
                    }
                }
            }
        }

        phase_totals.insert(CyclePhase::Lists, totals);
        candidates
    }

    #[allow(clippy::too_many_arguments)]
    async fn phase_plan_and_execute(
        &self,
        cycle_id: Uuid,
        merged: &[Candidate],
        session_paths: &HashSet<PathBuf>,
        phase_totals: &mut BTreeMap<CyclePhase, PhaseTotals>,
        actions: &mut Vec<ActionOutcome>,
        counters: &mut CycleCounters,
        cancel: &CancellationToken,
    ) -> bool {
        let entries = match self
            .store
            .entries_with_status(&[EntryStatus::Active, EntryStatus::Staging])
            .await
        {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "failed to snapshot tracker for planning");
                return true;
            }
        };

        let plan = build_plan(&AdmissionInput {
            candidates: merged,
            entries: &entries,
            limit_bytes: self.snapshot.settings.fast_limit_bytes,
            retention: &self.snapshot.settings.retention,
            session_paths,
            now: Utc::now(),
        });

        if plan.overflow {
            // The soft ceiling was breached for an in-flight playback.
            self.publish_overflow_stats().await;
        }

        // Touch entries whose cause was re-confirmed by a candidate this
        // cycle, unioning attributions.
        let entry_by_path: HashMap<&PathBuf, &CacheEntry> = entries
            .iter()
            .map(|entry| (&entry.logical_path, entry))
            .collect();
        let restored_paths: HashSet<&PathBuf> = plan
            .restores
            .iter()
            .map(|restore| &restore.logical_path)
            .collect();
        for candidate in merged {
            if let Some(entry) = entry_by_path.get(&candidate.logical_path)
                && !restored_paths.contains(&candidate.logical_path)
                && let Err(err) = self.store.touch(entry.id, candidate.cause_user).await
            {
                warn!(error = %err, path = %candidate.logical_path.display(),
                      "failed to touch re-confirmed entry");
            }
        }

        let scheduled = (plan.restores.len() + plan.admissions.len()) as u64;
        let mut failures: u64 = 0;
        let mut aborted = false;

        // Retention restores run before evictions, evictions before the
        // admissions they free space for.
        let (retention, evictions): (Vec<&PlannedRestore>, Vec<&PlannedRestore>) = plan
            .restores
            .iter()
            .partition(|restore| restore.reason == RestoreReason::Retention);

        self.phase_start(cycle_id, CyclePhase::Retention, retention.len() as u64);
        let mut retention_totals = PhaseTotals {
            scanned: entries.len() as u64,
            ..PhaseTotals::default()
        };
        for restore in retention {
            if cancel.is_cancelled() {
                aborted = true;
                break;
            }
            let outcome = self
                .execute_restore(restore, OperationType::Restore, cancel)
                .await;
            counters.items_processed += 1;
            if outcome.success {
                retention_totals.restored += 1;
                counters.files_restored += 1;
            } else {
                retention_totals.errors += 1;
                failures += 1;
            }
            actions.push(outcome);
        }
        phase_totals.insert(CyclePhase::Retention, retention_totals);

        self.phase_start(
            cycle_id,
            CyclePhase::Eviction,
            (evictions.len() + plan.admissions.len()) as u64,
        );
        let mut eviction_totals = PhaseTotals {
            scanned: scheduled,
            ..PhaseTotals::default()
        };

        for restore in evictions {
            if aborted || cancel.is_cancelled() {
                aborted = true;
                break;
            }
            let outcome = self
                .execute_restore(restore, OperationType::Evict, cancel)
                .await;
            counters.items_processed += 1;
            if outcome.success {
                eviction_totals.evicted += 1;
                counters.files_restored += 1;
            } else {
                eviction_totals.errors += 1;
                failures += 1;
            }
            actions.push(outcome);
            aborted = aborted || self.budget_exhausted(scheduled, failures);
        }

        // One task per admission; the relocator's semaphore bounds how many
        // copies run at once. No admission starts before the plan committed
        // above, and restores have already freed the space they need.
        let mut pool = tokio::task::JoinSet::new();
        for candidate in plan.admissions.clone() {
            if aborted || cancel.is_cancelled() {
                aborted = true;
                break;
            }
            let relocator = Arc::clone(&self.relocator);
            let task_cancel = cancel.clone();
            pool.spawn(async move {
                let result = relocator
                    .cache_to(
                        &candidate.logical_path,
                        candidate.cause.clone(),
                        candidate.cause_user,
                        LockMode::Block,
                        &task_cancel,
                    )
                    .await;
                (candidate, result)
            });
        }

        while let Some(joined) = pool.join_next().await {
            counters.items_processed += 1;
            match joined {
                Ok((candidate, Ok(entry))) => {
                    eviction_totals.cached += 1;
                    counters.files_cached += 1;
                    for user in &candidate.attributions {
                        if Some(*user) != candidate.cause_user
                            && let Err(err) = self.store.touch(entry.id, Some(*user)).await
                        {
                            warn!(error = %err, "failed to record attribution");
                        }
                    }
                    actions.push(ActionOutcome {
                        logical_path: candidate.logical_path.clone(),
                        operation: OperationType::Cache,
                        success: true,
                        error: None,
                        bytes: entry.size_bytes,
                    });
                }
                Ok((candidate, Err(err))) => {
                    eviction_totals.errors += 1;
                    failures += 1;
                    actions.push(ActionOutcome {
                        logical_path: candidate.logical_path.clone(),
                        operation: OperationType::Cache,
                        success: false,
                        error: Some(err.kind().to_string()),
                        bytes: 0,
                    });
                }
                Err(err) => {
                    eviction_totals.errors += 1;
                    failures += 1;
                    warn!(error = %err, "admission task join failed");
                }
            }
            self.publish(Event::CycleProgress {
                cycle_id,
                phase: CyclePhase::Eviction,
                items_processed: counters.items_processed,
                items_total: scheduled,
                files_cached: counters.files_cached,
                files_restored: counters.files_restored,
            });
            if !aborted && self.budget_exhausted(scheduled, failures) {
                // Bail early: in-flight copies roll back at the next chunk.
                aborted = true;
                cancel.cancel();
            }
        }
        phase_totals.insert(CyclePhase::Eviction, eviction_totals);

        if aborted {
            self.log_event(
                LogLevel::Warning,
                format!("cycle {cycle_id} aborted after {failures} failed operations"),
                "cycle",
            );
        }
        aborted
    }

    async fn execute_restore(
        &self,
        restore: &PlannedRestore,
        operation: OperationType,
        cancel: &CancellationToken,
    ) -> ActionOutcome {
        let result = self
            .relocator
            .restore_from(
                restore.entry_id,
                operation,
                restore.reason.as_str(),
                LockMode::Block,
                cancel,
            )
            .await;
        match result {
            Ok(()) => ActionOutcome {
                logical_path: restore.logical_path.clone(),
                operation,
                success: true,
                error: None,
                bytes: restore.size_bytes,
            },
            Err(err) => ActionOutcome {
                logical_path: restore.logical_path.clone(),
                operation,
                success: false,
                error: Some(err.kind().to_string()),
                bytes: 0,
            },
        }
    }

    fn budget_exhausted(&self, scheduled: u64, failures: u64) -> bool {
        scheduled >= ERROR_BUDGET_MIN_OPS && failures * 4 >= scheduled
    }

    async fn phase_reconcile(
        &self,
        cycle_id: Uuid,
        phase_totals: &mut BTreeMap<CyclePhase, PhaseTotals>,
    ) {
        self.phase_start(cycle_id, CyclePhase::Reconcile, 0);
        let mut totals = PhaseTotals::default();

        match self
            .relocator
            .reconcile(self.snapshot.settings.reconcile.delete_unknown)
            .await
        {
            Ok(report) => {
                totals.scanned = report.verified + report.orphaned + report.unknown;
                totals.errors = report.orphaned;
            }
            Err(err) => {
                totals.errors += 1;
                warn!(error = %err, "reconcile phase failed");
            }
        }

        let retention = &self.snapshot.settings.retention;
        if retention.removed_retention_days > 0 {
            let cutoff =
                Utc::now() - ChronoDuration::days(i64::from(retention.removed_retention_days));
            match self.store.prune_removed(cutoff).await {
                Ok(pruned) if pruned > 0 => {
                    debug!(pruned, "pruned removed rows past the audit window");
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "failed to prune removed rows"),
            }
        }

        phase_totals.insert(CyclePhase::Reconcile, totals);
    }

    async fn publish_overflow_stats(&self) {
        match self
            .store
            .stats(self.snapshot.settings.fast_limit_bytes)
            .await
        {
            Ok(stats) => self.publish(Event::Stats {
                total_size_bytes: stats.total_size_bytes,
                limit_bytes: stats.limit_bytes,
                used_percent: stats.used_percent,
                file_count: stats.file_count,
                health: CacheHealth::Warning,
            }),
            Err(err) => warn!(error = %err, "failed to compute overflow stats"),
        }
    }

    fn phase_start(&self, cycle_id: Uuid, phase: CyclePhase, items_total: u64) {
        self.publish(Event::CycleStart {
            cycle_id,
            phase,
            items_total,
        });
    }

    fn log_event(&self, level: LogLevel, message: String, source: &str) {
        self.publish(Event::Log {
            level,
            message,
            source: source.to_string(),
        });
    }

    fn publish(&self, event: Event) {
        self.metrics.inc_event(event.kind());
        self.events.publish(event);
    }

    fn lock_control(&self) -> std::sync::MutexGuard<'_, CycleControl> {
        self.control
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionInfo>> {
        self.previous_sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_candidates(&self) -> std::sync::MutexGuard<'_, Vec<Candidate>> {
        self.last_candidates
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn audit(&self, actor: Option<Uuid>, what: String) {
        let actor = actor.map_or_else(|| "system".to_string(), |id| id.to_string());
        self.log_event(LogLevel::Info, format!("{what} (actor {actor})"), "commands");
    }
}

#[async_trait]
impl CacheCommands for CacheOrchestrator {
    async fn run_cycle(&self, actor_user_id: Option<Uuid>) -> CommandResult<Uuid> {
        if self.shutdown.is_cancelled() {
            return Err(CommandError::ShuttingDown);
        }
        let id = self.queue_cycle();
        self.audit(actor_user_id, format!("cycle {id} requested"));
        Ok(id)
    }

    async fn remove_file(
        &self,
        entry_id: Uuid,
        reason: String,
        actor_user_id: Option<Uuid>,
    ) -> CommandResult<()> {
        let entry = self
            .store
            .get(entry_id)
            .await
            .map_err(|err| CommandError::Failed {
                operation: "remove_file",
                detail: err.to_string(),
            })?
            .ok_or_else(|| CommandError::NotFound {
                entity: "entry",
                id: entry_id.to_string(),
            })?;
        // Retries after a completed removal are no-ops.
        if entry.status == EntryStatus::Removed {
            return Ok(());
        }

        self.relocator
            .restore_from(
                entry_id,
                OperationType::Restore,
                &reason,
                LockMode::Fail,
                &self.shutdown.child_token(),
            )
            .await
            .map_err(|err| CommandError::Failed {
                operation: "remove_file",
                detail: err.to_string(),
            })?;
        self.audit(
            actor_user_id,
            format!("entry {entry_id} restored ({reason})"),
        );
        Ok(())
    }

    async fn cleanup(
        &self,
        remove_orphaned: bool,
        actor_user_id: Option<Uuid>,
    ) -> CommandResult<CleanupReport> {
        let rows = self
            .store
            .entries_with_status(&[
                EntryStatus::Active,
                EntryStatus::Staging,
                EntryStatus::Orphaned,
                EntryStatus::PendingRemoval,
            ])
            .await
            .map_err(|err| CommandError::Failed {
                operation: "cleanup",
                detail: err.to_string(),
            })?;

        let mut report = CleanupReport {
            scanned: rows.len() as u64,
            ..CleanupReport::default()
        };
        for entry in rows
            .iter()
            .filter(|entry| entry.status == EntryStatus::Orphaned)
        {
            report.orphaned_found += 1;
            if remove_orphaned {
                match self.relocator.repair_orphan(entry.id).await {
                    Ok(restored) => {
                        report.removed += 1;
                        if !restored {
                            self.log_event(
                                LogLevel::Error,
                                format!(
                                    "orphan {} had no surviving copy; path dropped",
                                    entry.logical_path.display()
                                ),
                                "cleanup",
                            );
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, entry = %entry.id, "orphan repair failed");
                    }
                }
            }
        }

        let retention = &self.snapshot.settings.retention;
        if retention.removed_retention_days > 0 {
            let cutoff =
                Utc::now() - ChronoDuration::days(i64::from(retention.removed_retention_days));
            if let Ok(pruned) = self.store.prune_removed(cutoff).await {
                report.removed += pruned;
            }
        }

        self.audit(
            actor_user_id,
            format!(
                "cleanup scanned {} rows, {} orphaned, {} removed",
                report.scanned, report.orphaned_found, report.removed
            ),
        );
        Ok(report)
    }

    async fn stats(&self) -> CommandResult<CacheStatistics> {
        self.store
            .stats(self.snapshot.settings.fast_limit_bytes)
            .await
            .map_err(|err| CommandError::Failed {
                operation: "stats",
                detail: err.to_string(),
            })
    }

    async fn query(&self, filter: QueryFilter) -> CommandResult<Page<CacheEntry>> {
        self.store
            .query(&filter)
            .await
            .map_err(|err| CommandError::Failed {
                operation: "query",
                detail: err.to_string(),
            })
    }

    async fn search(
        &self,
        q: String,
        scope: SearchScope,
        limit: u64,
        include_removed: bool,
    ) -> CommandResult<Vec<CacheEntry>> {
        if q.trim().is_empty() {
            return Err(CommandError::InvalidArgument {
                field: "q",
                reason: "empty",
            });
        }
        let limit = if limit == 0 { DEFAULT_SEARCH_LIMIT } else { limit };
        self.store
            .search(&q, scope, limit, include_removed)
            .await
            .map_err(|err| CommandError::Failed {
                operation: "search",
                detail: err.to_string(),
            })
    }

    async fn export(&self, format: ExportFormat, filter: QueryFilter) -> CommandResult<Vec<u8>> {
        let mut filter = filter;
        filter.limit = u64::MAX;
        filter.offset = 0;
        let page = self
            .store
            .query(&filter)
            .await
            .map_err(|err| CommandError::Failed {
                operation: "export",
                detail: err.to_string(),
            })?;
        render_export(format, &page.items).map_err(|detail| CommandError::Failed {
            operation: "export",
            detail,
        })
    }

    async fn update_user(
        &self,
        user_id: Uuid,
        patch: UserSettingsPatch,
    ) -> CommandResult<User> {
        if let Some(bias) = patch.priority_bias
            && bias.abs() > USER_BIAS_BOUND
        {
            return Err(CommandError::InvalidArgument {
                field: "priority_bias",
                reason: "out_of_range",
            });
        }
        if let Some(ondeck) = &patch.ondeck
            && ondeck.episodes_ahead == 0
        {
            return Err(CommandError::InvalidArgument {
                field: "episodes_ahead",
                reason: "zero",
            });
        }
        if let Some(watchlist) = &patch.watchlist
            && watchlist.episodes_per_show == 0
        {
            return Err(CommandError::InvalidArgument {
                field: "episodes_per_show",
                reason: "zero",
            });
        }

        self.store
            .apply_user_patch(user_id, &patch)
            .await
            .map_err(|err| match err {
                cachelot_data::DataError::NotFound { .. } => CommandError::NotFound {
                    entity: "user",
                    id: user_id.to_string(),
                },
                other => CommandError::Failed {
                    operation: "update_user",
                    detail: other.to_string(),
                },
            })
    }

    async fn add_list(&self, definition: ListDefinition) -> CommandResult<ImportList> {
        let list = ImportList {
            id: Uuid::new_v4(),
            definition,
            last_refreshed: None,
            stale: false,
        };
        self.store
            .insert_list(&list)
            .await
            .map_err(|err| CommandError::Failed {
                operation: "add_list",
                detail: err.to_string(),
            })?;
        self.audit(None, format!("import list '{}' added", list.definition.name));
        Ok(list)
    }

    async fn remove_list(&self, id: Uuid) -> CommandResult<()> {
        let deleted = self
            .store
            .delete_list(id)
            .await
            .map_err(|err| CommandError::Failed {
                operation: "remove_list",
                detail: err.to_string(),
            })?;
        if !deleted {
            return Err(CommandError::NotFound {
                entity: "list",
                id: id.to_string(),
            });
        }
        self.audit(None, format!("import list {id} removed"));
        Ok(())
    }

    async fn refresh_list(&self, id: Uuid) -> CommandResult<()> {
        self.store
            .force_list_due(id)
            .await
            .map_err(|err| match err {
                cachelot_data::DataError::NotFound { .. } => CommandError::NotFound {
                    entity: "list",
                    id: id.to_string(),
                },
                other => CommandError::Failed {
                    operation: "refresh_list",
                    detail: other.to_string(),
                },
            })?;
        let _ = self.queue_cycle();
        Ok(())
    }

    async fn recent_cycles(&self) -> CommandResult<Vec<CycleResult>> {
        Ok(self.cycle_log.load())
    }
}

#[async_trait]
impl CacheInspector for CacheOrchestrator {
    async fn last_candidates(&self) -> Vec<Candidate> {
        self.lock_candidates().clone()
    }
}

fn render_export(format: ExportFormat, entries: &[CacheEntry]) -> Result<Vec<u8>, String> {
    match format {
        ExportFormat::Json => {
            serde_json::to_vec_pretty(entries).map_err(|err| err.to_string())
        }
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_writer(Vec::new());
            writer
                .write_record([
                    "logical_path",
                    "status",
                    "cause",
                    "size_bytes",
                    "cached_at",
                    "last_accessed_at",
                    "access_count",
                    "fast_tier_path",
                    "checksum",
                ])
                .map_err(|err| err.to_string())?;
            for entry in entries {
                writer
                    .write_record([
                        entry.logical_path.display().to_string(),
                        entry.status.as_str().to_string(),
                        entry.cause.label(),
                        entry.size_bytes.to_string(),
                        entry.cached_at.to_rfc3339(),
                        entry.last_accessed_at.to_rfc3339(),
                        entry.access_count.to_string(),
                        entry.fast_tier_path.display().to_string(),
                        entry.checksum.clone().unwrap_or_default(),
                    ])
                    .map_err(|err| err.to_string())?;
            }
            writer.into_inner().map_err(|err| err.to_string())
        }
        ExportFormat::Text => {
            let mut out = String::new();
            out.push_str(&format!(
                "{:<16} {:>14} {:<12} PATH\n",
                "STATUS", "SIZE_BYTES", "CAUSE"
            ));
            for entry in entries {
                out.push_str(&format!(
                    "{:<16} {:>14} {:<12} {}\n",
                    entry.status.as_str(),
                    entry.size_bytes,
                    entry.cause.label(),
                    entry.logical_path.display()
                ));
            }
            Ok(out.into_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachelot_core::model::{CauseOperation, RelocationMethod};
    use std::collections::BTreeSet;

    fn entry(path: &str, status: EntryStatus) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            id: Uuid::new_v4(),
            logical_path: PathBuf::from(path),
            original_location_path: PathBuf::from(path),
            fast_tier_path: PathBuf::from(format!("/mnt/cache{path}")),
            size_bytes: 1_024,
            cached_at: now,
            last_accessed_at: now,
            access_count: 3,
            cause: CauseOperation::OnDeck,
            cause_user_id: None,
            attributions: BTreeSet::new(),
            status,
            method: RelocationMethod::AtomicCopy,
            checksum: Some("abc123".to_string()),
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn csv_export_includes_header_and_rows() -> Result<(), String> {
        let rendered = render_export(
            ExportFormat::Csv,
            &[entry("/library/a.mkv", EntryStatus::Active)],
        )?;
        let text = String::from_utf8(rendered).map_err(|err| err.to_string())?;
        let mut lines = text.lines();
        assert!(lines.next().is_some_and(|line| line.starts_with("logical_path,")));
        assert!(lines.next().is_some_and(|line| line.contains("/library/a.mkv")));
        Ok(())
    }

    #[test]
    fn json_export_round_trips() -> Result<(), String> {
        let entries = vec![entry("/library/a.mkv", EntryStatus::Active)];
        let rendered = render_export(ExportFormat::Json, &entries)?;
        let parsed: Vec<CacheEntry> =
            serde_json::from_slice(&rendered).map_err(|err| err.to_string())?;
        assert_eq!(parsed, entries);
        Ok(())
    }

    #[test]
    fn text_export_is_aligned() -> Result<(), String> {
        let rendered = render_export(
            ExportFormat::Text,
            &[entry("/library/a.mkv", EntryStatus::Active)],
        )?;
        let text = String::from_utf8(rendered).map_err(|err| err.to_string())?;
        assert!(text.starts_with("STATUS"));
        assert!(text.contains("active"));
        Ok(())
    }
}
