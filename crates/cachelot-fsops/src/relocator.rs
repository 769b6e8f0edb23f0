//! Atomic relocation primitives.
//!
//! `cache_to` copies a slow-tier file onto the fast tier and commits by
//! atomically renaming a temporary symlink over the logical path; the
//! original content is preserved on the slow tier as a hidden hard link
//! sibling (the entry's `original_location_path`). `restore_from` copies the
//! fast copy back over the logical path and releases the fast tier. Both are
//! safe against arbitrary crash and against readers holding an open
//! descriptor on the original inode; every partial state is enumerated and
//! repaired by `recover`.

use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cachelot_core::model::{CacheEntry, CauseOperation, EntryStatus};
use cachelot_data::{DataError, StagingRequest, TrackerStore};
use cachelot_events::{Event, EventBus, OperationType};
use cachelot_telemetry::Metrics;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{FsOpsError, FsOpsResult};
use crate::locks::{PathLockGuard, PathLocks};

const COPY_CHUNK_BYTES: usize = 1 << 20;
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);
const WORK_PREFIX: &str = ".cachelot-";

/// How to treat a held path lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Wait for the lock.
    Block,
    /// Fail immediately with `Contended`.
    Fail,
}

/// Static relocator parameters resolved from settings.
#[derive(Debug, Clone)]
pub struct RelocatorConfig {
    /// Directory the fast tier lives under.
    pub fast_root: PathBuf,
    /// Fast-tier size limit, used for `stats` events after mutations.
    pub limit_bytes: u64,
    /// Upper bound on concurrently running relocations.
    pub max_concurrent: usize,
}

/// Counters produced by the startup recovery walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `staging` rows whose symlink swap had already committed.
    pub promoted: u64,
    /// `staging` rows rolled back (partial fast copy deleted, row dropped).
    pub dropped: u64,
    /// `pending_removal` rows whose restore was resumed and finished.
    pub resumed: u64,
    /// `pending_removal` rows whose original was already back in place.
    pub finalized: u64,
    /// Rows whose fast file vanished, now waiting for orphan repair.
    pub orphaned: u64,
}

/// Counters produced by one reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// `active` rows whose symlink and fast file both checked out.
    pub verified: u64,
    /// `active` rows transitioned to `orphaned`.
    pub orphaned: u64,
    /// Fast-root files with no tracker row.
    pub unknown: u64,
    /// Unknown files deleted under the configured policy.
    pub deleted: u64,
}

struct ProgressContext {
    operation_id: Uuid,
    operation_type: OperationType,
    file_name: String,
}

/// Service executing relocations against one fast root.
pub struct Relocator {
    events: EventBus,
    metrics: Metrics,
    store: TrackerStore,
    locks: PathLocks,
    semaphore: Arc<Semaphore>,
    config: RelocatorConfig,
}

impl Relocator {
    /// Construct a relocator bound to the shared event bus, metrics, and
    /// tracker.
    #[must_use]
    pub fn new(
        events: EventBus,
        metrics: Metrics,
        store: TrackerStore,
        config: RelocatorConfig,
    ) -> Self {
        let permits = config.max_concurrent.max(1);
        Self {
            events,
            metrics,
            store,
            locks: PathLocks::new(),
            semaphore: Arc::new(Semaphore::new(permits)),
            config,
        }
    }

    /// Copy the file behind `logical_path` onto the fast tier and commit the
    /// symlink swap. A second call for an already-active path is a no-op
    /// returning the existing entry.
    ///
    /// # Errors
    ///
    /// Surfaces `Contended` (non-blocking lock), `Cancelled` (between copy
    /// chunks), `FastFull`, read/write failures, `SymlinkUnsupported`, and
    /// tracker failures. On any failure before the commit point the fast
    /// tier and the tracker are rolled back and the original path is
    /// untouched.
    pub async fn cache_to(
        &self,
        logical_path: &Path,
        cause: CauseOperation,
        cause_user: Option<Uuid>,
        mode: LockMode,
        cancel: &CancellationToken,
    ) -> FsOpsResult<CacheEntry> {
        let _permit = self.acquire_slot(logical_path).await?;
        let _guard = self.lock_path(logical_path, mode).await?;

        // Resolve the logical path to a regular slow-tier file.
        let meta = fs::symlink_metadata(logical_path)
            .await
            .map_err(|source| FsOpsError::read("resolve.stat", logical_path, source))?;
        if meta.file_type().is_symlink() {
            let target = fs::read_link(logical_path)
                .await
                .map_err(|source| FsOpsError::read("resolve.read_link", logical_path, source))?;
            if target.starts_with(&self.config.fast_root)
                && let Some(existing) = self
                    .store
                    .find_by_path(logical_path)
                    .await
                    .map_err(|source| FsOpsError::tracker("resolve.find", source))?
                && existing.status == EntryStatus::Active
            {
                debug!(path = %logical_path.display(), "already cached; returning existing entry");
                return Ok(existing);
            }
            return Err(FsOpsError::NotRegularFile {
                path: logical_path.to_path_buf(),
            });
        }
        if !meta.is_file() {
            return Err(FsOpsError::NotRegularFile {
                path: logical_path.to_path_buf(),
            });
        }
        let size = meta.len();
        let file_name = file_name_of(logical_path)?;

        let operation_id = Uuid::new_v4();
        let fast_path = self
            .config
            .fast_root
            .join(format!("{operation_id}-{file_name}"));
        let shadow_path = sibling_work_path(logical_path, &file_name, "orig", operation_id)?;

        let entry = self
            .store
            .upsert_staging(StagingRequest {
                logical_path: logical_path.to_path_buf(),
                original_location_path: shadow_path,
                fast_tier_path: fast_path,
                cause,
                cause_user_id: cause_user,
                metadata: serde_json::json!({}),
            })
            .await
            .map_err(|source| FsOpsError::tracker("stage", source))?;
        if entry.status == EntryStatus::Active {
            debug!(path = %logical_path.display(), "row already active; returning existing entry");
            return Ok(entry);
        }

        let progress = ProgressContext {
            operation_id,
            operation_type: OperationType::Cache,
            file_name,
        };
        let started = Instant::now();
        self.metrics.relocation_started();
        let result = self
            .execute_cache(logical_path, &entry, size, &progress, cancel)
            .await;
        self.metrics.relocation_finished();

        self.finish(
            &progress,
            logical_path,
            started,
            result.as_ref().ok().map_or(0, |(bytes, _)| *bytes),
            result.as_ref().err(),
        );

        let (bytes, checksum) = result?;
        let mut committed = entry;
        committed.status = EntryStatus::Active;
        committed.size_bytes = bytes;
        committed.checksum = Some(checksum);
        self.publish_stats().await;
        info!(
            path = %logical_path.display(),
            fast = %committed.fast_tier_path.display(),
            bytes,
            "cached to fast tier"
        );
        Ok(committed)
    }

    /// Restore a tracked entry back to the slow tier and release the fast
    /// copy. Used for both operator removals and evictions; `operation`
    /// selects the event flavour. Safe to retry.
    ///
    /// # Errors
    ///
    /// Surfaces `Contended`, `Cancelled`, `SymlinkMismatch` (the entry is
    /// marked `orphaned`), read/write failures, and tracker failures. A
    /// failure mid-copy leaves the entry in `pending_removal` for recovery.
    pub async fn restore_from(
        &self,
        entry_id: Uuid,
        operation: OperationType,
        reason: &str,
        mode: LockMode,
        cancel: &CancellationToken,
    ) -> FsOpsResult<()> {
        let entry = self.fetch_entry(entry_id).await?;
        let _permit = self.acquire_slot(&entry.logical_path).await?;
        let _guard = self.lock_path(&entry.logical_path, mode).await?;
        // Re-read under the lock; a concurrent operation may have moved it.
        let entry = self.fetch_entry(entry_id).await?;

        match entry.status {
            EntryStatus::Active => {
                self.store
                    .mark_pending_removal(entry.id, reason)
                    .await
                    .map_err(|source| FsOpsError::tracker("restore.mark_pending", source))?;
            }
            EntryStatus::PendingRemoval => {}
            EntryStatus::Staging | EntryStatus::Orphaned | EntryStatus::Removed => {
                return Err(FsOpsError::tracker(
                    "restore.state",
                    DataError::Conflict {
                        operation: "restore_from",
                        entity: "entry",
                        id: entry.id.to_string(),
                    },
                ));
            }
        }

        self.verify_symlink(&entry).await?;

        let file_name = file_name_of(&entry.logical_path)?;
        let progress = ProgressContext {
            operation_id: Uuid::new_v4(),
            operation_type: operation,
            file_name,
        };
        let started = Instant::now();
        self.metrics.relocation_started();
        let result = self.execute_restore(&entry, &progress, cancel).await;
        self.metrics.relocation_finished();

        self.finish(
            &progress,
            &entry.logical_path,
            started,
            result.as_ref().ok().map_or(0, |bytes| *bytes),
            result.as_ref().err(),
        );
        result?;
        self.publish_stats().await;
        info!(
            path = %entry.logical_path.display(),
            reason,
            "restored to slow tier"
        );
        Ok(())
    }

    /// Startup recovery walk over all rows not in `{active, removed}`.
    /// Idempotent under repeated crash-restart.
    ///
    /// # Errors
    ///
    /// Returns an error only when the tracker itself cannot be read;
    /// per-row repair failures are logged and skipped.
    pub async fn recover(&self) -> FsOpsResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let staging = self
            .store
            .entries_with_status(&[EntryStatus::Staging])
            .await
            .map_err(|source| FsOpsError::tracker("recover.staging", source))?;
        for entry in staging {
            if self.swap_committed(&entry).await {
                // The copy finished and the commit rename landed before the
                // crash; only the tracker transition is missing.
                let size = fs::metadata(&entry.fast_tier_path)
                    .await
                    .map(|meta| meta.len())
                    .unwrap_or_default();
                match self.store.mark_active(entry.id, size, None).await {
                    Ok(()) => report.promoted += 1,
                    Err(err) => {
                        warn!(error = %err, path = %entry.logical_path.display(),
                              "failed to promote recovered staging row");
                    }
                }
            } else {
                remove_quietly(&entry.fast_tier_path).await;
                remove_quietly(&entry.original_location_path).await;
                match self.store.delete(entry.id).await {
                    Ok(()) => report.dropped += 1,
                    Err(err) => {
                        warn!(error = %err, path = %entry.logical_path.display(),
                              "failed to drop recovered staging row");
                    }
                }
            }
        }

        let pending = self
            .store
            .entries_with_status(&[EntryStatus::PendingRemoval])
            .await
            .map_err(|source| FsOpsError::tracker("recover.pending", source))?;
        for entry in pending {
            if self.swap_committed(&entry).await {
                let cancel = CancellationToken::new();
                match self
                    .restore_from(
                        entry.id,
                        OperationType::Restore,
                        "crash recovery",
                        LockMode::Block,
                        &cancel,
                    )
                    .await
                {
                    Ok(()) => report.resumed += 1,
                    Err(err) => {
                        warn!(error = %err, path = %entry.logical_path.display(),
                              "failed to resume interrupted restore");
                    }
                }
            } else if fs::symlink_metadata(&entry.logical_path)
                .await
                .map(|meta| meta.is_file())
                .unwrap_or(false)
            {
                remove_quietly(&entry.fast_tier_path).await;
                remove_quietly(&entry.original_location_path).await;
                match self.store.mark_removed(entry.id).await {
                    Ok(()) => report.finalized += 1,
                    Err(err) => {
                        warn!(error = %err, path = %entry.logical_path.display(),
                              "failed to finalize restored row");
                    }
                }
            } else {
                match self.store.mark_orphaned(entry.id).await {
                    Ok(()) => report.orphaned += 1,
                    Err(err) => {
                        warn!(error = %err, path = %entry.logical_path.display(),
                              "failed to orphan inconsistent row");
                    }
                }
            }
        }

        info!(
            promoted = report.promoted,
            dropped = report.dropped,
            resumed = report.resumed,
            finalized = report.finalized,
            orphaned = report.orphaned,
            "relocation recovery finished"
        );
        Ok(report)
    }

    /// Verify every `active` row against the filesystem and scan the fast
    /// root for files with no tracker row.
    ///
    /// # Errors
    ///
    /// Returns an error when the tracker cannot be read or the fast root
    /// cannot be walked.
    pub async fn reconcile(&self, delete_unknown: bool) -> FsOpsResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let active = self
            .store
            .entries_with_status(&[EntryStatus::Active])
            .await
            .map_err(|source| FsOpsError::tracker("reconcile.active", source))?;
        let mut known: std::collections::HashSet<PathBuf> = std::collections::HashSet::new();
        for entry in &active {
            known.insert(entry.fast_tier_path.clone());
            if self.swap_committed(entry).await {
                report.verified += 1;
            } else {
                match self.store.mark_orphaned(entry.id).await {
                    Ok(()) => report.orphaned += 1,
                    Err(err) => {
                        warn!(error = %err, path = %entry.logical_path.display(),
                              "failed to orphan mismatched row");
                    }
                }
            }
        }

        let fast_root = self.config.fast_root.clone();
        let files = tokio::task::spawn_blocking(move || walk_files(&fast_root))
            .await
            .map_err(|err| {
                FsOpsError::read("reconcile.walk", &self.config.fast_root, io::Error::other(err))
            })??;

        for file in files {
            if known.contains(&file) {
                continue;
            }
            report.unknown += 1;
            if delete_unknown {
                remove_quietly(&file).await;
                report.deleted += 1;
            } else {
                debug!(path = %file.display(), "unknown file on fast tier");
            }
        }

        Ok(report)
    }

    /// Repair one `orphaned` row: put the original back at the logical path
    /// when the slow-tier copy survives, then retire the row. Returns
    /// whether the original content is in place afterwards.
    ///
    /// # Errors
    ///
    /// Returns tracker failures and rename failures.
    pub async fn repair_orphan(&self, entry_id: Uuid) -> FsOpsResult<bool> {
        let entry = self.fetch_entry(entry_id).await?;
        let _guard = self.lock_path(&entry.logical_path, LockMode::Block).await?;
        if entry.status != EntryStatus::Orphaned {
            return Err(FsOpsError::tracker(
                "repair_orphan.state",
                DataError::Conflict {
                    operation: "repair_orphan",
                    entity: "entry",
                    id: entry.id.to_string(),
                },
            ));
        }

        let logical_is_file = fs::symlink_metadata(&entry.logical_path)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        let shadow_exists = entry.original_location_path != entry.logical_path
            && fs::metadata(&entry.original_location_path).await.is_ok();

        let restored = if logical_is_file {
            true
        } else if shadow_exists {
            // The rename atomically replaces the dangling symlink with the
            // preserved slow-tier link.
            fs::rename(&entry.original_location_path, &entry.logical_path)
                .await
                .map_err(|source| {
                    FsOpsError::write("repair_orphan.rename", &entry.logical_path, source)
                })?;
            true
        } else {
            // Nothing left to restore from; drop the dangling symlink so the
            // path fails loudly instead of resolving to a missing file.
            remove_quietly(&entry.logical_path).await;
            false
        };

        remove_quietly(&entry.fast_tier_path).await;
        if restored && entry.original_location_path != entry.logical_path {
            remove_quietly(&entry.original_location_path).await;
        }
        self.store
            .mark_removed(entry.id)
            .await
            .map_err(|source| FsOpsError::tracker("repair_orphan.remove", source))?;
        self.publish_stats().await;
        Ok(restored)
    }

    async fn execute_cache(
        &self,
        logical_path: &Path,
        entry: &CacheEntry,
        expected_size: u64,
        progress: &ProgressContext,
        cancel: &CancellationToken,
    ) -> FsOpsResult<(u64, String)> {
        let fast_path = entry.fast_tier_path.clone();
        let shadow_path = entry.original_location_path.clone();

        fs::create_dir_all(&self.config.fast_root)
            .await
            .map_err(|source| FsOpsError::write("cache.mkdir", &self.config.fast_root, source))?;

        let copied = self
            .copy_file(logical_path, &fast_path, expected_size, progress, cancel)
            .await;
        let (bytes, checksum) = match copied {
            Ok(done) => done,
            Err(err) => {
                self.scrap_staging(entry, None).await;
                return Err(err);
            }
        };
        if bytes != expected_size {
            self.scrap_staging(entry, None).await;
            return Err(FsOpsError::read(
                "cache.verify_size",
                logical_path,
                io::Error::other("file changed during copy"),
            ));
        }

        let src_meta = fs::metadata(logical_path)
            .await
            .map_err(|source| FsOpsError::read("cache.src_meta", logical_path, source))?;
        preserve_attrs(&src_meta, &fast_path);

        // Preserve the slow copy under a hidden sibling name before the
        // swap; the commit rename would otherwise drop the last link to the
        // original inode.
        remove_quietly(&shadow_path).await;
        if let Err(source) = fs::hard_link(logical_path, &shadow_path).await {
            self.scrap_staging(entry, None).await;
            return Err(FsOpsError::write("cache.shadow_link", &shadow_path, source));
        }

        let temp_link =
            match sibling_work_path(logical_path, &progress.file_name, "swap", progress.operation_id)
            {
                Ok(path) => path,
                Err(err) => {
                    self.scrap_staging(entry, None).await;
                    return Err(err);
                }
            };
        if let Err(source) = symlink(&fast_path, &temp_link).await {
            self.scrap_staging(entry, Some(&temp_link)).await;
            return Err(FsOpsError::SymlinkUnsupported {
                path: temp_link,
                source,
            });
        }

        // The single commit point: after this rename the logical path
        // resolves to the fast copy; before it the original is untouched.
        if let Err(source) = fs::rename(&temp_link, logical_path).await {
            self.scrap_staging(entry, Some(&temp_link)).await;
            return Err(FsOpsError::write("cache.commit", logical_path, source));
        }

        self.store
            .mark_active(entry.id, bytes, Some(checksum.clone()))
            .await
            .map_err(|source| FsOpsError::tracker("cache.mark_active", source))?;
        Ok((bytes, checksum))
    }

    async fn execute_restore(
        &self,
        entry: &CacheEntry,
        progress: &ProgressContext,
        cancel: &CancellationToken,
    ) -> FsOpsResult<u64> {
        let temp = sibling_work_path(
            &entry.logical_path,
            &progress.file_name,
            "restore",
            progress.operation_id,
        )?;

        let total = fs::metadata(&entry.fast_tier_path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(entry.size_bytes);
        let copied = self
            .copy_file(&entry.fast_tier_path, &temp, total, progress, cancel)
            .await;
        let (bytes, checksum) = match copied {
            Ok(done) => done,
            Err(err) => {
                remove_quietly(&temp).await;
                return Err(err);
            }
        };
        if let Some(expected) = &entry.checksum
            && expected != &checksum
        {
            warn!(
                path = %entry.logical_path.display(),
                "fast copy checksum differs from the recorded value"
            );
        }

        if let Ok(meta) = fs::metadata(&entry.fast_tier_path).await {
            preserve_attrs(&meta, &temp);
        }

        // Atomically replace the symlink with the restored regular file.
        if let Err(source) = fs::rename(&temp, &entry.logical_path).await {
            remove_quietly(&temp).await;
            return Err(FsOpsError::write(
                "restore.commit",
                &entry.logical_path,
                source,
            ));
        }

        remove_quietly(&entry.fast_tier_path).await;
        if entry.original_location_path != entry.logical_path {
            remove_quietly(&entry.original_location_path).await;
        }
        self.store
            .mark_removed(entry.id)
            .await
            .map_err(|source| FsOpsError::tracker("restore.mark_removed", source))?;
        Ok(bytes)
    }

    async fn copy_file(
        &self,
        src: &Path,
        dst: &Path,
        total: u64,
        progress: &ProgressContext,
        cancel: &CancellationToken,
    ) -> FsOpsResult<(u64, String)> {
        remove_quietly(dst).await;

        let mut reader = fs::File::open(src)
            .await
            .map_err(|source| FsOpsError::read("copy.open", src, source))?;
        let mut writer = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dst)
            .await
            .map_err(|source| FsOpsError::write("copy.create", dst, source))?;

        let mut buffer = vec![0u8; COPY_CHUNK_BYTES];
        let mut hasher = Sha256::new();
        let mut bytes: u64 = 0;
        let started = Instant::now();
        let mut last_emit = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Err(FsOpsError::Cancelled {
                    path: src.to_path_buf(),
                });
            }
            let read = reader
                .read(&mut buffer)
                .await
                .map_err(|source| FsOpsError::read("copy.read", src, source))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            if let Err(source) = writer.write_all(&buffer[..read]).await {
                if source.kind() == io::ErrorKind::StorageFull {
                    return Err(FsOpsError::FastFull {
                        path: dst.to_path_buf(),
                        bytes_transferred: bytes,
                    });
                }
                return Err(FsOpsError::write("copy.write", dst, source));
            }
            bytes += read as u64;

            if last_emit.elapsed() >= PROGRESS_INTERVAL {
                last_emit = Instant::now();
                self.emit_progress(progress, bytes, total, started.elapsed());
            }
        }

        writer
            .sync_all()
            .await
            .map_err(|source| FsOpsError::write("copy.sync", dst, source))?;

        let digest = hasher.finalize();
        let mut checksum = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(checksum, "{byte:02x}");
        }
        Ok((bytes, checksum))
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn emit_progress(
        &self,
        progress: &ProgressContext,
        bytes: u64,
        total: u64,
        elapsed: Duration,
    ) {
        let percent = if total == 0 {
            100.0
        } else {
            (clamped_f64(bytes) / clamped_f64(total)) * 100.0
        };
        let secs = elapsed.as_secs_f64();
        let speed = if secs > 0.0 {
            clamped_f64(bytes) / secs
        } else {
            0.0
        };
        let eta = if speed > 0.0 && total > bytes {
            Some((clamped_f64(total - bytes) / speed) as u64)
        } else {
            None
        };
        self.publish(Event::OperationProgress {
            operation_id: progress.operation_id,
            operation_type: progress.operation_type,
            file_name: progress.file_name.clone(),
            progress_percent: percent.clamp(0.0, 100.0),
            bytes_transferred: bytes,
            bytes_total: total,
            speed_bytes_per_sec: speed as u64,
            eta_seconds: eta,
        });
    }

    fn finish(
        &self,
        progress: &ProgressContext,
        logical_path: &Path,
        started: Instant,
        bytes: u64,
        error: Option<&FsOpsError>,
    ) {
        let label = progress.operation_type.as_str();
        if let Some(err) = error {
            self.metrics.inc_relocation(label, "failure");
            warn!(
                error = %err,
                kind = err.kind(),
                path = %logical_path.display(),
                "relocation failed"
            );
        } else {
            self.metrics.inc_relocation(label, "success");
            self.metrics.add_relocation_bytes(label, bytes);
        }
        self.publish(Event::OperationComplete {
            operation_id: progress.operation_id,
            operation_type: progress.operation_type,
            file_path: logical_path.display().to_string(),
            success: error.is_none(),
            error: error.map(|err| err.kind().to_string()),
            duration_seconds: started.elapsed().as_secs_f64(),
            bytes_transferred: bytes,
        });
    }

    async fn scrap_staging(&self, entry: &CacheEntry, temp_link: Option<&Path>) {
        if let Some(temp) = temp_link {
            remove_quietly(temp).await;
        }
        remove_quietly(&entry.fast_tier_path).await;
        remove_quietly(&entry.original_location_path).await;
        if let Err(err) = self.store.delete(entry.id).await {
            warn!(error = %err, entry = %entry.id, "failed to drop staging row");
        }
    }

    async fn verify_symlink(&self, entry: &CacheEntry) -> FsOpsResult<()> {
        let mismatch = FsOpsError::SymlinkMismatch {
            path: entry.logical_path.clone(),
            expected: entry.fast_tier_path.clone(),
        };
        if !self.swap_committed(entry).await {
            if let Err(err) = self.store.mark_orphaned(entry.id).await {
                debug!(error = %err, entry = %entry.id, "orphan transition skipped");
            }
            return Err(mismatch);
        }
        Ok(())
    }

    async fn swap_committed(&self, entry: &CacheEntry) -> bool {
        let link_target = fs::read_link(&entry.logical_path).await.ok();
        link_target.as_deref() == Some(entry.fast_tier_path.as_path())
            && fs::metadata(&entry.fast_tier_path).await.is_ok()
    }

    async fn fetch_entry(&self, entry_id: Uuid) -> FsOpsResult<CacheEntry> {
        self.store
            .get(entry_id)
            .await
            .map_err(|source| FsOpsError::tracker("fetch", source))?
            .ok_or_else(|| {
                FsOpsError::tracker(
                    "fetch",
                    DataError::NotFound {
                        entity: "entry",
                        id: entry_id.to_string(),
                    },
                )
            })
    }

    async fn acquire_slot(
        &self,
        logical_path: &Path,
    ) -> FsOpsResult<tokio::sync::OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| FsOpsError::Cancelled {
                path: logical_path.to_path_buf(),
            })
    }

    async fn lock_path(&self, path: &Path, mode: LockMode) -> FsOpsResult<PathLockGuard> {
        match mode {
            LockMode::Block => Ok(self.locks.acquire(path).await),
            LockMode::Fail => self
                .locks
                .try_acquire(path)
                .ok_or_else(|| FsOpsError::Contended {
                    path: path.to_path_buf(),
                }),
        }
    }

    async fn publish_stats(&self) {
        match self.store.stats(self.config.limit_bytes).await {
            Ok(stats) => {
                self.metrics.set_fast_tier_used(stats.total_size_bytes);
                self.metrics
                    .set_tracked_entries(stats.file_count + stats.staging_count);
                self.publish(Event::Stats {
                    total_size_bytes: stats.total_size_bytes,
                    limit_bytes: stats.limit_bytes,
                    used_percent: stats.used_percent,
                    file_count: stats.file_count,
                    health: stats.health,
                });
            }
            Err(err) => warn!(error = %err, "failed to compute stats after relocation"),
        }
    }

    fn publish(&self, event: Event) {
        self.metrics.inc_event(event.kind());
        self.events.publish(event);
    }
}

/// Verify the filesystem under `dir` supports the symlink-and-rename commit
/// protocol. Run once at startup against the fast root; failure is fatal.
///
/// # Errors
///
/// Returns `SymlinkUnsupported` or the underlying IO failure.
pub fn probe_symlink_support(dir: &Path) -> FsOpsResult<()> {
    std::fs::create_dir_all(dir).map_err(|source| FsOpsError::write("probe.mkdir", dir, source))?;
    let token = Uuid::new_v4();
    let target = dir.join(format!("{WORK_PREFIX}probe-{token}"));
    let link = dir.join(format!("{WORK_PREFIX}probe-link-{token}"));
    let swapped = dir.join(format!("{WORK_PREFIX}probe-swap-{token}"));

    let result = (|| {
        std::fs::write(&target, b"probe")
            .map_err(|source| FsOpsError::write("probe.write", &target, source))?;
        symlink_sync(&target, &link).map_err(|source| FsOpsError::SymlinkUnsupported {
            path: link.clone(),
            source,
        })?;
        std::fs::rename(&link, &swapped)
            .map_err(|source| FsOpsError::write("probe.rename", &swapped, source))?;
        let resolved = std::fs::read_link(&swapped)
            .map_err(|source| FsOpsError::SymlinkUnsupported {
                path: swapped.clone(),
                source,
            })?;
        if resolved != target {
            return Err(FsOpsError::SymlinkUnsupported {
                path: swapped.clone(),
                source: io::Error::other("probe symlink resolved to an unexpected target"),
            });
        }
        Ok(())
    })();

    let _ = std::fs::remove_file(&link);
    let _ = std::fs::remove_file(&swapped);
    let _ = std::fs::remove_file(&target);
    result
}

fn file_name_of(path: &Path) -> FsOpsResult<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| FsOpsError::NotRegularFile {
            path: path.to_path_buf(),
        })
}

fn sibling_work_path(
    logical_path: &Path,
    file_name: &str,
    label: &str,
    token: Uuid,
) -> FsOpsResult<PathBuf> {
    let parent = logical_path
        .parent()
        .ok_or_else(|| FsOpsError::NotRegularFile {
            path: logical_path.to_path_buf(),
        })?;
    Ok(parent.join(format!("{WORK_PREFIX}{label}-{token}-{file_name}")))
}

async fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path).await
        && err.kind() != io::ErrorKind::NotFound
    {
        warn!(error = %err, path = %path.display(), "failed to remove work file");
    }
}

#[cfg(unix)]
async fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    fs::symlink(target, link).await
}

#[cfg(not(unix))]
async fn symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::other("symlinks require a unix filesystem"))
}

#[cfg(unix)]
fn symlink_sync(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink_sync(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::other("symlinks require a unix filesystem"))
}

#[cfg(unix)]
fn preserve_attrs(src_meta: &std::fs::Metadata, dst: &Path) {
    use std::os::unix::fs::MetadataExt;

    if let Err(err) = std::fs::set_permissions(dst, src_meta.permissions()) {
        warn!(error = %err, path = %dst.display(), "failed to preserve permissions");
    }
    // chown needs ownership or root; the same-owner copy is the common case,
    // so a refusal is survivable.
    if let Err(err) = nix::unistd::chown(
        dst,
        Some(nix::unistd::Uid::from_raw(src_meta.uid())),
        Some(nix::unistd::Gid::from_raw(src_meta.gid())),
    ) {
        debug!(error = %err, path = %dst.display(), "failed to preserve ownership");
    }
}

#[cfg(not(unix))]
fn preserve_attrs(_src_meta: &std::fs::Metadata, _dst: &Path) {}

#[allow(clippy::cast_precision_loss)]
fn clamped_f64(value: u64) -> f64 {
    value as f64
}

fn walk_files(root: &Path) -> FsOpsResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(root) {
        let entry =
            entry.map_err(|err| FsOpsError::read("walk", root, io::Error::other(err)))?;
        if entry.file_type().is_file() {
            let name = entry.file_name().to_string_lossy();
            if name.starts_with(WORK_PREFIX) {
                continue;
            }
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_paths_stay_in_the_logical_directory() -> FsOpsResult<()> {
        let token = Uuid::nil();
        let path = sibling_work_path(Path::new("/library/show/e1.mkv"), "e1.mkv", "swap", token)?;
        assert_eq!(path.parent(), Some(Path::new("/library/show")));
        assert!(
            path.file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with(WORK_PREFIX))
        );
        Ok(())
    }

    #[test]
    fn root_paths_cannot_host_work_files() {
        assert!(matches!(
            sibling_work_path(Path::new("/"), "x", "swap", Uuid::nil()),
            Err(FsOpsError::NotRegularFile { .. })
        ));
    }
}
