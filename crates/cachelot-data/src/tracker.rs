//! SQLite-backed tracker store.
//!
//! The store owns every `CacheEntry` row. All state transitions run inside a
//! single transaction and check the expected current state, so consumers
//! observe a total order per row and never see an intermediate state. WAL
//! journalling keeps readers on a consistent snapshot while a writer
//! commits.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::info;
use uuid::Uuid;

use cachelot_core::model::{
    CacheEntry, CacheStatistics, CauseOperation, EntryStatus, ImportList, Page, QueryFilter,
    RelocationMethod, SearchScope, User, UserKind, UserSettingsPatch, UserSourceSettings,
};

use crate::error::{DataError, DataResult};

const ENTRY_COLUMNS: &str = "id, logical_path, original_location_path, fast_tier_path, \
     size_bytes, cached_at, last_accessed_at, access_count, cause, cause_user_id, status, \
     method, checksum, metadata, removal_reason, removed_at";

const DEFAULT_PAGE_LIMIT: u64 = 100;

/// Inputs for creating a `staging` row ahead of a relocation copy.
#[derive(Debug, Clone)]
pub struct StagingRequest {
    /// Path the media server sees.
    pub logical_path: PathBuf,
    /// Real slow-tier file backing the logical path.
    pub original_location_path: PathBuf,
    /// Fast-tier target the copy will write to.
    pub fast_tier_path: PathBuf,
    /// Why the file is being cached.
    pub cause: CauseOperation,
    /// User who caused the caching, when attributable.
    pub cause_user_id: Option<Uuid>,
    /// Free-form metadata recorded on the row.
    pub metadata: Value,
}

/// Database-backed repository for cache placement state.
#[derive(Clone)]
pub struct TrackerStore {
    pool: SqlitePool,
}

impl TrackerStore {
    /// Open (or create) the tracker database and apply pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or migrations fail;
    /// both are unrecoverable storage failures at startup.
    pub async fn open(path: &Path) -> DataResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|source| DataError::sqlx("open", source))?;

        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator
            .run(&pool)
            .await
            .map_err(|source| DataError::Migrate { source })?;

        info!(path = %path.display(), "tracker database ready");
        Ok(Self { pool })
    }

    /// Create a `staging` row for a relocation, or return the existing
    /// non-removed row for the same logical path.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction cannot be committed.
    pub async fn upsert_staging(&self, request: StagingRequest) -> DataResult<CacheEntry> {
        let logical = path_str("logical_path", &request.logical_path)?.to_string();
        let original = path_str("original_location_path", &request.original_location_path)?
            .to_string();
        let fast = path_str("fast_tier_path", &request.fast_tier_path)?.to_string();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|source| DataError::sqlx("upsert_staging.begin", source))?;

        let existing = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM cache_entries WHERE logical_path = ? AND status != 'removed'"
        ))
        .bind(&logical)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|source| DataError::sqlx("upsert_staging.select", source))?;

        if let Some(row) = existing {
            let mut entry = entry_from_row(&row)?;
            if let Some(user) = request.cause_user_id {
                sqlx::query("INSERT OR IGNORE INTO attributions (entry_id, user_id) VALUES (?, ?)")
                    .bind(entry.id.to_string())
                    .bind(user.to_string())
                    .execute(&mut *tx)
                    .await
                    .map_err(|source| DataError::sqlx("upsert_staging.attribute", source))?;
            }
            tx.commit()
                .await
                .map_err(|source| DataError::sqlx("upsert_staging.commit", source))?;
            entry.attributions = self.attributions(entry.id).await?;
            return Ok(entry);
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO cache_entries (id, logical_path, original_location_path, \
             fast_tier_path, size_bytes, cached_at, last_accessed_at, access_count, cause, \
             cause_user_id, status, method, metadata) \
             VALUES (?, ?, ?, ?, 0, ?, ?, 0, ?, ?, 'staging', ?, ?)",
        )
        .bind(id.to_string())
        .bind(&logical)
        .bind(&original)
        .bind(&fast)
        .bind(now)
        .bind(now)
        .bind(request.cause.label())
        .bind(request.cause_user_id.map(|user| user.to_string()))
        .bind(RelocationMethod::AtomicCopy.as_str())
        .bind(request.metadata.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|source| DataError::sqlx("upsert_staging.insert", source))?;

        let mut attributions = BTreeSet::new();
        if let Some(user) = request.cause_user_id {
            attributions.insert(user);
            sqlx::query("INSERT OR IGNORE INTO attributions (entry_id, user_id) VALUES (?, ?)")
                .bind(id.to_string())
                .bind(user.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|source| DataError::sqlx("upsert_staging.attribute", source))?;
        }

        tx.commit()
            .await
            .map_err(|source| DataError::sqlx("upsert_staging.commit", source))?;

        Ok(CacheEntry {
            id,
            logical_path: request.logical_path,
            original_location_path: request.original_location_path,
            fast_tier_path: request.fast_tier_path,
            size_bytes: 0,
            cached_at: now,
            last_accessed_at: now,
            access_count: 0,
            cause: request.cause,
            cause_user_id: request.cause_user_id,
            attributions,
            status: EntryStatus::Staging,
            method: RelocationMethod::AtomicCopy,
            checksum: None,
            metadata: request.metadata,
        })
    }

    /// Commit a `staging` row to `active` after the symlink swap.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the row is no longer in `staging`.
    pub async fn mark_active(
        &self,
        entry_id: Uuid,
        size_bytes: u64,
        checksum: Option<String>,
    ) -> DataResult<()> {
        let result = sqlx::query(
            "UPDATE cache_entries SET status = 'active', size_bytes = ?2, checksum = ?3, \
             last_accessed_at = ?4 WHERE id = ?1 AND status = 'staging'",
        )
        .bind(entry_id.to_string())
        .bind(i64::try_from(size_bytes).unwrap_or(i64::MAX))
        .bind(checksum)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|source| DataError::sqlx("mark_active", source))?;
        require_transition("mark_active", entry_id, result.rows_affected())
    }

    /// Move a row to `pending_removal`, recording why.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the row is not in `active` or `orphaned`.
    pub async fn mark_pending_removal(&self, entry_id: Uuid, reason: &str) -> DataResult<()> {
        let result = sqlx::query(
            "UPDATE cache_entries SET status = 'pending_removal', removal_reason = ?2 \
             WHERE id = ?1 AND status IN ('active', 'orphaned')",
        )
        .bind(entry_id.to_string())
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(|source| DataError::sqlx("mark_pending_removal", source))?;
        require_transition("mark_pending_removal", entry_id, result.rows_affected())
    }

    /// Terminal transition after the fast file is gone and the original path
    /// restored.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the row is already `removed`.
    pub async fn mark_removed(&self, entry_id: Uuid) -> DataResult<()> {
        let result = sqlx::query(
            "UPDATE cache_entries SET status = 'removed', removed_at = ?2 \
             WHERE id = ?1 AND status != 'removed'",
        )
        .bind(entry_id.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|source| DataError::sqlx("mark_removed", source))?;
        require_transition("mark_removed", entry_id, result.rows_affected())
    }

    /// Flag a row whose fast file went missing.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the row is not in `active` or `pending_removal`.
    pub async fn mark_orphaned(&self, entry_id: Uuid) -> DataResult<()> {
        let result = sqlx::query(
            "UPDATE cache_entries SET status = 'orphaned' \
             WHERE id = ?1 AND status IN ('active', 'pending_removal')",
        )
        .bind(entry_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|source| DataError::sqlx("mark_orphaned", source))?;
        require_transition("mark_orphaned", entry_id, result.rows_affected())
    }

    /// Drop a row entirely. Used by crash recovery for `staging` leftovers
    /// that never reached the commit point.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletion fails.
    pub async fn delete(&self, entry_id: Uuid) -> DataResult<()> {
        sqlx::query("DELETE FROM cache_entries WHERE id = ?")
            .bind(entry_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|source| DataError::sqlx("delete", source))?;
        Ok(())
    }

    /// Bump access bookkeeping and attribute the access to a user.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the row does not exist.
    pub async fn touch(&self, entry_id: Uuid, user_id: Option<Uuid>) -> DataResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|source| DataError::sqlx("touch.begin", source))?;

        let updated = sqlx::query(
            "UPDATE cache_entries SET last_accessed_at = ?2, access_count = access_count + 1 \
             WHERE id = ?1",
        )
        .bind(entry_id.to_string())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|source| DataError::sqlx("touch.update", source))?;

        if updated.rows_affected() == 0 {
            return Err(DataError::NotFound {
                entity: "entry",
                id: entry_id.to_string(),
            });
        }

        if let Some(user) = user_id {
            sqlx::query("INSERT OR IGNORE INTO attributions (entry_id, user_id) VALUES (?, ?)")
                .bind(entry_id.to_string())
                .bind(user.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|source| DataError::sqlx("touch.attribute", source))?;
        }

        tx.commit()
            .await
            .map_err(|source| DataError::sqlx("touch.commit", source))
    }

    /// Fetch one row by identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a column cannot be decoded.
    pub async fn get(&self, entry_id: Uuid) -> DataResult<Option<CacheEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM cache_entries WHERE id = ?"
        ))
        .bind(entry_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|source| DataError::sqlx("get", source))?;
        match row {
            Some(row) => {
                let mut entry = entry_from_row(&row)?;
                entry.attributions = self.attributions(entry.id).await?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Fetch the non-removed row for a logical path.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a column cannot be decoded.
    pub async fn find_by_path(&self, logical_path: &Path) -> DataResult<Option<CacheEntry>> {
        let logical = path_str("logical_path", logical_path)?;
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM cache_entries \
             WHERE logical_path = ? AND status != 'removed'"
        ))
        .bind(logical)
        .fetch_optional(&self.pool)
        .await
        .map_err(|source| DataError::sqlx("find_by_path", source))?;
        match row {
            Some(row) => {
                let mut entry = entry_from_row(&row)?;
                entry.attributions = self.attributions(entry.id).await?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// All rows in the given lifecycle states, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a column cannot be decoded.
    pub async fn entries_with_status(
        &self,
        statuses: &[EntryStatus],
    ) -> DataResult<Vec<CacheEntry>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {ENTRY_COLUMNS} FROM cache_entries WHERE status IN ("
        ));
        let mut separated = builder.separated(", ");
        for status in statuses {
            separated.push_bind(status.as_str());
        }
        builder.push(") ORDER BY cached_at ASC");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|source| DataError::sqlx("entries_with_status", source))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut entry = entry_from_row(row)?;
            entry.attributions = self.attributions(entry.id).await?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Page through rows matching a filter, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a column cannot be decoded.
    pub async fn query(&self, filter: &QueryFilter) -> DataResult<Page<CacheEntry>> {
        let limit = if filter.limit == 0 {
            DEFAULT_PAGE_LIMIT
        } else {
            filter.limit
        };

        let mut count_builder = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) FROM cache_entries WHERE 1 = 1",
        );
        push_filter(&mut count_builder, filter)?;
        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|source| DataError::sqlx("query.count", source))?;

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {ENTRY_COLUMNS} FROM cache_entries WHERE 1 = 1"
        ));
        push_filter(&mut builder, filter)?;
        builder.push(" ORDER BY cached_at DESC LIMIT ");
        builder.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        builder.push(" OFFSET ");
        builder.push_bind(i64::try_from(filter.offset).unwrap_or(i64::MAX));

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|source| DataError::sqlx("query.page", source))?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut entry = entry_from_row(row)?;
            entry.attributions = self.attributions(entry.id).await?;
            items.push(entry);
        }

        Ok(Page {
            items,
            total: u64::try_from(total).unwrap_or_default(),
            offset: filter.offset,
        })
    }

    /// Substring search over the requested scope.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a column cannot be decoded.
    pub async fn search(
        &self,
        needle: &str,
        scope: SearchScope,
        limit: u64,
        include_removed: bool,
    ) -> DataResult<Vec<CacheEntry>> {
        let pattern = format!("%{}%", needle.replace('%', "\\%").replace('_', "\\_"));
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {ENTRY_COLUMNS} FROM cache_entries WHERE "
        ));
        match scope {
            SearchScope::Paths => {
                builder.push("logical_path LIKE ");
                builder.push_bind(pattern);
                builder.push(" ESCAPE '\\'");
            }
            SearchScope::Causes => {
                builder.push("cause LIKE ");
                builder.push_bind(pattern);
                builder.push(" ESCAPE '\\'");
            }
            SearchScope::All => {
                builder.push("(logical_path LIKE ");
                builder.push_bind(pattern.clone());
                builder.push(" ESCAPE '\\' OR cause LIKE ");
                builder.push_bind(pattern);
                builder.push(" ESCAPE '\\')");
            }
        }
        if !include_removed {
            builder.push(" AND status != 'removed'");
        }
        builder.push(" ORDER BY cached_at DESC LIMIT ");
        builder.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|source| DataError::sqlx("search", source))?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut entry = entry_from_row(row)?;
            entry.attributions = self.attributions(entry.id).await?;
            items.push(entry);
        }
        Ok(items)
    }

    /// Aggregate statistics over non-removed rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the aggregate query fails.
    pub async fn stats(&self, limit_bytes: u64) -> DataResult<CacheStatistics> {
        let row = sqlx::query(
            "SELECT \
               COALESCE(SUM(CASE WHEN status IN ('active', 'staging') THEN size_bytes END), 0) \
                 AS used_bytes, \
               COALESCE(SUM(CASE WHEN status = 'active' THEN 1 END), 0) AS active_count, \
               COALESCE(SUM(CASE WHEN status = 'staging' THEN 1 END), 0) AS staging_count, \
               COALESCE(SUM(CASE WHEN status = 'orphaned' THEN 1 END), 0) AS orphaned_count, \
               COALESCE(SUM(CASE WHEN status = 'pending_removal' THEN 1 END), 0) \
                 AS pending_count \
             FROM cache_entries",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|source| DataError::sqlx("stats", source))?;

        let used = u64::try_from(row.try_get::<i64, _>("used_bytes").unwrap_or(0))
            .unwrap_or_default();
        let used_percent = usage_percent(used, limit_bytes);

        Ok(CacheStatistics {
            total_size_bytes: used,
            limit_bytes,
            used_percent,
            file_count: count_column(&row, "active_count"),
            staging_count: count_column(&row, "staging_count"),
            orphaned_count: count_column(&row, "orphaned_count"),
            pending_removal_count: count_column(&row, "pending_count"),
            health: CacheStatistics::health_for(used_percent),
        })
    }

    /// Prune `removed` rows older than the cutoff. Returns how many were
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletion fails.
    pub async fn prune_removed(&self, cutoff: DateTime<Utc>) -> DataResult<u64> {
        let result = sqlx::query(
            "DELETE FROM cache_entries WHERE status = 'removed' AND removed_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|source| DataError::sqlx("prune_removed", source))?;
        Ok(result.rows_affected())
    }

    /// Upsert a discovered user, preserving operator-managed fields
    /// (enabled flag, bias, per-source settings) on conflict.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn upsert_user(&self, user: &User) -> DataResult<()> {
        let settings = serde_json::to_string(&user.settings)
            .map_err(|err| DataError::decode("settings", err.to_string()))?;
        sqlx::query(
            "INSERT INTO users (id, display_name, kind, token_opaque, last_seen, enabled, \
             priority_bias, settings) VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET display_name = excluded.display_name, \
             kind = excluded.kind, token_opaque = excluded.token_opaque, \
             last_seen = excluded.last_seen",
        )
        .bind(user.id.to_string())
        .bind(&user.display_name)
        .bind(user.kind.as_str())
        .bind(&user.token_opaque)
        .bind(user.last_seen)
        .bind(user.enabled)
        .bind(user.priority_bias)
        .bind(settings)
        .execute(&self.pool)
        .await
        .map_err(|source| DataError::sqlx("upsert_user", source))?;
        Ok(())
    }

    /// All known users.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a column cannot be decoded.
    pub async fn users(&self) -> DataResult<Vec<User>> {
        let rows = sqlx::query(
            "SELECT id, display_name, kind, token_opaque, last_seen, enabled, priority_bias, \
             settings FROM users ORDER BY display_name ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|source| DataError::sqlx("users", source))?;
        rows.iter().map(user_from_row).collect()
    }

    /// Fetch one user.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a column cannot be decoded.
    pub async fn get_user(&self, user_id: Uuid) -> DataResult<Option<User>> {
        let row = sqlx::query(
            "SELECT id, display_name, kind, token_opaque, last_seen, enabled, priority_bias, \
             settings FROM users WHERE id = ?",
        )
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|source| DataError::sqlx("get_user", source))?;
        row.as_ref().map(user_from_row).transpose()
    }

    /// Apply a settings patch to a user and return the updated record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the user does not exist.
    pub async fn apply_user_patch(
        &self,
        user_id: Uuid,
        patch: &UserSettingsPatch,
    ) -> DataResult<User> {
        let mut user = self.get_user(user_id).await?.ok_or(DataError::NotFound {
            entity: "user",
            id: user_id.to_string(),
        })?;

        if let Some(enabled) = patch.enabled {
            user.enabled = enabled;
        }
        if let Some(bias) = patch.priority_bias {
            user.priority_bias = bias;
        }
        if let Some(ondeck) = patch.ondeck {
            user.settings.ondeck = ondeck;
        }
        if let Some(watchlist) = patch.watchlist {
            user.settings.watchlist = watchlist;
        }
        if let Some(active) = patch.active_enabled {
            user.settings.active_enabled = active;
        }
        if let Some(lists) = patch.lists_enabled {
            user.settings.lists_enabled = lists;
        }

        let settings = serde_json::to_string(&user.settings)
            .map_err(|err| DataError::decode("settings", err.to_string()))?;
        sqlx::query(
            "UPDATE users SET enabled = ?2, priority_bias = ?3, settings = ?4 WHERE id = ?1",
        )
        .bind(user.id.to_string())
        .bind(user.enabled)
        .bind(user.priority_bias)
        .bind(settings)
        .execute(&self.pool)
        .await
        .map_err(|source| DataError::sqlx("apply_user_patch", source))?;

        Ok(user)
    }

    /// Register an import list.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails (including duplicate names).
    pub async fn insert_list(&self, list: &ImportList) -> DataResult<()> {
        let definition = serde_json::to_string(&list.definition)
            .map_err(|err| DataError::decode("definition", err.to_string()))?;
        sqlx::query(
            "INSERT INTO import_lists (id, name, definition, last_refreshed, stale) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(list.id.to_string())
        .bind(&list.definition.name)
        .bind(definition)
        .bind(list.last_refreshed)
        .bind(list.stale)
        .execute(&self.pool)
        .await
        .map_err(|source| DataError::sqlx("insert_list", source))?;
        Ok(())
    }

    /// Remove an import list. Returns whether a row was deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletion fails.
    pub async fn delete_list(&self, list_id: Uuid) -> DataResult<bool> {
        let result = sqlx::query("DELETE FROM import_lists WHERE id = ?")
            .bind(list_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|source| DataError::sqlx("delete_list", source))?;
        Ok(result.rows_affected() > 0)
    }

    /// All registered import lists.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a column cannot be decoded.
    pub async fn lists(&self) -> DataResult<Vec<ImportList>> {
        let rows = sqlx::query(
            "SELECT id, definition, last_refreshed, stale FROM import_lists ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|source| DataError::sqlx("lists", source))?;
        rows.iter().map(list_from_row).collect()
    }

    /// Fetch one import list.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a column cannot be decoded.
    pub async fn get_list(&self, list_id: Uuid) -> DataResult<Option<ImportList>> {
        let row = sqlx::query(
            "SELECT id, definition, last_refreshed, stale FROM import_lists WHERE id = ?",
        )
        .bind(list_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|source| DataError::sqlx("get_list", source))?;
        row.as_ref().map(list_from_row).transpose()
    }

    /// Clear a list's refresh timestamp so the next cycle refreshes it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the list does not exist.
    pub async fn force_list_due(&self, list_id: Uuid) -> DataResult<()> {
        let result = sqlx::query("UPDATE import_lists SET last_refreshed = NULL WHERE id = ?")
            .bind(list_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|source| DataError::sqlx("force_list_due", source))?;
        if result.rows_affected() == 0 {
            return Err(DataError::NotFound {
                entity: "list",
                id: list_id.to_string(),
            });
        }
        Ok(())
    }

    /// Record the outcome of a provider refresh.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the list does not exist.
    pub async fn mark_list_refresh(
        &self,
        list_id: Uuid,
        refreshed_at: Option<DateTime<Utc>>,
        stale: bool,
    ) -> DataResult<()> {
        let result = sqlx::query(
            "UPDATE import_lists SET last_refreshed = COALESCE(?2, last_refreshed), stale = ?3 \
             WHERE id = ?1",
        )
        .bind(list_id.to_string())
        .bind(refreshed_at)
        .bind(stale)
        .execute(&self.pool)
        .await
        .map_err(|source| DataError::sqlx("mark_list_refresh", source))?;
        if result.rows_affected() == 0 {
            return Err(DataError::NotFound {
                entity: "list",
                id: list_id.to_string(),
            });
        }
        Ok(())
    }

    async fn attributions(&self, entry_id: Uuid) -> DataResult<BTreeSet<Uuid>> {
        let rows = sqlx::query("SELECT user_id FROM attributions WHERE entry_id = ?")
            .bind(entry_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(|source| DataError::sqlx("attributions", source))?;
        rows.iter()
            .map(|row| {
                let raw: String = row
                    .try_get("user_id")
                    .map_err(|source| DataError::sqlx("attributions.decode", source))?;
                parse_uuid("user_id", &raw)
            })
            .collect()
    }

}

/// Usage as a percentage of the configured limit.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn usage_percent(used: u64, limit_bytes: u64) -> f64 {
    if limit_bytes == 0 {
        0.0
    } else {
        (used as f64 / limit_bytes as f64) * 100.0
    }
}

fn require_transition(
    operation: &'static str,
    entry_id: Uuid,
    rows_affected: u64,
) -> DataResult<()> {
    if rows_affected == 0 {
        return Err(DataError::Conflict {
            operation,
            entity: "entry",
            id: entry_id.to_string(),
        });
    }
    Ok(())
}

fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &QueryFilter) -> DataResult<()> {
    if !filter.include_removed {
        builder.push(" AND status != 'removed'");
    }
    if let Some(status) = filter.status {
        builder.push(" AND status = ");
        builder.push_bind(status.as_str());
    }
    if let Some(cause) = &filter.cause {
        builder.push(" AND cause = ");
        builder.push_bind(cause.clone());
    }
    if let Some(user) = filter.user_id {
        builder.push(" AND id IN (SELECT entry_id FROM attributions WHERE user_id = ");
        builder.push_bind(user.to_string());
        builder.push(")");
    }
    if let Some(prefix) = &filter.path_prefix {
        let prefix = path_str("path_prefix", prefix)?;
        builder.push(" AND logical_path LIKE ");
        builder.push_bind(format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_")));
        builder.push(" ESCAPE '\\'");
    }
    Ok(())
}

fn path_str<'a>(field: &'static str, path: &'a Path) -> DataResult<&'a str> {
    path.to_str().ok_or_else(|| DataError::PathNotUtf8 {
        field,
        path: path.to_path_buf(),
    })
}

fn parse_uuid(column: &'static str, raw: &str) -> DataResult<Uuid> {
    Uuid::from_str(raw).map_err(|_| DataError::decode(column, raw))
}

fn count_column(row: &SqliteRow, column: &str) -> u64 {
    row.try_get::<i64, _>(column)
        .ok()
        .and_then(|count| u64::try_from(count).ok())
        .unwrap_or_default()
}

fn entry_from_row(row: &SqliteRow) -> DataResult<CacheEntry> {
    let id_raw: String = row
        .try_get("id")
        .map_err(|source| DataError::sqlx("entry_from_row.id", source))?;
    let cause_raw: String = row
        .try_get("cause")
        .map_err(|source| DataError::sqlx("entry_from_row.cause", source))?;
    let status_raw: String = row
        .try_get("status")
        .map_err(|source| DataError::sqlx("entry_from_row.status", source))?;
    let cause_user_raw: Option<String> = row
        .try_get("cause_user_id")
        .map_err(|source| DataError::sqlx("entry_from_row.cause_user", source))?;
    let metadata_raw: String = row
        .try_get("metadata")
        .map_err(|source| DataError::sqlx("entry_from_row.metadata", source))?;

    let logical: String = row
        .try_get("logical_path")
        .map_err(|source| DataError::sqlx("entry_from_row.logical_path", source))?;
    let original: String = row
        .try_get("original_location_path")
        .map_err(|source| DataError::sqlx("entry_from_row.original_path", source))?;
    let fast: String = row
        .try_get("fast_tier_path")
        .map_err(|source| DataError::sqlx("entry_from_row.fast_path", source))?;

    Ok(CacheEntry {
        id: parse_uuid("id", &id_raw)?,
        logical_path: PathBuf::from(logical),
        original_location_path: PathBuf::from(original),
        fast_tier_path: PathBuf::from(fast),
        size_bytes: u64::try_from(
            row.try_get::<i64, _>("size_bytes")
                .map_err(|source| DataError::sqlx("entry_from_row.size", source))?,
        )
        .unwrap_or_default(),
        cached_at: row
            .try_get("cached_at")
            .map_err(|source| DataError::sqlx("entry_from_row.cached_at", source))?,
        last_accessed_at: row
            .try_get("last_accessed_at")
            .map_err(|source| DataError::sqlx("entry_from_row.last_accessed_at", source))?,
        access_count: u64::try_from(
            row.try_get::<i64, _>("access_count")
                .map_err(|source| DataError::sqlx("entry_from_row.access_count", source))?,
        )
        .unwrap_or_default(),
        cause: CauseOperation::parse(&cause_raw)
            .ok_or_else(|| DataError::decode("cause", &cause_raw))?,
        cause_user_id: cause_user_raw
            .as_deref()
            .map(|raw| parse_uuid("cause_user_id", raw))
            .transpose()?,
        attributions: BTreeSet::new(),
        status: EntryStatus::parse(&status_raw)
            .ok_or_else(|| DataError::decode("status", &status_raw))?,
        method: RelocationMethod::AtomicCopy,
        checksum: row
            .try_get("checksum")
            .map_err(|source| DataError::sqlx("entry_from_row.checksum", source))?,
        metadata: serde_json::from_str(&metadata_raw)
            .map_err(|_| DataError::decode("metadata", &metadata_raw))?,
    })
}

fn user_from_row(row: &SqliteRow) -> DataResult<User> {
    let id_raw: String = row
        .try_get("id")
        .map_err(|source| DataError::sqlx("user_from_row.id", source))?;
    let kind_raw: String = row
        .try_get("kind")
        .map_err(|source| DataError::sqlx("user_from_row.kind", source))?;
    let settings_raw: String = row
        .try_get("settings")
        .map_err(|source| DataError::sqlx("user_from_row.settings", source))?;

    let settings: UserSourceSettings = if settings_raw.trim().is_empty() || settings_raw == "{}" {
        UserSourceSettings::default()
    } else {
        serde_json::from_str(&settings_raw)
            .map_err(|_| DataError::decode("settings", &settings_raw))?
    };

    Ok(User {
        id: parse_uuid("id", &id_raw)?,
        display_name: row
            .try_get("display_name")
            .map_err(|source| DataError::sqlx("user_from_row.display_name", source))?,
        kind: UserKind::parse(&kind_raw).ok_or_else(|| DataError::decode("kind", &kind_raw))?,
        token_opaque: row
            .try_get("token_opaque")
            .map_err(|source| DataError::sqlx("user_from_row.token", source))?,
        last_seen: row
            .try_get("last_seen")
            .map_err(|source| DataError::sqlx("user_from_row.last_seen", source))?,
        enabled: row
            .try_get("enabled")
            .map_err(|source| DataError::sqlx("user_from_row.enabled", source))?,
        priority_bias: row
            .try_get("priority_bias")
            .map_err(|source| DataError::sqlx("user_from_row.priority_bias", source))?,
        settings,
    })
}

fn list_from_row(row: &SqliteRow) -> DataResult<ImportList> {
    let id_raw: String = row
        .try_get("id")
        .map_err(|source| DataError::sqlx("list_from_row.id", source))?;
    let definition_raw: String = row
        .try_get("definition")
        .map_err(|source| DataError::sqlx("list_from_row.definition", source))?;

    Ok(ImportList {
        id: parse_uuid("id", &id_raw)?,
        definition: serde_json::from_str(&definition_raw)
            .map_err(|_| DataError::decode("definition", &definition_raw))?,
        last_refreshed: row
            .try_get("last_refreshed")
            .map_err(|source| DataError::sqlx("list_from_row.last_refreshed", source))?,
        stale: row
            .try_get("stale")
            .map_err(|source| DataError::sqlx("list_from_row.stale", source))?,
    })
}
