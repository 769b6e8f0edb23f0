use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Result;
use cachelot_core::model::{
    CacheEntry, CauseOperation, EntryStatus, QueryFilter, SearchScope, User, UserKind,
    UserSettingsPatch, UserSourceSettings,
};
use cachelot_core::model::ImportList;
use cachelot_config::{ListDefinition, ListMode, ProviderKind};
use cachelot_data::{DataError, StagingRequest, TrackerStore};
use cachelot_events::CacheHealth;
use chrono::{Duration, Utc};
use tempfile::TempDir;
use uuid::Uuid;

async fn open_store() -> Result<(TempDir, TrackerStore)> {
    let dir = tempfile::tempdir()?;
    let store = TrackerStore::open(&dir.path().join("tracker.db")).await?;
    Ok((dir, store))
}

fn staging_request(path: &str, user: Option<Uuid>) -> StagingRequest {
    StagingRequest {
        logical_path: PathBuf::from(path),
        original_location_path: PathBuf::from(path),
        fast_tier_path: PathBuf::from(format!("/mnt/cache{path}")),
        cause: CauseOperation::OnDeck,
        cause_user_id: user,
        metadata: serde_json::json!({}),
    }
}

async fn stage_active(store: &TrackerStore, path: &str, size: u64) -> Result<CacheEntry> {
    let entry = store.upsert_staging(staging_request(path, None)).await?;
    store.mark_active(entry.id, size, None).await?;
    Ok(store
        .get(entry.id)
        .await?
        .expect("entry must exist after activation"))
}

#[tokio::test]
async fn staging_is_idempotent_per_logical_path() -> Result<()> {
    let (_dir, store) = open_store().await?;
    let user_a = Uuid::new_v4();
    let user_b = Uuid::new_v4();

    let first = store
        .upsert_staging(staging_request("/library/a.mkv", Some(user_a)))
        .await?;
    let second = store
        .upsert_staging(staging_request("/library/a.mkv", Some(user_b)))
        .await?;

    assert_eq!(first.id, second.id, "same path must reuse the row");
    assert_eq!(second.attributions, BTreeSet::from([user_a, user_b]));

    let page = store.query(&QueryFilter::default()).await?;
    assert_eq!(page.total, 1);
    Ok(())
}

#[tokio::test]
async fn lifecycle_transitions_enforce_current_state() -> Result<()> {
    let (_dir, store) = open_store().await?;
    let entry = store
        .upsert_staging(staging_request("/library/b.mkv", None))
        .await?;

    store
        .mark_active(entry.id, 2_048, Some("deadbeef".to_string()))
        .await?;
    let activated = store.get(entry.id).await?.expect("row exists");
    assert_eq!(activated.status, EntryStatus::Active);
    assert_eq!(activated.size_bytes, 2_048);
    assert_eq!(activated.checksum.as_deref(), Some("deadbeef"));

    // Double activation finds no staging row.
    let err = store.mark_active(entry.id, 2_048, None).await.unwrap_err();
    assert!(matches!(err, DataError::Conflict { .. }));

    store.mark_pending_removal(entry.id, "eviction").await?;
    store.mark_removed(entry.id).await?;
    let removed = store.get(entry.id).await?.expect("row retained for audit");
    assert_eq!(removed.status, EntryStatus::Removed);

    // The path is free for a new row now.
    let replacement = store
        .upsert_staging(staging_request("/library/b.mkv", None))
        .await?;
    assert_ne!(replacement.id, entry.id);
    Ok(())
}

#[tokio::test]
async fn touch_bumps_counters_and_attributions() -> Result<()> {
    let (_dir, store) = open_store().await?;
    let entry = stage_active(&store, "/library/c.mkv", 1_024).await?;
    let viewer = Uuid::new_v4();

    store.touch(entry.id, Some(viewer)).await?;
    store.touch(entry.id, Some(viewer)).await?;

    let touched = store.get(entry.id).await?.expect("row exists");
    assert_eq!(touched.access_count, entry.access_count + 2);
    assert!(touched.attributions.contains(&viewer));
    assert!(touched.last_accessed_at >= entry.last_accessed_at);

    let missing = store.touch(Uuid::new_v4(), None).await.unwrap_err();
    assert!(matches!(missing, DataError::NotFound { .. }));
    Ok(())
}

#[tokio::test]
async fn query_filters_and_paginates() -> Result<()> {
    let (_dir, store) = open_store().await?;
    for index in 0..5 {
        stage_active(&store, &format!("/library/shows/e{index}.mkv"), 100).await?;
    }
    stage_active(&store, "/library/movies/m.mkv", 100).await?;

    let shows = store
        .query(&QueryFilter {
            path_prefix: Some(PathBuf::from("/library/shows")),
            ..QueryFilter::default()
        })
        .await?;
    assert_eq!(shows.total, 5);

    let page = store
        .query(&QueryFilter {
            limit: 2,
            offset: 2,
            ..QueryFilter::default()
        })
        .await?;
    assert_eq!(page.total, 6);
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.offset, 2);

    let found = store
        .search("movies", SearchScope::Paths, 10, false)
        .await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].logical_path, PathBuf::from("/library/movies/m.mkv"));

    let by_cause = store
        .search("ondeck", SearchScope::Causes, 10, false)
        .await?;
    assert_eq!(by_cause.len(), 6, "every staged row carries the cause");
    Ok(())
}

#[tokio::test]
async fn stats_reflect_usage_and_health() -> Result<()> {
    let (_dir, store) = open_store().await?;
    stage_active(&store, "/library/a.mkv", 500).await?;
    stage_active(&store, "/library/b.mkv", 400).await?;

    let stats = store.stats(1_000).await?;
    assert_eq!(stats.total_size_bytes, 900);
    assert_eq!(stats.file_count, 2);
    assert!((stats.used_percent - 90.0).abs() < f64::EPSILON);
    assert_eq!(stats.health, CacheHealth::Warning);
    Ok(())
}

#[tokio::test]
async fn removed_rows_are_pruned_after_the_audit_window() -> Result<()> {
    let (_dir, store) = open_store().await?;
    let entry = stage_active(&store, "/library/old.mkv", 100).await?;
    store.mark_pending_removal(entry.id, "retention").await?;
    store.mark_removed(entry.id).await?;

    // Not yet past the window.
    let pruned = store.prune_removed(Utc::now() - Duration::days(30)).await?;
    assert_eq!(pruned, 0);

    let pruned = store.prune_removed(Utc::now() + Duration::days(1)).await?;
    assert_eq!(pruned, 1);
    assert!(store.get(entry.id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn users_round_trip_with_patches() -> Result<()> {
    let (_dir, store) = open_store().await?;
    let user = User {
        id: Uuid::new_v4(),
        display_name: "alex".to_string(),
        kind: UserKind::Household,
        token_opaque: "tok".to_string(),
        last_seen: Some(Utc::now()),
        enabled: true,
        priority_bias: 0,
        settings: UserSourceSettings::default(),
    };
    store.upsert_user(&user).await?;

    let patched = store
        .apply_user_patch(
            user.id,
            &UserSettingsPatch {
                priority_bias: Some(25),
                active_enabled: Some(true),
                ..UserSettingsPatch::default()
            },
        )
        .await?;
    assert_eq!(patched.priority_bias, 25);
    assert!(patched.settings.active_enabled);

    // Re-discovery refreshes upstream fields but keeps operator settings.
    let mut rediscovered = user.clone();
    rediscovered.display_name = "Alex".to_string();
    store.upsert_user(&rediscovered).await?;
    let kept = store.get_user(user.id).await?.expect("user exists");
    assert_eq!(kept.display_name, "Alex");
    assert_eq!(kept.priority_bias, 25);

    let unknown = store
        .apply_user_patch(Uuid::new_v4(), &UserSettingsPatch::default())
        .await
        .unwrap_err();
    assert!(matches!(unknown, DataError::NotFound { .. }));
    Ok(())
}

#[tokio::test]
async fn import_lists_round_trip() -> Result<()> {
    let (_dir, store) = open_store().await?;
    let list = ImportList {
        id: Uuid::new_v4(),
        definition: ListDefinition {
            name: "trending".to_string(),
            provider: ProviderKind::Trending,
            url: None,
            user: None,
            priority_bias: 10,
            refresh_period_s: 3_600,
            mode: ListMode::Strict,
            count_cap: 20,
        },
        last_refreshed: None,
        stale: false,
    };
    store.insert_list(&list).await?;

    let refreshed_at = Utc::now();
    store
        .mark_list_refresh(list.id, Some(refreshed_at), false)
        .await?;
    let stored = store.get_list(list.id).await?.expect("list exists");
    assert_eq!(stored.definition.name, "trending");
    assert!(stored.last_refreshed.is_some());
    assert!(!stored.stale);

    store.mark_list_refresh(list.id, None, true).await?;
    let stale = store.get_list(list.id).await?.expect("list exists");
    assert!(stale.stale);
    assert!(stale.last_refreshed.is_some(), "failure keeps the timestamp");

    assert!(store.delete_list(list.id).await?);
    assert!(!store.delete_list(list.id).await?);
    assert!(store.lists().await?.is_empty());
    Ok(())
}
