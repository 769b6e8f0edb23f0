//! Candidate enumeration for each cycle phase.
//!
//! The planner turns upstream state into [`Candidate`] values. It owns the
//! staleness and activity filters; the upstream client receives the bounds
//! only so the server can pre-filter, the rules are enforced here.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use cachelot_config::{ActivityWindows, ListMode};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{ProviderError, UpstreamResult};
use crate::model::{
    Candidate, CauseOperation, ImportList, MediaRef, PRIORITY_ACTIVE, PRIORITY_ACTIVE_OTHER,
    PRIORITY_LIST_BASE, PRIORITY_ONDECK, PRIORITY_WATCHLIST, PlaybackSession, STALENESS_CAP, User,
    UserKind,
};
use crate::service::{ListProvider, MediaServer};

/// Whether a cycle should enumerate this user at all, given the per-kind
/// activity windows. A window of `0` days means no bound; a user that has
/// never been seen is skipped whenever a bound applies.
#[must_use]
pub fn user_is_active(user: &User, windows: &ActivityWindows, now: DateTime<Utc>) -> bool {
    if !user.enabled {
        return false;
    }
    let window_days = match user.kind {
        UserKind::Owner => windows.owner_days,
        UserKind::Household => windows.household_days,
        UserKind::Guest => windows.guest_days,
    };
    if window_days == 0 {
        return true;
    }
    user.last_seen
        .is_some_and(|seen| age_days(now, seen) <= i64::from(window_days))
}

/// Bounded staleness deduction from an upstream timestamp. Capped so that
/// staleness can depress but never invert class ordering.
#[must_use]
pub fn staleness_score(now: DateTime<Utc>, signal: Option<DateTime<Utc>>) -> i64 {
    signal.map_or(0, |at| age_days(now, at).clamp(0, STALENESS_CAP))
}

fn age_days(now: DateTime<Utc>, then: DateTime<Utc>) -> i64 {
    (now - then).num_days()
}

fn candidate_from_media(
    media: MediaRef,
    base_priority: i64,
    cause: CauseOperation,
    user: Option<&User>,
    staleness: i64,
) -> Candidate {
    let cause_user = user.map(|u| u.id);
    let mut attributions = BTreeSet::new();
    if let Some(id) = cause_user {
        attributions.insert(id);
    }
    Candidate {
        logical_path: media.logical_path,
        size_bytes_hint: media.size_bytes_hint,
        base_priority,
        cause,
        cause_user,
        attributions,
        user_bias: user.map_or(0, |u| i64::from(u.priority_bias)),
        staleness_score: staleness,
    }
}

/// Enumerate Up Next candidates for one user.
///
/// # Errors
///
/// Propagates upstream client failures; the orchestrator decides whether to
/// skip the user or abort the phase.
pub async fn ondeck_candidates(
    server: &dyn MediaServer,
    user: &User,
    now: DateTime<Utc>,
) -> UpstreamResult<Vec<Candidate>> {
    let settings = user.settings.ondeck;
    if !settings.enabled {
        return Ok(Vec::new());
    }
    let items = server
        .on_deck(user, settings.episodes_ahead, settings.max_stale_days)
        .await?;

    Ok(items
        .into_iter()
        .filter(|media| {
            settings.max_stale_days == 0
                || media.last_watched_at.is_none_or(|watched| {
                    age_days(now, watched) <= i64::from(settings.max_stale_days)
                })
        })
        .take(usize::try_from(settings.episodes_ahead).unwrap_or(usize::MAX))
        .map(|media| {
            let staleness = staleness_score(now, media.last_watched_at);
            candidate_from_media(
                media,
                PRIORITY_ONDECK,
                CauseOperation::OnDeck,
                Some(user),
                staleness,
            )
        })
        .collect())
}

/// Enumerate watchlist candidates for one user. Items available longer than
/// the user's `max_available_days` are dropped, defending against catch-up
/// floods when a user watchlists an entire back catalogue.
///
/// # Errors
///
/// Propagates upstream client failures.
pub async fn watchlist_candidates(
    server: &dyn MediaServer,
    user: &User,
    now: DateTime<Utc>,
) -> UpstreamResult<Vec<Candidate>> {
    let settings = user.settings.watchlist;
    if !settings.enabled {
        return Ok(Vec::new());
    }
    let items = server
        .watchlist(user, settings.episodes_per_show, settings.max_available_days)
        .await?;

    Ok(items
        .into_iter()
        .filter(|media| {
            settings.max_available_days == 0
                || media.available_since.is_none_or(|available| {
                    age_days(now, available) <= i64::from(settings.max_available_days)
                })
        })
        .map(|media| {
            let staleness = staleness_score(now, media.available_since);
            candidate_from_media(
                media,
                PRIORITY_WATCHLIST,
                CauseOperation::Watchlist,
                Some(user),
                staleness,
            )
        })
        .collect())
}

/// One candidate per in-flight session still playing from the slow tier.
/// Sessions owned by enabled roster users rank at the maximal base; sessions
/// from unknown or disabled accounts rank one class lower.
#[must_use]
pub fn active_candidates(sessions: &[PlaybackSession], users: &[User]) -> Vec<Candidate> {
    let roster: HashMap<Uuid, &User> = users
        .iter()
        .filter(|user| user.enabled && user.settings.active_enabled)
        .map(|user| (user.id, user))
        .collect();

    sessions
        .iter()
        .filter(|session| !session.playing_from_fast)
        .map(|session| {
            let user = session.user_id.and_then(|id| roster.get(&id).copied());
            let base = if user.is_some() {
                PRIORITY_ACTIVE
            } else {
                PRIORITY_ACTIVE_OTHER
            };
            candidate_from_media(
                session.media.clone(),
                base,
                CauseOperation::Active,
                user,
                0,
            )
        })
        .collect()
}

/// Refresh one import list and resolve its items to library paths.
///
/// `strict` mode matches only the first `count_cap` items and drops the
/// unmatched; `fill` mode keeps consuming the feed until `count_cap` items
/// matched or the provider is exhausted.
///
/// # Errors
///
/// Returns `ProviderError` for both provider refresh failures and upstream
/// matching failures; the caller marks the list stale and continues.
pub async fn list_candidates(
    server: &dyn MediaServer,
    provider: &dyn ListProvider,
    list: &ImportList,
) -> Result<Vec<Candidate>, ProviderError> {
    let definition = &list.definition;
    let items = provider.refresh().await?;

    let scan: Vec<_> = match definition.mode {
        ListMode::Strict => items.into_iter().take(definition.count_cap).collect(),
        ListMode::Fill => items,
    };

    let mut candidates = Vec::new();
    for item in &scan {
        if candidates.len() >= definition.count_cap {
            break;
        }
        let matched =
            server
                .match_library(item)
                .await
                .map_err(|err| ProviderError::Failed {
                    provider: definition.name.clone(),
                    detail: err.to_string(),
                })?;
        if let Some(media) = matched {
            candidates.push(candidate_from_media(
                media,
                PRIORITY_LIST_BASE + i64::from(definition.priority_bias),
                CauseOperation::List(definition.name.clone()),
                None,
                0,
            ));
        }
    }
    Ok(candidates)
}

/// Merge candidates across phases by logical path, retaining the highest
/// adjusted priority and unioning attributions. The result is sorted by
/// descending adjusted priority for deterministic admission.
#[must_use]
pub fn merge(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut by_path: HashMap<PathBuf, Candidate> = HashMap::new();
    for candidate in candidates {
        match by_path.entry(candidate.logical_path.clone()) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(candidate);
            }
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                let kept = slot.get_mut();
                let attributions: Vec<Uuid> = candidate.attributions.iter().copied().collect();
                if candidate.adjusted_priority() > kept.adjusted_priority() {
                    let mut replacement = candidate;
                    replacement.attributions.extend(kept.attributions.iter());
                    *kept = replacement;
                } else {
                    kept.attributions.extend(attributions);
                }
            }
        }
    }

    let mut merged: Vec<Candidate> = by_path.into_values().collect();
    merged.sort_by(|a, b| {
        b.adjusted_priority()
            .cmp(&a.adjusted_priority())
            .then_with(|| a.logical_path.cmp(&b.logical_path))
    });
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamError;
    use crate::model::{ListItem, MediaKind, UserSourceSettings};
    use crate::service::tests_support::{StaticProvider, StaticServer};
    use cachelot_config::{ListDefinition, ProviderKind};
    use chrono::Duration;

    fn user(kind: UserKind, last_seen_days_ago: Option<i64>, now: DateTime<Utc>) -> User {
        User {
            id: Uuid::new_v4(),
            display_name: "u".to_string(),
            kind,
            token_opaque: "tok".to_string(),
            last_seen: last_seen_days_ago.map(|days| now - Duration::days(days)),
            enabled: true,
            priority_bias: 0,
            settings: UserSourceSettings {
                active_enabled: true,
                lists_enabled: true,
                ..UserSourceSettings::default()
            },
        }
    }

    fn media(path: &str, size: u64) -> MediaRef {
        MediaRef {
            logical_path: PathBuf::from(path),
            size_bytes_hint: size,
            upstream_id: path.to_string(),
            kind: MediaKind::Movie,
            last_watched_at: None,
            available_since: None,
        }
    }

    #[test]
    fn activity_windows_filter_by_kind() {
        let now = Utc::now();
        let windows = ActivityWindows {
            owner_days: 0,
            household_days: 30,
            guest_days: 7,
        };

        assert!(user_is_active(&user(UserKind::Owner, None, now), &windows, now));
        assert!(user_is_active(
            &user(UserKind::Household, Some(10), now),
            &windows,
            now
        ));
        assert!(!user_is_active(
            &user(UserKind::Household, Some(45), now),
            &windows,
            now
        ));
        assert!(!user_is_active(
            &user(UserKind::Guest, None, now),
            &windows,
            now
        ));

        let mut disabled = user(UserKind::Owner, None, now);
        disabled.enabled = false;
        assert!(!user_is_active(&disabled, &windows, now));
    }

    #[test]
    fn staleness_is_capped() {
        let now = Utc::now();
        assert_eq!(staleness_score(now, None), 0);
        assert_eq!(staleness_score(now, Some(now - Duration::days(3))), 3);
        assert_eq!(
            staleness_score(now, Some(now - Duration::days(5_000))),
            STALENESS_CAP
        );
    }

    #[tokio::test]
    async fn ondeck_drops_stale_items() -> anyhow::Result<()> {
        let now = Utc::now();
        let mut fresh = media("/library/fresh.mkv", 1);
        fresh.last_watched_at = Some(now - Duration::days(2));
        let mut stale = media("/library/stale.mkv", 1);
        stale.last_watched_at = Some(now - Duration::days(90));

        let server = StaticServer::with_ondeck(vec![fresh, stale]);
        let mut viewer = user(UserKind::Owner, None, now);
        viewer.settings.ondeck.max_stale_days = 30;

        let candidates = ondeck_candidates(&server, &viewer, now).await?;
        assert_eq!(candidates.len(), 1);
        assert_eq!(
            candidates[0].logical_path,
            PathBuf::from("/library/fresh.mkv")
        );
        assert_eq!(candidates[0].base_priority, PRIORITY_ONDECK);
        Ok(())
    }

    #[tokio::test]
    async fn watchlist_drops_old_availability() -> anyhow::Result<()> {
        let now = Utc::now();
        let mut recent = media("/library/recent.mkv", 1);
        recent.available_since = Some(now - Duration::days(5));
        let mut backlog = media("/library/backlog.mkv", 1);
        backlog.available_since = Some(now - Duration::days(400));

        let server = StaticServer::with_watchlist(vec![recent, backlog]);
        let mut viewer = user(UserKind::Owner, None, now);
        viewer.settings.watchlist.max_available_days = 60;

        let candidates = watchlist_candidates(&server, &viewer, now).await?;
        assert_eq!(candidates.len(), 1);
        assert_eq!(
            candidates[0].logical_path,
            PathBuf::from("/library/recent.mkv")
        );
        Ok(())
    }

    #[test]
    fn sessions_from_roster_rank_maximal() {
        let now = Utc::now();
        let viewer = user(UserKind::Owner, None, now);
        let sessions = vec![
            PlaybackSession {
                session_key: "roster".to_string(),
                user_id: Some(viewer.id),
                media: media("/library/a.mkv", 1),
                playing_from_fast: false,
            },
            PlaybackSession {
                session_key: "stranger".to_string(),
                user_id: Some(Uuid::new_v4()),
                media: media("/library/b.mkv", 1),
                playing_from_fast: false,
            },
            PlaybackSession {
                session_key: "cached".to_string(),
                user_id: Some(viewer.id),
                media: media("/library/c.mkv", 1),
                playing_from_fast: true,
            },
        ];

        let candidates = active_candidates(&sessions, std::slice::from_ref(&viewer));
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].base_priority, PRIORITY_ACTIVE);
        assert_eq!(candidates[1].base_priority, PRIORITY_ACTIVE_OTHER);
    }

    #[tokio::test]
    async fn fill_mode_overfetches_past_unmatched_items() -> anyhow::Result<()> {
        let items: Vec<ListItem> = (0..6)
            .map(|i| ListItem {
                title: format!("title-{i}"),
                year: Some(2_020),
                external_ids: std::collections::BTreeMap::new(),
                kind: MediaKind::Movie,
            })
            .collect();
        // Only even-numbered titles resolve to library paths.
        let server = StaticServer::matching(|item: &ListItem| {
            let index: usize = item.title.trim_start_matches("title-").parse().ok()?;
            (index % 2 == 0).then(|| media(&format!("/library/{index}.mkv"), 1))
        });
        let provider = StaticProvider::new(items.clone());

        let definition = ListDefinition {
            name: "feed".to_string(),
            provider: ProviderKind::CustomUrl,
            url: Some("http://feed".to_string()),
            user: None,
            priority_bias: 10,
            refresh_period_s: 3_600,
            mode: ListMode::Fill,
            count_cap: 3,
        };
        let list = ImportList {
            id: Uuid::new_v4(),
            definition: definition.clone(),
            last_refreshed: None,
            stale: false,
        };

        let filled = list_candidates(&server, &provider, &list).await?;
        assert_eq!(filled.len(), 3);
        assert_eq!(
            filled[0].base_priority,
            PRIORITY_LIST_BASE + i64::from(definition.priority_bias)
        );

        let strict_list = ImportList {
            definition: ListDefinition {
                mode: ListMode::Strict,
                ..definition
            },
            ..list
        };
        let strict = list_candidates(&server, &provider, &strict_list).await?;
        // Strict only examines the first three items, of which two match.
        assert_eq!(strict.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn provider_failure_is_contained() {
        let server = StaticServer::with_ondeck(Vec::new());
        let provider = StaticProvider::failing("feed");
        let list = ImportList {
            id: Uuid::new_v4(),
            definition: ListDefinition {
                name: "feed".to_string(),
                provider: ProviderKind::Trending,
                url: None,
                user: None,
                priority_bias: 0,
                refresh_period_s: 3_600,
                mode: ListMode::Strict,
                count_cap: 5,
            },
            last_refreshed: None,
            stale: false,
        };
        let err = list_candidates(&server, &provider, &list)
            .await
            .expect_err("provider failure must surface");
        assert!(matches!(err, ProviderError::Failed { .. }));
    }

    #[tokio::test]
    async fn upstream_errors_propagate_from_phases() {
        let now = Utc::now();
        let server = StaticServer::erroring();
        let viewer = user(UserKind::Owner, None, now);
        let err = ondeck_candidates(&server, &viewer, now)
            .await
            .expect_err("upstream failure must surface");
        assert!(matches!(err, UpstreamError::Unavailable { .. }));
    }

    #[test]
    fn merge_unions_attributions_and_keeps_max_priority() {
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();
        let mut low = Candidate {
            logical_path: PathBuf::from("/library/a.mkv"),
            size_bytes_hint: 1,
            base_priority: PRIORITY_WATCHLIST,
            cause: CauseOperation::Watchlist,
            cause_user: Some(user_a),
            attributions: BTreeSet::from([user_a]),
            user_bias: 0,
            staleness_score: 0,
        };
        let high = Candidate {
            base_priority: PRIORITY_ONDECK,
            cause: CauseOperation::OnDeck,
            cause_user: Some(user_b),
            attributions: BTreeSet::from([user_b]),
            ..low.clone()
        };
        low.staleness_score = 10;

        let merged = merge(vec![low, high]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].base_priority, PRIORITY_ONDECK);
        assert_eq!(merged[0].attributions, BTreeSet::from([user_a, user_b]));
    }
}
