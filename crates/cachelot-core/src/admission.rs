//! Retention and size-limit enforcement.
//!
//! The engine is a pure function from tracker and planner snapshots to an
//! action plan. Restores always precede the admissions they free space for;
//! no plan admits a candidate whose success would leave usage above the
//! limit, except the documented active-class overflow.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use cachelot_config::RetentionWindows;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{CacheEntry, Candidate, CauseOperation, EntryStatus};

/// Why a restore was planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreReason {
    /// The entry's cause vanished and its retention clock elapsed.
    Retention,
    /// The entry was evicted to make room for a higher-priority candidate.
    Eviction,
}

impl RestoreReason {
    /// Stable lowercase label for logs and audit fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Retention => "retention",
            Self::Eviction => "eviction",
        }
    }
}

/// One restore scheduled by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRestore {
    /// Tracker row to restore.
    pub entry_id: Uuid,
    /// Logical path of the entry.
    pub logical_path: PathBuf,
    /// Bytes freed by the restore.
    pub size_bytes: u64,
    /// Why the restore was planned.
    pub reason: RestoreReason,
}

/// Why a candidate was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The candidate alone exceeds the fast-tier limit.
    ExceedsLimit,
    /// No evictable tail of strictly lower priority covers the deficit.
    NoEvictableTail,
}

/// A candidate the engine declined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedCandidate {
    /// Logical path of the rejected candidate.
    pub logical_path: PathBuf,
    /// Why it was rejected.
    pub reason: RejectReason,
}

/// Inputs to one planning pass.
#[derive(Debug)]
pub struct AdmissionInput<'a> {
    /// Merged candidates from all phases, any order.
    pub candidates: &'a [Candidate],
    /// Current tracker rows in `staging` or `active`.
    pub entries: &'a [CacheEntry],
    /// Fast-tier size limit in bytes.
    pub limit_bytes: u64,
    /// Per-source retention windows.
    pub retention: &'a RetentionWindows,
    /// Logical paths with an in-flight playback session.
    pub session_paths: &'a HashSet<PathBuf>,
    /// Clock reference for retention arithmetic.
    pub now: DateTime<Utc>,
}

/// Output of one planning pass.
#[derive(Debug, Default)]
pub struct ActionPlan {
    /// Restores to run, retention first, then evictions in schedule order.
    pub restores: Vec<PlannedRestore>,
    /// Candidates to cache, in descending adjusted priority.
    pub admissions: Vec<Candidate>,
    /// Candidates declined this cycle.
    pub rejected: Vec<RejectedCandidate>,
    /// Fast-tier usage after the plan executes.
    pub projected_used_bytes: u64,
    /// Whether an active-class admission pushed usage past the limit.
    pub overflow: bool,
}

impl ActionPlan {
    /// Whether the plan performs no work.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.restores.is_empty() && self.admissions.is_empty()
    }
}

fn retention_days(retention: &RetentionWindows, cause: &CauseOperation) -> u32 {
    match cause {
        CauseOperation::Active => retention.active_days,
        CauseOperation::OnDeck => retention.ondeck_days,
        CauseOperation::Watchlist => retention.watchlist_days,
        CauseOperation::List(_) => retention.list_days,
        CauseOperation::Manual | CauseOperation::Restore => retention.manual_days,
    }
}

/// Compute the action plan for one cycle.
#[must_use]
pub fn build_plan(input: &AdmissionInput<'_>) -> ActionPlan {
    let mut plan = ActionPlan::default();

    let candidate_paths: HashMap<&Path, &Candidate> = input
        .candidates
        .iter()
        .map(|candidate| (candidate.logical_path.as_path(), candidate))
        .collect();

    let mut used: u64 = input.entries.iter().map(|entry| entry.size_bytes).sum();

    // Retention pass: drop entries whose cause vanished and whose clock ran
    // out. Session-active paths are untouchable regardless of cause.
    let mut kept: Vec<&CacheEntry> = Vec::with_capacity(input.entries.len());
    for entry in input.entries {
        if entry.status != EntryStatus::Active {
            kept.push(entry);
            continue;
        }
        if input.session_paths.contains(&entry.logical_path)
            || candidate_paths.contains_key(entry.logical_path.as_path())
        {
            kept.push(entry);
            continue;
        }
        let days = retention_days(input.retention, &entry.cause);
        if days > 0 && (input.now - entry.last_accessed_at).num_days() >= i64::from(days) {
            used = used.saturating_sub(entry.size_bytes);
            plan.restores.push(PlannedRestore {
                entry_id: entry.id,
                logical_path: entry.logical_path.clone(),
                size_bytes: entry.size_bytes,
                reason: RestoreReason::Retention,
            });
        } else {
            kept.push(entry);
        }
    }

    // Admission pass, highest adjusted priority first.
    let mut ordered: Vec<&Candidate> = input.candidates.iter().collect();
    ordered.sort_by(|a, b| {
        b.adjusted_priority()
            .cmp(&a.adjusted_priority())
            .then_with(|| a.logical_path.cmp(&b.logical_path))
    });

    let mut cached_paths: HashSet<&Path> = kept
        .iter()
        .map(|entry| entry.logical_path.as_path())
        .collect();

    for candidate in ordered {
        if cached_paths.contains(candidate.logical_path.as_path()) {
            continue;
        }
        let size = candidate.size_bytes_hint;
        if size > input.limit_bytes {
            plan.rejected.push(RejectedCandidate {
                logical_path: candidate.logical_path.clone(),
                reason: RejectReason::ExceedsLimit,
            });
            continue;
        }
        if used + size <= input.limit_bytes {
            used += size;
            cached_paths.insert(candidate.logical_path.as_path());
            plan.admissions.push(candidate.clone());
            continue;
        }

        let needed = used + size - input.limit_bytes;
        let tail = evictable_tail(&kept, &plan, input, candidate, needed);
        match tail {
            Some(victims) => {
                for victim in victims {
                    used = used.saturating_sub(victim.size_bytes);
                    cached_paths.remove(victim.logical_path.as_path());
                    plan.restores.push(PlannedRestore {
                        entry_id: victim.id,
                        logical_path: victim.logical_path.clone(),
                        size_bytes: victim.size_bytes,
                        reason: RestoreReason::Eviction,
                    });
                }
                used += size;
                cached_paths.insert(candidate.logical_path.as_path());
                plan.admissions.push(candidate.clone());
            }
            None if candidate.is_active_class() => {
                // Soft ceiling: an in-flight playback always wins. Evict
                // whatever non-active tail exists and admit regardless.
                let victims =
                    forced_tail(&kept, &plan, input, candidate.logical_path.as_path(), needed);
                for victim in victims {
                    used = used.saturating_sub(victim.size_bytes);
                    cached_paths.remove(victim.logical_path.as_path());
                    plan.restores.push(PlannedRestore {
                        entry_id: victim.id,
                        logical_path: victim.logical_path.clone(),
                        size_bytes: victim.size_bytes,
                        reason: RestoreReason::Eviction,
                    });
                }
                used += size;
                if used > input.limit_bytes {
                    plan.overflow = true;
                }
                cached_paths.insert(candidate.logical_path.as_path());
                plan.admissions.push(candidate.clone());
            }
            None => {
                plan.rejected.push(RejectedCandidate {
                    logical_path: candidate.logical_path.clone(),
                    reason: RejectReason::NoEvictableTail,
                });
            }
        }
    }

    plan.projected_used_bytes = used;
    plan
}

fn is_evictable(
    entry: &CacheEntry,
    plan: &ActionPlan,
    input: &AdmissionInput<'_>,
    admitted: &HashMap<&Path, &Candidate>,
) -> bool {
    entry.status == EntryStatus::Active
        && !input.session_paths.contains(&entry.logical_path)
        && !admitted.contains_key(entry.logical_path.as_path())
        && !plan
            .restores
            .iter()
            .any(|restore| restore.entry_id == entry.id)
}

fn ascending_priority<'a>(
    kept: &[&'a CacheEntry],
    plan: &ActionPlan,
    input: &AdmissionInput<'_>,
    admitted: &HashMap<&Path, &Candidate>,
) -> Vec<&'a CacheEntry> {
    let mut evictable: Vec<&CacheEntry> = kept
        .iter()
        .copied()
        .filter(|entry| is_evictable(entry, plan, input, admitted))
        .collect();
    // Lowest priority goes first; ties evict the colder, older entry.
    evictable.sort_by(|a, b| {
        a.priority()
            .cmp(&b.priority())
            .then_with(|| a.access_count.cmp(&b.access_count))
            .then_with(|| a.cached_at.cmp(&b.cached_at))
    });
    evictable
}

fn admitted_paths<'a>(plan: &'a ActionPlan) -> HashMap<&'a Path, &'a Candidate> {
    plan.admissions
        .iter()
        .map(|candidate| (candidate.logical_path.as_path(), candidate))
        .collect()
}

fn evictable_tail<'a>(
    kept: &[&'a CacheEntry],
    plan: &ActionPlan,
    input: &AdmissionInput<'_>,
    candidate: &Candidate,
    needed: u64,
) -> Option<Vec<&'a CacheEntry>> {
    let admitted = admitted_paths(plan);
    let mut victims = Vec::new();
    let mut freed: u64 = 0;
    for entry in ascending_priority(kept, plan, input, &admitted) {
        if entry.priority() >= candidate.adjusted_priority() {
            break;
        }
        freed += entry.size_bytes;
        victims.push(entry);
        if freed >= needed {
            return Some(victims);
        }
    }
    None
}

fn forced_tail<'a>(
    kept: &[&'a CacheEntry],
    plan: &ActionPlan,
    input: &AdmissionInput<'_>,
    candidate_path: &Path,
    needed: u64,
) -> Vec<&'a CacheEntry> {
    let admitted = admitted_paths(plan);
    let mut victims = Vec::new();
    let mut freed: u64 = 0;
    for entry in ascending_priority(kept, plan, input, &admitted) {
        if matches!(entry.cause, CauseOperation::Active) || entry.logical_path == candidate_path {
            continue;
        }
        freed += entry.size_bytes;
        victims.push(entry);
        if freed >= needed {
            break;
        }
    }
    victims
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RelocationMethod, UserSourceSettings};
    use chrono::Duration;
    use std::collections::BTreeSet;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn entry(path: &str, size: u64, cause: CauseOperation, access: u64) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            id: Uuid::new_v4(),
            logical_path: PathBuf::from(path),
            original_location_path: PathBuf::from(path),
            fast_tier_path: PathBuf::from(format!("/mnt/cache{path}")),
            size_bytes: size,
            cached_at: now,
            last_accessed_at: now,
            access_count: access,
            cause,
            cause_user_id: None,
            attributions: BTreeSet::new(),
            status: EntryStatus::Active,
            method: RelocationMethod::AtomicCopy,
            checksum: None,
            metadata: serde_json::Value::Null,
        }
    }

    fn candidate(path: &str, size: u64, base: i64, cause: CauseOperation) -> Candidate {
        Candidate {
            logical_path: PathBuf::from(path),
            size_bytes_hint: size,
            base_priority: base,
            cause,
            cause_user: None,
            attributions: BTreeSet::new(),
            user_bias: 0,
            staleness_score: 0,
        }
    }

    fn input<'a>(
        candidates: &'a [Candidate],
        entries: &'a [CacheEntry],
        limit: u64,
        retention: &'a RetentionWindows,
        sessions: &'a HashSet<PathBuf>,
    ) -> AdmissionInput<'a> {
        AdmissionInput {
            candidates,
            entries,
            limit_bytes: limit,
            retention,
            session_paths: sessions,
            now: Utc::now(),
        }
    }

    #[test]
    fn cold_start_admits_until_the_limit() {
        // Limit 10 GiB, OnDeck A(2), B(3), C(6): A and B fit, C is rejected
        // because no lower-priority tail exists.
        let candidates = vec![
            candidate("/library/a.mkv", 2 * GIB, 800, CauseOperation::OnDeck),
            candidate("/library/b.mkv", 3 * GIB, 800, CauseOperation::OnDeck),
            candidate("/library/c.mkv", 6 * GIB, 800, CauseOperation::OnDeck),
        ];
        let retention = RetentionWindows::default();
        let sessions = HashSet::new();
        let plan = build_plan(&input(&candidates, &[], 10 * GIB, &retention, &sessions));

        assert_eq!(plan.admissions.len(), 2);
        assert_eq!(plan.rejected.len(), 1);
        assert_eq!(plan.rejected[0].reason, RejectReason::NoEvictableTail);
        assert_eq!(plan.projected_used_bytes, 5 * GIB);
        assert!(!plan.overflow);
    }

    #[test]
    fn eviction_under_pressure_prefers_cold_old_entries() {
        // X and Y at priority 500 fill 8 of 10 GiB; Z at 800 needs 4 GiB.
        // One of X/Y is restored, tie-broken by access count ascending.
        let mut x = entry("/library/x.mkv", 4 * GIB, CauseOperation::Watchlist, 5);
        let y = entry("/library/y.mkv", 4 * GIB, CauseOperation::Watchlist, 9);
        x.cached_at -= Duration::days(2);
        let entries = vec![x.clone(), y];
        let candidates = vec![candidate(
            "/library/z.mkv",
            4 * GIB,
            800,
            CauseOperation::OnDeck,
        )];
        let retention = RetentionWindows {
            watchlist_days: 0,
            ..RetentionWindows::default()
        };
        let sessions = HashSet::new();
        let plan = build_plan(&input(&candidates, &entries, 10 * GIB, &retention, &sessions));

        assert_eq!(plan.restores.len(), 1);
        assert_eq!(plan.restores[0].entry_id, x.id, "colder entry evicts first");
        assert_eq!(plan.restores[0].reason, RestoreReason::Eviction);
        assert_eq!(plan.admissions.len(), 1);
        assert_eq!(plan.projected_used_bytes, 8 * GIB);
    }

    #[test]
    fn oversized_candidate_rejected_regardless_of_priority() {
        let candidates = vec![candidate(
            "/library/huge.mkv",
            20 * GIB,
            1_000,
            CauseOperation::Active,
        )];
        let retention = RetentionWindows::default();
        let sessions = HashSet::new();
        let plan = build_plan(&input(&candidates, &[], 10 * GIB, &retention, &sessions));

        assert!(plan.admissions.is_empty());
        assert_eq!(plan.rejected[0].reason, RejectReason::ExceedsLimit);
    }

    #[test]
    fn active_candidate_overflows_softly() {
        // The tier is full of session-active entries; an active candidate has
        // no evictable tail but is admitted anyway, flagged as overflow.
        let pinned = entry("/library/pinned.mkv", 9 * GIB, CauseOperation::Active, 1);
        let sessions: HashSet<PathBuf> = [pinned.logical_path.clone()].into_iter().collect();
        let entries = vec![pinned];
        let candidates = vec![candidate(
            "/library/now-playing.mkv",
            4 * GIB,
            1_000,
            CauseOperation::Active,
        )];
        let retention = RetentionWindows::default();
        let plan = build_plan(&input(&candidates, &entries, 10 * GIB, &retention, &sessions));

        assert_eq!(plan.admissions.len(), 1);
        assert!(plan.overflow);
        assert_eq!(plan.projected_used_bytes, 13 * GIB);
        assert!(plan.restores.is_empty(), "session-active entries are pinned");
    }

    #[test]
    fn retention_clock_restores_unreferenced_entries() {
        let mut old = entry("/library/old.mkv", GIB, CauseOperation::OnDeck, 1);
        old.last_accessed_at = Utc::now() - Duration::days(10);
        let fresh = entry("/library/fresh.mkv", GIB, CauseOperation::OnDeck, 1);
        let entries = vec![old.clone(), fresh];

        let retention = RetentionWindows {
            ondeck_days: 7,
            ..RetentionWindows::default()
        };
        let sessions = HashSet::new();
        let plan = build_plan(&input(&[], &entries, 10 * GIB, &retention, &sessions));

        assert_eq!(plan.restores.len(), 1);
        assert_eq!(plan.restores[0].entry_id, old.id);
        assert_eq!(plan.restores[0].reason, RestoreReason::Retention);
        assert_eq!(plan.projected_used_bytes, GIB);
    }

    #[test]
    fn candidate_presence_resets_the_retention_outcome() {
        let mut wanted = entry("/library/wanted.mkv", GIB, CauseOperation::OnDeck, 1);
        wanted.last_accessed_at = Utc::now() - Duration::days(10);
        let entries = vec![wanted];
        let candidates = vec![candidate(
            "/library/wanted.mkv",
            GIB,
            800,
            CauseOperation::OnDeck,
        )];
        let retention = RetentionWindows {
            ondeck_days: 7,
            ..RetentionWindows::default()
        };
        let sessions = HashSet::new();
        let plan = build_plan(&input(&candidates, &entries, 10 * GIB, &retention, &sessions));

        assert!(plan.restores.is_empty());
        assert!(plan.admissions.is_empty(), "already cached");
        assert!(plan.is_empty());
    }

    #[test]
    fn equal_priority_tail_cannot_be_evicted() {
        let held = entry("/library/held.mkv", 8 * GIB, CauseOperation::OnDeck, 1);
        let entries = vec![held];
        let candidates = vec![candidate(
            "/library/new.mkv",
            4 * GIB,
            800,
            CauseOperation::OnDeck,
        )];
        let retention = RetentionWindows {
            ondeck_days: 0,
            ..RetentionWindows::default()
        };
        let sessions = HashSet::new();
        let plan = build_plan(&input(&candidates, &entries, 10 * GIB, &retention, &sessions));

        assert!(plan.admissions.is_empty());
        assert_eq!(plan.rejected[0].reason, RejectReason::NoEvictableTail);
    }

    #[test]
    fn user_settings_defaults_are_conservative() {
        let defaults = UserSourceSettings::default();
        assert!(defaults.ondeck.enabled);
        assert!(defaults.watchlist.enabled);
        assert!(!defaults.active_enabled);
        assert!(!defaults.lists_enabled);
    }
}
