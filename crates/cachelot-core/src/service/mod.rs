//! Seams implemented by adapter crates and the application orchestrator.

use crate::error::{CommandResult, ProviderResult, UpstreamResult};
use crate::model::{
    CacheEntry, CacheStatistics, Candidate, CleanupReport, CycleResult, ExportFormat, ImportList,
    ListItem, MediaRef, Page, PlaybackSession, QueryFilter, SearchScope, User, UserSettingsPatch,
};
use async_trait::async_trait;
use cachelot_config::ListDefinition;
use uuid::Uuid;

/// Read access to the upstream media server, implemented by the rate-limited
/// client and by fakes in tests. Implementations serialize all calls through
/// one queue; callers may invoke the trait from any task.
#[async_trait]
pub trait MediaServer: Send + Sync {
    /// Discover all accounts on the server.
    async fn list_users(&self) -> UpstreamResult<Vec<User>>;

    /// Fetch up to `episodes_ahead` Up Next items for a user, dropping items
    /// whose last-watched staleness exceeds `max_stale_days` (`0` = no bound).
    async fn on_deck(
        &self,
        user: &User,
        episodes_ahead: u32,
        max_stale_days: u32,
    ) -> UpstreamResult<Vec<MediaRef>>;

    /// Fetch watchlist items for a user, `episodes_per_show` per show,
    /// dropping items available longer than `max_available_days` (`0` = no
    /// bound).
    async fn watchlist(
        &self,
        user: &User,
        episodes_per_show: u32,
        max_available_days: u32,
    ) -> UpstreamResult<Vec<MediaRef>>;

    /// Enumerate in-flight playback sessions.
    async fn active_sessions(&self) -> UpstreamResult<Vec<PlaybackSession>>;

    /// Resolve an external list item to a library file, trying external IDs
    /// first and title+year second.
    async fn match_library(&self, item: &ListItem) -> UpstreamResult<Option<MediaRef>>;
}

/// One external list source. Each provider refreshes on its own period and
/// fails independently of the cycle.
#[async_trait]
pub trait ListProvider: Send + Sync {
    /// Fetch the current items of the list, unmatched.
    async fn refresh(&self) -> ProviderResult<Vec<ListItem>>;
}

/// Typed command surface exposed to external transports. Implemented by the
/// application orchestrator handle; every call captures the acting user for
/// audit and emits `log` events.
#[async_trait]
pub trait CacheCommands: Send + Sync {
    /// Request a cycle. Idempotent while one is queued: returns the identifier
    /// of the queued run.
    async fn run_cycle(&self, actor_user_id: Option<Uuid>) -> CommandResult<Uuid>;

    /// Schedule a restore of one tracked entry. Safe to retry.
    async fn remove_file(
        &self,
        entry_id: Uuid,
        reason: String,
        actor_user_id: Option<Uuid>,
    ) -> CommandResult<()>;

    /// Repair orphaned rows and prune expired audit rows.
    async fn cleanup(
        &self,
        remove_orphaned: bool,
        actor_user_id: Option<Uuid>,
    ) -> CommandResult<CleanupReport>;

    /// Aggregate tracker statistics.
    async fn stats(&self) -> CommandResult<CacheStatistics>;

    /// Page through tracker rows.
    async fn query(&self, filter: QueryFilter) -> CommandResult<Page<CacheEntry>>;

    /// Substring search over the requested scope.
    async fn search(
        &self,
        q: String,
        scope: SearchScope,
        limit: u64,
        include_removed: bool,
    ) -> CommandResult<Vec<CacheEntry>>;

    /// Render tracker rows in the requested format.
    async fn export(&self, format: ExportFormat, filter: QueryFilter) -> CommandResult<Vec<u8>>;

    /// Patch a user's settings.
    async fn update_user(&self, user_id: Uuid, patch: UserSettingsPatch) -> CommandResult<User>;

    /// Register a new import list.
    async fn add_list(&self, definition: ListDefinition) -> CommandResult<ImportList>;

    /// Remove an import list.
    async fn remove_list(&self, id: Uuid) -> CommandResult<()>;

    /// Force a provider refresh for one list.
    async fn refresh_list(&self, id: Uuid) -> CommandResult<()>;

    /// Most recent cycle results, newest first.
    async fn recent_cycles(&self) -> CommandResult<Vec<CycleResult>>;
}

/// Read access to cycle internals used by tests and transports that render
/// progress; kept separate from [`CacheCommands`] so read-only consumers do
/// not hold a mutating handle.
#[async_trait]
pub trait CacheInspector: Send + Sync {
    /// Candidates the most recent planning pass produced, merged.
    async fn last_candidates(&self) -> Vec<Candidate>;
}

#[cfg(test)]
pub(crate) mod tests_support {
    //! In-memory fakes exercising the seams from unit tests.

    use super::{ListProvider, MediaServer, async_trait};
    use crate::error::{ProviderError, ProviderResult, UpstreamError, UpstreamResult};
    use crate::model::{ListItem, MediaRef, PlaybackSession, User};

    type MatchFn = Box<dyn Fn(&ListItem) -> Option<MediaRef> + Send + Sync>;

    /// Media server fake returning canned responses.
    pub(crate) struct StaticServer {
        ondeck: Vec<MediaRef>,
        watchlist: Vec<MediaRef>,
        sessions: Vec<PlaybackSession>,
        matcher: Option<MatchFn>,
        erroring: bool,
    }

    impl StaticServer {
        fn empty() -> Self {
            Self {
                ondeck: Vec::new(),
                watchlist: Vec::new(),
                sessions: Vec::new(),
                matcher: None,
                erroring: false,
            }
        }

        pub(crate) fn with_ondeck(items: Vec<MediaRef>) -> Self {
            Self {
                ondeck: items,
                ..Self::empty()
            }
        }

        pub(crate) fn with_watchlist(items: Vec<MediaRef>) -> Self {
            Self {
                watchlist: items,
                ..Self::empty()
            }
        }

        pub(crate) fn matching<F>(matcher: F) -> Self
        where
            F: Fn(&ListItem) -> Option<MediaRef> + Send + Sync + 'static,
        {
            Self {
                matcher: Some(Box::new(matcher)),
                ..Self::empty()
            }
        }

        pub(crate) fn erroring() -> Self {
            Self {
                erroring: true,
                ..Self::empty()
            }
        }

        fn gate(&self, operation: &'static str) -> UpstreamResult<()> {
            if self.erroring {
                return Err(UpstreamError::Unavailable {
                    operation,
                    detail: "fake outage".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl MediaServer for StaticServer {
        async fn list_users(&self) -> UpstreamResult<Vec<User>> {
            self.gate("list_users")?;
            Ok(Vec::new())
        }

        async fn on_deck(
            &self,
            _user: &User,
            _episodes_ahead: u32,
            _max_stale_days: u32,
        ) -> UpstreamResult<Vec<MediaRef>> {
            self.gate("on_deck")?;
            Ok(self.ondeck.clone())
        }

        async fn watchlist(
            &self,
            _user: &User,
            _episodes_per_show: u32,
            _max_available_days: u32,
        ) -> UpstreamResult<Vec<MediaRef>> {
            self.gate("watchlist")?;
            Ok(self.watchlist.clone())
        }

        async fn active_sessions(&self) -> UpstreamResult<Vec<PlaybackSession>> {
            self.gate("active_sessions")?;
            Ok(self.sessions.clone())
        }

        async fn match_library(&self, item: &ListItem) -> UpstreamResult<Option<MediaRef>> {
            self.gate("match_library")?;
            Ok(self.matcher.as_ref().and_then(|matcher| matcher(item)))
        }
    }

    /// List provider fake yielding a fixed item set or a canned failure.
    pub(crate) struct StaticProvider {
        items: Vec<ListItem>,
        failing: Option<String>,
    }

    impl StaticProvider {
        pub(crate) fn new(items: Vec<ListItem>) -> Self {
            Self {
                items,
                failing: None,
            }
        }

        pub(crate) fn failing(name: &str) -> Self {
            Self {
                items: Vec::new(),
                failing: Some(name.to_string()),
            }
        }
    }

    #[async_trait]
    impl ListProvider for StaticProvider {
        async fn refresh(&self) -> ProviderResult<Vec<ListItem>> {
            if let Some(name) = &self.failing {
                return Err(ProviderError::Failed {
                    provider: name.clone(),
                    detail: "fake refresh failure".to_string(),
                });
            }
            Ok(self.items.clone())
        }
    }
}
