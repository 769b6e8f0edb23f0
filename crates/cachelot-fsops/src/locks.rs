//! Path-keyed exclusive locks serializing relocations per logical path.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::error;

type Registry = Mutex<HashMap<u64, Arc<AsyncMutex<()>>>>;

/// Registry of per-path locks. Paths are keyed by hash; two operations on
/// the same logical path never overlap.
#[derive(Default)]
pub struct PathLocks {
    registry: Arc<Registry>,
}

impl PathLocks {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a path, waiting until it is free.
    pub async fn acquire(&self, path: &Path) -> PathLockGuard {
        let key = hash_path(path);
        let slot = self.slot(key);
        let permit = slot.lock_owned().await;
        PathLockGuard {
            registry: Arc::clone(&self.registry),
            key,
            permit: Some(permit),
        }
    }

    /// Acquire the lock for a path without waiting. Returns `None` when the
    /// lock is held by another operation.
    #[must_use]
    pub fn try_acquire(&self, path: &Path) -> Option<PathLockGuard> {
        let key = hash_path(path);
        let slot = self.slot(key);
        let permit = slot.try_lock_owned().ok()?;
        Some(PathLockGuard {
            registry: Arc::clone(&self.registry),
            key,
            permit: Some(permit),
        })
    }

    fn slot(&self, key: u64) -> Arc<AsyncMutex<()>> {
        let mut registry = lock_registry(&self.registry);
        Arc::clone(registry.entry(key).or_default())
    }
}

/// RAII guard releasing the path lock, sweeping the registry slot when no
/// other operation is waiting on it.
pub struct PathLockGuard {
    registry: Arc<Registry>,
    key: u64,
    permit: Option<OwnedMutexGuard<()>>,
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        drop(self.permit.take());
        let mut registry = lock_registry(&self.registry);
        if let Some(slot) = registry.get(&self.key)
            && Arc::strong_count(slot) == 1
        {
            registry.remove(&self.key);
        }
    }
}

fn hash_path(path: &Path) -> u64 {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    hasher.finish()
}

fn lock_registry(registry: &Registry) -> MutexGuard<'_, HashMap<u64, Arc<AsyncMutex<()>>>> {
    match registry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!("path lock registry mutex poisoned; continuing with recovered guard");
            poisoned.into_inner()
        }
    }
}
