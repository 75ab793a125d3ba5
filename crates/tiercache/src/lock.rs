//! Per-key computation locks.
//!
//! One async mutex per fully qualified key, created on demand and removed
//! again once nobody holds or waits for it, so the table never grows with
//! the key space.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tiercache_core::CacheError;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable = Arc<DashMap<String, Arc<Mutex<()>>>>;

/// Keyed mutex table. Clones share the same table.
#[derive(Clone, Default)]
pub struct LockManager {
    locks: LockTable,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for the lock on `key`. `timeout = None` waits indefinitely.
    pub async fn acquire(
        &self,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<LockHandle, CacheError> {
        let mutex = self.slot(key);

        let guard = match timeout {
            None => mutex.lock_owned().await,
            Some(timeout) => match tokio::time::timeout(timeout, mutex.lock_owned()).await {
                Ok(guard) => guard,
                Err(_) => {
                    release_slot(&self.locks, key);
                    return Err(CacheError::lock_timeout(key, timeout));
                }
            },
        };

        Ok(LockHandle::new(key, guard, self.locks.clone()))
    }

    /// Takes the lock only if it is free right now.
    pub fn try_acquire(&self, key: &str) -> Option<LockHandle> {
        match self.slot(key).try_lock_owned() {
            Ok(guard) => Some(LockHandle::new(key, guard, self.locks.clone())),
            Err(_) => {
                release_slot(&self.locks, key);
                None
            }
        }
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .is_some_and(|mutex| mutex.try_lock().is_err())
    }

    /// Number of keys with a holder or waiters.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn slot(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks.entry(key.to_string()).or_default().clone()
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("active", &self.locks.len())
            .finish()
    }
}

/// Drops the table slot when the only remaining reference is the table's.
fn release_slot(locks: &LockTable, key: &str) {
    locks.remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
}

/// Held lock; released on drop.
pub struct LockHandle {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockTable,
}

impl LockHandle {
    fn new(key: &str, guard: OwnedMutexGuard<()>, locks: LockTable) -> Self {
        Self {
            key: key.to_string(),
            guard: Some(guard),
            locks,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Explicit release, equivalent to dropping the handle.
    pub fn release(self) {}
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        // The guard holds a reference to the mutex; drop it before checking.
        drop(self.guard.take());
        release_slot(&self.locks, &self.key);
    }
}
