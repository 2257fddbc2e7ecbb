//! # Named Locks
//!
//! Process-local mutual exclusion keyed by string. Work item ids, ticket ids,
//! identity prefixes (`generate-id-<prefix>`) and resolution keys all share one
//! key space. Blocking acquisition waits for the current holder; non-blocking
//! acquisition fails fast with [`RelvalError::Locked`].
//!
//! Entries are removed from the registry once nobody holds or waits for them, so
//! the registry only ever contains keys that are currently in use.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{RelvalError, Result};

#[derive(Debug, Default)]
pub struct Locker {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Scoped lock handle, released on drop
#[derive(Debug)]
pub struct LockGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Snapshot of one registered lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub key: String,
    pub locked: bool,
    /// Tasks waiting for a blocking acquisition
    pub waiting: usize,
}

impl Locker {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait until `key` is free and take it
    pub async fn lock(&self, key: &str) -> LockGuard {
        // Declared before the mutex handle so a cancelled wait drops the handle first
        let _pending = PendingLock {
            key,
            locks: &self.locks,
        };
        let mutex = self.mutex_for(key);
        debug!(key = %key, "🔒 LOCK: Waiting for lock");
        let guard = mutex.lock_owned().await;
        debug!(key = %key, "🔒 LOCK: Acquired");
        LockGuard {
            key: key.to_string(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Take `key` if it is free, otherwise fail with [`RelvalError::Locked`]
    pub fn try_lock(&self, key: &str) -> Result<LockGuard> {
        let _pending = PendingLock {
            key,
            locks: &self.locks,
        };
        let mutex = self.mutex_for(key);
        match mutex.try_lock_owned() {
            Ok(guard) => {
                debug!(key = %key, "🔒 LOCK: Acquired without waiting");
                Ok(LockGuard {
                    key: key.to_string(),
                    guard: Some(guard),
                    locks: Arc::clone(&self.locks),
                })
            }
            Err(_) => {
                debug!(key = %key, "🔒 LOCK: Busy");
                Err(RelvalError::Locked {
                    key: key.to_string(),
                })
            }
        }
    }

    /// Whether `key` is currently held
    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .map(|mutex| mutex.try_lock().is_err())
            .unwrap_or(false)
    }

    /// All registered locks, sorted by key
    pub fn status(&self) -> Vec<LockStatus> {
        let mut statuses: Vec<LockStatus> = self
            .locks
            .iter()
            .map(|entry| {
                let locked = entry.value().try_lock().is_err();
                // One reference is the registry's own, one the holder's guard
                let references = Arc::strong_count(entry.value());
                let waiting = if locked {
                    references.saturating_sub(2)
                } else {
                    references.saturating_sub(1)
                };
                LockStatus {
                    key: entry.key().clone(),
                    locked,
                    waiting,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.key.cmp(&b.key));
        statuses
    }
}

fn release_if_unused(locks: &DashMap<String, Arc<Mutex<()>>>, key: &str) {
    locks.remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
}

/// Registry cleanup for an acquisition that ends without a guard, whether it
/// failed, was cancelled or lost a race with the holder's release
struct PendingLock<'a> {
    key: &'a str,
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
}

impl Drop for PendingLock<'_> {
    fn drop(&mut self) {
        release_if_unused(self.locks, self.key);
    }
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        release_if_unused(&self.locks, &self.key);
        debug!(key = %self.key, "🔓 LOCK: Released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_try_lock_fails_while_held() {
        let locker = Locker::new();
        let guard = locker.try_lock("ID-00001").unwrap();
        let err = locker.try_lock("ID-00001").unwrap_err();
        assert!(err.is_retryable());
        assert!(locker.is_locked("ID-00001"));

        drop(guard);
        assert!(!locker.is_locked("ID-00001"));
        assert!(locker.try_lock("ID-00001").is_ok());
    }

    #[tokio::test]
    async fn test_blocking_lock_waits_for_holder() {
        let locker = Arc::new(Locker::new());
        let guard = locker.lock("generate-id-X").await;

        let waiter = {
            let locker = Arc::clone(&locker);
            tokio::spawn(async move {
                let _guard = locker.lock("generate-id-X").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        let status = locker.status();
        assert_eq!(status.len(), 1);
        assert!(status[0].locked);
        assert_eq!(status[0].waiting, 1);

        drop(guard);
        waiter.await.unwrap();
        assert!(locker.status().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_wait_leaves_no_registry_entry() {
        let locker = Locker::new();
        let holder = locker.lock("ID-00002").await;

        let mut waiting = Box::pin(locker.lock("ID-00002"));
        assert!(tokio::time::timeout(Duration::from_millis(10), &mut waiting)
            .await
            .is_err());
        assert_eq!(locker.status()[0].waiting, 1);

        // The holder leaves while the waiter is still registered
        drop(holder);
        assert_eq!(locker.status().len(), 1);
        drop(waiting);
        assert!(locker.status().is_empty());
        assert!(locker.try_lock("ID-00002").is_ok());
    }

    #[tokio::test]
    async fn test_independent_keys_do_not_contend() {
        let locker = Locker::new();
        let _a = locker.try_lock("A").unwrap();
        let _b = locker.try_lock("B").unwrap();
        assert_eq!(locker.status().len(), 2);
    }
}
