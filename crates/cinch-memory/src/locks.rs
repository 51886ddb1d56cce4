//! Per-session write serialization.
//!
//! A compaction rewrites a session's history and resets its ledger entry in
//! several steps. [`SessionLocks`] hands out one async guard per session key
//! so that at most one writer (a compaction or a full turn) touches a
//! session at a time. Different keys never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Registry of per-session async mutexes.
///
/// Entries are created on demand and pruned once no guard or waiter holds
/// them any more.
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Exclusive access to one session. Released on drop.
#[derive(Debug)]
pub struct SessionGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl SessionGuard {
    /// Key of the session this guard protects.
    pub fn session_key(&self) -> &str {
        &self.key
    }
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map itself references idle entries.
        locks.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Wait until the session is free and take it.
    pub async fn acquire(&self, key: &str) -> SessionGuard {
        let guard = self.slot(key).lock_owned().await;
        SessionGuard {
            key: key.to_string(),
            _guard: guard,
        }
    }

    /// Take the session if nobody else holds it.
    pub fn try_acquire(&self, key: &str) -> Option<SessionGuard> {
        let guard = self.slot(key).try_lock_owned().ok()?;
        Some(SessionGuard {
            key: key.to_string(),
            _guard: guard,
        })
    }

    /// Whether `guard` was issued by this registry and still holds its slot.
    pub fn holds(&self, guard: &SessionGuard) -> bool {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .get(&guard.key)
            .is_some_and(|lock| Arc::ptr_eq(lock, OwnedMutexGuard::mutex(&guard._guard)))
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = SessionLocks::new();
        let guard = locks.acquire("s1").await;
        assert_eq!(guard.session_key(), "s1");
        assert!(locks.try_acquire("s1").is_none());
        drop(guard);
        assert!(locks.try_acquire("s1").is_some());
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks = SessionLocks::new();
        let _a = locks.acquire("a").await;
        let b = locks.try_acquire("b");
        assert!(b.is_some());
    }

    #[tokio::test]
    async fn waiter_proceeds_after_release() {
        let locks = Arc::new(SessionLocks::new());
        let guard = locks.acquire("s1").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let g = locks.acquire("s1").await;
                g.session_key().to_string()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);

        let key = waiter.await.unwrap();
        assert_eq!(key, "s1");
    }

    #[tokio::test]
    async fn holds_only_guards_it_issued() {
        let locks = SessionLocks::new();
        let other = SessionLocks::new();
        let guard = locks.acquire("s1").await;
        let foreign = other.acquire("s1").await;

        assert!(locks.holds(&guard));
        assert!(!locks.holds(&foreign));
        assert!(!other.holds(&guard));
    }

    #[tokio::test]
    async fn idle_entries_are_pruned() {
        let locks = SessionLocks::new();
        drop(locks.acquire("a").await);
        drop(locks.acquire("b").await);
        drop(locks.acquire("c").await);
        // Each acquire prunes every idle entry but its own.
        assert_eq!(locks.len(), 1);
    }
}
