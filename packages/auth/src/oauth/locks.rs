// ABOUTME: Per-token async mutexes used to collapse concurrent refreshes into one
// ABOUTME: Entries are dropped once no task holds or waits on them

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use warden_core::TokenKey;

/// Holds the per-key lock for as long as it lives
pub struct KeyGuard {
    key: TokenKey,
    locks: Arc<DashMap<TokenKey, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map itself still references an idle lock
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// One async mutex per token key
#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<DashMap<TokenKey, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &TokenKey) -> KeyGuard {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        KeyGuard {
            key: key.clone(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    /// Whether some task currently holds or waits for `key`
    pub fn is_contended(&self, key: &TokenKey) -> bool {
        self.locks.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = KeyedLocks::new();
        let key = TokenKey::new("google", "u1");
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let (locks, key) = (locks.clone(), key.clone());
            let (active, max_seen) = (active.clone(), max_seen.clone());
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&key).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(&TokenKey::new("google", "a")).await;
        let acquired = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock(&TokenKey::new("google", "b")),
        )
        .await;
        assert!(acquired.is_ok());
        assert_eq!(locks.len(), 2);
    }
}
