// ABOUTME: Bounded in-memory token cache with LRU eviction and per-entry TTL
// ABOUTME: Per-key invalidation stamps keep removed tokens from being re-cached by in-flight reads

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use lru::LruCache;
use tokio::sync::RwLock;
use tracing::debug;

use warden_core::TokenKey;

use crate::oauth::types::OAuthToken;

#[derive(Debug, Clone)]
struct CacheEntry {
    token: OAuthToken,
    evict_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_evicted(&self, now: DateTime<Utc>) -> bool {
        now >= self.evict_at
    }
}

/// Decrypted tokens kept in front of the repository
///
/// Every invalidation advances a generation counter and stamps the key with
/// it. Writers capture the generation before touching the database and only
/// populate the cache if that key was not invalidated in between, so a
/// concurrent removal always wins. Stamps live in a bounded LRU; when one is
/// evicted, fills captured before it are refused for every key.
pub struct TokenCache {
    state: RwLock<CacheState>,
    generation: AtomicU64,
}

struct CacheState {
    entries: LruCache<TokenKey, CacheEntry>,
    invalidated: LruCache<TokenKey, u64>,
    /// Fills captured before this generation are refused
    floor: u64,
}

impl CacheState {
    fn is_stale(&self, key: &TokenKey, generation: u64) -> bool {
        generation < self.floor
            || self
                .invalidated
                .peek(key)
                .is_some_and(|stamp| *stamp > generation)
    }
}

impl TokenCache {
    const DEFAULT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1000) {
        Some(n) => n,
        None => unreachable!(),
    };

    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(Self::DEFAULT_CAPACITY);
        Self {
            state: RwLock::new(CacheState {
                entries: LruCache::new(capacity),
                invalidated: LruCache::new(capacity),
                floor: 0,
            }),
            generation: AtomicU64::new(0),
        }
    }

    /// Current invalidation generation, captured before a database read or write
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub async fn get(&self, key: &TokenKey, now: DateTime<Utc>) -> Option<OAuthToken> {
        let mut state = self.state.write().await;
        match state.entries.get(key) {
            Some(entry) if entry.is_evicted(now) => {
                state.entries.pop(key);
                debug!("Cache entry for {} passed its eviction time", key);
                None
            }
            Some(entry) => Some(entry.token.clone()),
            None => None,
        }
    }

    /// Insert unless the key was invalidated since `generation` was captured
    pub async fn insert_if_current(
        &self,
        token: OAuthToken,
        evict_at: DateTime<Utc>,
        generation: u64,
    ) -> bool {
        let key = token.key();
        let mut state = self.state.write().await;
        if state.is_stale(&key, generation) {
            debug!("Skipping cache fill for {}: invalidated meanwhile", key);
            return false;
        }
        state.entries.put(key, CacheEntry { token, evict_at });
        true
    }

    pub async fn invalidate(&self, key: &TokenKey) {
        let mut state = self.state.write().await;
        state.entries.pop(key);
        let stamp = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some((evicted, evicted_stamp)) = state.invalidated.push(key.clone(), stamp) {
            if evicted != *key {
                state.floor = state.floor.max(evicted_stamp);
            }
        }
    }

    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.entries.clear();
        state.invalidated.clear();
        state.floor = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }
}
