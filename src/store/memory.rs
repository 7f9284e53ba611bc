//! Process-local backend: two `DashMap`s with lazy expiry on read and a
//! single periodic sweeper to bound memory growth.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::errors::BackendError;
use crate::store::Backend;

struct StoredEntry {
    value: String,
    expires_at: Instant,
}

/// In-memory [`Backend`]. Cloning shares the underlying maps, so one
/// instance can serve any number of in-process callers.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<DashMap<String, StoredEntry>>,
    locks: Arc<DashMap<String, Instant>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value with sub-second TTL resolution. The trait's `set`
    /// delegates here; tests use it directly.
    pub fn insert(&self, key: &str, value: &str, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Remove all expired entries and locks. Returns how many were dropped.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len() + self.locks.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.locks.retain(|_, expires_at| *expires_at > now);
        before - (self.entries.len() + self.locks.len())
    }

    /// Spawn one background sweep at `interval`: a single reaper for the
    /// whole store, never one timer per entry. The task holds only weak
    /// references and exits once the backend is dropped.
    pub fn spawn_sweeper(&self, interval: Duration) {
        let entries = Arc::downgrade(&self.entries);
        let locks = Arc::downgrade(&self.locks);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let (Some(entries), Some(locks)) = (entries.upgrade(), locks.upgrade()) else {
                    break;
                };
                let dropped = sweep(&entries, &locks);
                if dropped > 0 {
                    tracing::debug!(dropped, "swept expired idempotency records");
                }
            }
        });
    }

    /// Current number of live cache entries (for tests and debugging).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn sweep(entries: &DashMap<String, StoredEntry>, locks: &DashMap<String, Instant>) -> usize {
    let now = Instant::now();
    let before = entries.len() + locks.len();
    entries.retain(|_, entry| entry.expires_at > now);
    locks.retain(|_, expires_at| *expires_at > now);
    before - (entries.len() + locks.len())
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if now < entry.expires_at {
                return Some(entry.value.clone());
            }
            // expired — drop the ref before removing; the removal re-checks
            // expiry under the shard lock so a fresh value written in
            // between is not clobbered
            drop(entry);
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        None
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), BackendError> {
        self.insert(key, value, Duration::from_secs(ttl_secs));
        Ok(())
    }

    async fn acquire_lock(&self, key: &str, ttl_ms: u64) -> bool {
        let now = Instant::now();
        // The entry API holds the shard lock across check-and-set, which is
        // what makes acquisition atomic under concurrent callers.
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if *held.get() > now {
                    false
                } else {
                    held.insert(now + Duration::from_millis(ttl_ms));
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now + Duration::from_millis(ttl_ms));
                true
            }
        }
    }

    async fn release_lock(&self, key: &str) {
        self.locks.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_returns_value_before_expiry_and_none_after() {
        let store = MemoryBackend::new();
        store.insert("k", "v", Duration::from_millis(100));
        assert_eq!(store.get("k").await.as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.get("k").await, None);
        // lazy expiry also removed the record
        assert!(store.is_empty());
    }

    /// A reader that finds an expired entry must not clobber a fresh value
    /// written between its expiry check and its removal.
    #[tokio::test(flavor = "multi_thread")]
    async fn expired_removal_never_loses_a_concurrent_fresh_write() {
        let store = MemoryBackend::new();
        for _ in 0..200 {
            store.insert("k", "stale", Duration::ZERO);
            let reader = {
                let store = store.clone();
                tokio::spawn(async move { store.get("k").await })
            };
            store.insert("k", "fresh", Duration::from_secs(60));
            reader.await.unwrap();
            assert_eq!(store.get("k").await.as_deref(), Some("fresh"));
        }
    }

    #[tokio::test]
    async fn set_via_trait_honours_ttl_in_seconds() {
        let store = MemoryBackend::new();
        store.set("k", "v", 60).await.unwrap();
        assert_eq!(store.get("k").await.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn lock_grants_exactly_one_holder_under_contention() {
        let store = MemoryBackend::new();
        let mut attempts = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            attempts.push(tokio::spawn(
                async move { store.acquire_lock("fp:lock", 60_000).await },
            ));
        }
        let mut granted = 0;
        for handle in attempts {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired() {
        let store = MemoryBackend::new();
        assert!(store.acquire_lock("fp:lock", 50).await);
        assert!(!store.acquire_lock("fp:lock", 50).await);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.acquire_lock("fp:lock", 50).await);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_never_fails() {
        let store = MemoryBackend::new();
        assert!(store.acquire_lock("fp:lock", 60_000).await);
        store.release_lock("fp:lock").await;
        store.release_lock("fp:lock").await; // absent, still a no-op
        assert!(store.acquire_lock("fp:lock", 60_000).await);
    }

    #[tokio::test]
    async fn evict_expired_drops_only_stale_records() {
        let store = MemoryBackend::new();
        store.insert("stale", "v", Duration::from_millis(10));
        store.insert("fresh", "v", Duration::from_secs(60));
        store.acquire_lock("stale:lock", 10).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.evict_expired(), 2);
        assert_eq!(store.get("fresh").await.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn sweeper_purges_in_background() {
        let store = MemoryBackend::new();
        store.insert("k", "v", Duration::from_millis(10));
        store.spawn_sweeper(Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.is_empty());
    }
}
