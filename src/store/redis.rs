//! Shared backend on Redis, for coordination across processes.
//!
//! Degradation policy: `GET` and `DEL` failures are logged and absorbed (a
//! lost read is a cache miss, a lost release is waited out by the lock TTL),
//! a failed `SET NX` reads as "lock not granted", and only cache writes
//! propagate their error to the coordinator.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::errors::BackendError;
use crate::store::{Backend, LOCK_MARKER};

/// Redis-backed [`Backend`]. The `ConnectionManager` multiplexes and
/// reconnects internally; cloning it per call is the intended usage.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, error = %e, "redis read failed, treating as cache miss");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn acquire_lock(&self, key: &str, ttl_ms: u64) -> bool {
        let mut conn = self.conn.clone();
        // SET NX PX is Redis's native atomic set-if-absent-with-expiry.
        // Replies "OK" when the key was set, nil when a holder exists.
        let reply: Result<Option<String>, _> = redis::cmd("SET")
            .arg(key)
            .arg(LOCK_MARKER)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await;
        match reply {
            Ok(set) => set.is_some(),
            Err(e) => {
                tracing::warn!(key, error = %e, "redis lock acquisition failed, treating as contended");
                false
            }
        }
    }

    async fn release_lock(&self, key: &str) {
        let mut conn = self.conn.clone();
        if let Err(e) = conn.del::<_, ()>(key).await {
            // Never surfaced; the TTL will reap the lock.
            tracing::warn!(key, error = %e, "redis lock release failed");
        }
    }
}
