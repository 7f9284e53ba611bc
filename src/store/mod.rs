//! Pluggable storage for cache entries and locks.
//!
//! Two implementations satisfy the same contract: [`memory::MemoryBackend`]
//! for a single process and [`redis::RedisBackend`] for coordination across
//! processes. The coordinator only ever talks to the trait.

pub mod memory;
pub mod redis;

use async_trait::async_trait;

use crate::errors::BackendError;

/// Suffix appended to a fingerprint to form its lock key.
pub const LOCK_SUFFIX: &str = ":lock";

/// Value stored under a held lock key in the shared backend.
pub(crate) const LOCK_MARKER: &str = "1";

/// Key-value store with TTL plus a mutual-exclusion lock primitive.
///
/// Failure semantics are part of the contract, not an implementation detail:
/// reads and releases never fail (transport errors degrade to miss / no-op,
/// fail-open toward re-execution rather than toward false cache hits), lock
/// acquisition reports transport errors as "not granted", and only cache
/// writes propagate failure so the coordinator can log the lost write.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetch a cached value. Expired or unreachable entries read as `None`.
    async fn get(&self, key: &str) -> Option<String>;

    /// Store a value for `ttl_secs` seconds.
    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), BackendError>;

    /// Atomically acquire the lock at `key` for `ttl_ms` milliseconds.
    /// Returns `false` on contention; never grants two holders at once.
    async fn acquire_lock(&self, key: &str, ttl_ms: u64) -> bool;

    /// Best-effort release. Releasing an absent lock is a no-op.
    async fn release_lock(&self, key: &str);
}
