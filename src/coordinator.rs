//! The execute protocol: check cache, acquire lock, run work once, populate
//! cache, release lock.
//!
//! For N concurrent callers with the same fingerprint, at most one runs the
//! work while holding the lock; the rest are served from cache during the
//! poll loop. Only after the retry budget is exhausted does a caller execute
//! unprotected (under the default fail-open policy), a bounded and logged
//! relaxation rather than indefinite blocking.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::{Config, ContentionPolicy};
use crate::errors::IdempotencyError;
use crate::fingerprint::{fingerprint, RequestDescriptor};
use crate::store::{Backend, LOCK_SUFFIX};

// Polls before the extended multiplier kicks in.
const EXTENDED_POLL_AFTER: u32 = 3;

/// Orchestrates at-most-once execution of a unit of work per fingerprint.
///
/// Holds no mutable state of its own; everything shared lives in the
/// [`Backend`], so a `Coordinator` can be cloned freely across tasks.
#[derive(Clone)]
pub struct Coordinator {
    backend: Arc<dyn Backend>,
    config: Config,
}

impl Coordinator {
    pub fn new(backend: Arc<dyn Backend>, config: Config) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run `work` at most once per fingerprint within the TTL window.
    ///
    /// Skip-flagged descriptors and non-idempotent methods bypass entirely.
    /// Otherwise: a cache hit short-circuits; a cache miss races for the
    /// lock, and losers poll the cache between retries. The winner's result
    /// is serialized and cached on success; its failure is propagated
    /// verbatim and never cached. Lock release runs on every exit path out
    /// of the work, including cancellation of this future.
    pub async fn execute<T, F, Fut>(
        &self,
        descriptor: &RequestDescriptor,
        work: F,
    ) -> Result<T, IdempotencyError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if descriptor.skip || !self.config.is_idempotent_method(&descriptor.method) {
            return work().await.map_err(IdempotencyError::Work);
        }

        let key = fingerprint(descriptor, &self.config.inclusion_policy);
        if let Some(hit) = self.read_cache::<T>(&key).await {
            return Ok(hit);
        }

        let lock_key = format!("{key}{LOCK_SUFFIX}");
        let lock_ttl_ms = self.config.ttl_secs.saturating_mul(1000);

        let mut acquired = self.backend.acquire_lock(&lock_key, lock_ttl_ms).await;
        let mut attempt = 0u32;
        while !acquired && attempt < self.config.max_lock_retries {
            attempt += 1;
            tokio::time::sleep(self.retry_delay(attempt)).await;
            // The holder may have finished while we slept.
            if let Some(hit) = self.read_cache::<T>(&key).await {
                return Ok(hit);
            }
            acquired = self.backend.acquire_lock(&lock_key, lock_ttl_ms).await;
        }

        if !acquired {
            match self.config.contention_policy {
                ContentionPolicy::FailOpen => {
                    tracing::warn!(
                        key = %key,
                        retries = self.config.max_lock_retries,
                        "lock contention exhausted, executing without lock"
                    );
                }
                ContentionPolicy::Fail => {
                    return Err(IdempotencyError::LockContention { key });
                }
            }
        }

        // Release must happen however the work concludes, cancellation
        // included. Releasing a lock we never held is a no-op.
        let guard = ReleaseGuard::new(Arc::clone(&self.backend), lock_key);

        match work().await {
            Ok(value) => {
                self.write_cache(&key, &value).await;
                guard.release().await;
                Ok(value)
            }
            Err(e) => {
                // Failures are never cached: the next caller gets to retry.
                guard.release().await;
                Err(IdempotencyError::Work(e))
            }
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let mut delay_ms = self.config.lock_retry_delay_ms;
        if attempt > EXTENDED_POLL_AFTER {
            delay_ms =
                delay_ms.saturating_mul(u64::from(self.config.extended_poll_multiplier.max(1)));
        }
        Duration::from_millis(delay_ms)
    }

    async fn read_cache<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.backend.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => {
                tracing::debug!(key, "idempotency cache hit");
                Some(value)
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "cached value failed to deserialize, treating as miss");
                None
            }
        }
    }

    /// Populate the cache. A failed write (or an unserializable result) is
    /// logged and absorbed: the work already succeeded and the caller must
    /// still receive its result; the cost is only a future cache miss.
    async fn write_cache<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(json) => {
                if let Err(e) = self.backend.set(key, &json, self.config.ttl_secs).await {
                    tracing::warn!(key, error = %e, "cache write failed, result returned uncached");
                }
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "result not serializable, skipping cache");
            }
        }
    }
}

/// Releases the lock exactly once: explicitly on the normal paths, or from
/// `Drop` if the surrounding future is cancelled mid-work.
struct ReleaseGuard {
    inner: Option<(Arc<dyn Backend>, String)>,
}

impl ReleaseGuard {
    fn new(backend: Arc<dyn Backend>, lock_key: String) -> Self {
        Self {
            inner: Some((backend, lock_key)),
        }
    }

    async fn release(mut self) {
        if let Some((backend, lock_key)) = self.inner.take() {
            backend.release_lock(&lock_key).await;
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some((backend, lock_key)) = self.inner.take() {
            // Cancelled before the explicit release ran. Release cannot be
            // awaited from Drop, so hand it to the runtime if one is alive;
            // otherwise the lock TTL reaps it.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { backend.release_lock(&lock_key).await });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryBackend;

    fn coordinator_with_multiplier(multiplier: u32) -> Coordinator {
        Coordinator::new(
            Arc::new(MemoryBackend::new()),
            Config {
                lock_retry_delay_ms: 100,
                extended_poll_multiplier: multiplier,
                ..Config::default()
            },
        )
    }

    #[test]
    fn retry_delay_scales_from_the_fourth_poll_onward() {
        let coordinator = coordinator_with_multiplier(5);
        for attempt in 1..=3 {
            assert_eq!(
                coordinator.retry_delay(attempt),
                Duration::from_millis(100)
            );
        }
        assert_eq!(coordinator.retry_delay(4), Duration::from_millis(500));
        assert_eq!(coordinator.retry_delay(10), Duration::from_millis(500));
    }

    #[test]
    fn default_multiplier_leaves_every_delay_unchanged() {
        let coordinator = coordinator_with_multiplier(1);
        assert_eq!(coordinator.retry_delay(1), Duration::from_millis(100));
        assert_eq!(coordinator.retry_delay(4), Duration::from_millis(100));
    }

    #[test]
    fn zero_multiplier_never_collapses_the_delay() {
        // a misconfigured multiplier of 0 must not turn polling into a spin
        let coordinator = coordinator_with_multiplier(0);
        assert_eq!(coordinator.retry_delay(4), Duration::from_millis(100));
    }
}
