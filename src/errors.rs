use thiserror::Error;

/// Failures a caller of [`crate::Coordinator::execute`] can observe.
///
/// Backend read and lock-release failures never appear here: a failed read
/// degrades to a cache miss and a failed release degrades to waiting out the
/// lock TTL. The worst a caller sees from the storage layer is redundant
/// execution, never an error.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// The caller's unit of work failed. Propagated verbatim, never cached.
    #[error(transparent)]
    Work(#[from] anyhow::Error),

    /// Lock retries exhausted under [`crate::ContentionPolicy::Fail`].
    /// Under the default fail-open policy this is logged, not returned.
    #[error("lock contention exhausted for {key}")]
    LockContention { key: String },
}

/// Storage write-path failure. Surfaced by [`crate::store::Backend::set`] so
/// the coordinator can log it; read-path failures are absorbed by the
/// backends themselves.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
