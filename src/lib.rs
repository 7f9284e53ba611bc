//! idemgate — request-level idempotency for outbound HTTP calls.
//!
//! Given a request descriptor, derive a deterministic fingerprint, coordinate
//! at-most-once execution among concurrent callers through a storage-backed
//! lock, and cache the result for a bounded time so duplicates are served
//! without re-executing the call.
//!
//! ```no_run
//! use std::sync::Arc;
//! use idemgate::{Config, Coordinator, MemoryBackend, RequestDescriptor};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), idemgate::IdempotencyError> {
//! let coordinator = Coordinator::new(Arc::new(MemoryBackend::new()), Config::default());
//! let descriptor = RequestDescriptor::new("POST", "/orders").with_json_body(json!({"a": 1}));
//! let result: serde_json::Value = coordinator
//!     .execute(&descriptor, || async { Ok(json!({"id": 1})) })
//!     .await?;
//! assert_eq!(result["id"], 1);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod errors;
pub mod fingerprint;
pub mod http;
pub mod store;

pub use config::{Config, ContentionPolicy};
pub use coordinator::Coordinator;
pub use errors::{BackendError, IdempotencyError};
pub use fingerprint::{
    fingerprint, Body, InclusionPolicy, QueryInclusion, RequestDescriptor, KEY_PREFIX,
};
pub use http::descriptor_from_request;
pub use store::memory::MemoryBackend;
pub use store::redis::RedisBackend;
pub use store::{Backend, LOCK_SUFFIX};
