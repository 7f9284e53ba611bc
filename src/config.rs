use std::collections::HashSet;

use crate::fingerprint::InclusionPolicy;

/// What to do when the lock retry budget runs out without a cache hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentionPolicy {
    /// Execute the work unprotected and log a warning. Bounded redundant
    /// execution is preferred over blocking the caller indefinitely.
    #[default]
    FailOpen,
    /// Return [`crate::IdempotencyError::LockContention`] instead.
    Fail,
}

/// Tuning knobs for the coordinator. Backend choice is by construction:
/// hand the coordinator a [`crate::MemoryBackend`] or a
/// [`crate::RedisBackend`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Lifetime of cache entries and locks, in seconds. The sole timeout
    /// mechanism: set it above the worst-case latency of the protected work.
    pub ttl_secs: u64,
    /// Methods eligible for deduplication; anything else bypasses entirely.
    pub idempotent_methods: HashSet<String>,
    pub inclusion_policy: InclusionPolicy,
    /// Lock acquisition attempts after the first before giving up.
    pub max_lock_retries: u32,
    pub lock_retry_delay_ms: u64,
    /// Multiplier applied to the retry delay after the first three polls,
    /// for callers that want to back off on long-running work.
    pub extended_poll_multiplier: u32,
    pub contention_policy: ContentionPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            idempotent_methods: ["POST", "PUT", "PATCH"]
                .into_iter()
                .map(String::from)
                .collect(),
            inclusion_policy: InclusionPolicy::default(),
            max_lock_retries: 10,
            lock_retry_delay_ms: 100,
            extended_poll_multiplier: 1,
            contention_policy: ContentionPolicy::FailOpen,
        }
    }
}

impl Config {
    pub fn is_idempotent_method(&self, method: &str) -> bool {
        self.idempotent_methods
            .contains(&method.to_ascii_uppercase())
    }
}

/// Build a [`Config`] from `IDEMGATE_*` environment variables, falling back
/// to defaults for anything unset or unparsable.
///
/// Recognized: `IDEMGATE_TTL_SECS`, `IDEMGATE_METHODS` (comma-separated),
/// `IDEMGATE_MAX_LOCK_RETRIES`, `IDEMGATE_LOCK_RETRY_DELAY_MS`,
/// `IDEMGATE_POLL_MULTIPLIER`, `IDEMGATE_STRICT_LOCKING` (`1`/`true` selects
/// [`ContentionPolicy::Fail`]).
pub fn load() -> Config {
    dotenvy::dotenv().ok();
    let defaults = Config::default();

    let methods: HashSet<String> = match std::env::var("IDEMGATE_METHODS") {
        Ok(raw) if !raw.trim().is_empty() => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_ascii_uppercase)
            .collect(),
        _ => defaults.idempotent_methods,
    };

    let strict = std::env::var("IDEMGATE_STRICT_LOCKING")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    Config {
        ttl_secs: env_parse("IDEMGATE_TTL_SECS", defaults.ttl_secs),
        idempotent_methods: methods,
        inclusion_policy: InclusionPolicy::default(),
        max_lock_retries: env_parse("IDEMGATE_MAX_LOCK_RETRIES", defaults.max_lock_retries),
        lock_retry_delay_ms: env_parse("IDEMGATE_LOCK_RETRY_DELAY_MS", defaults.lock_retry_delay_ms),
        extended_poll_multiplier: env_parse(
            "IDEMGATE_POLL_MULTIPLIER",
            defaults.extended_poll_multiplier,
        ),
        contention_policy: if strict {
            ContentionPolicy::Fail
        } else {
            ContentionPolicy::FailOpen
        },
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
