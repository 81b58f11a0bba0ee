//! Counter stores.
//!
//! A counter store is the shared substrate every limiting algorithm runs
//! against. It offers plain reads and writes, an atomic
//! increment-with-expiry, and a small closed set of multi-step updates
//! ([`CounterScript`]) that the backend must execute atomically.
//!
//! Two backends are provided: [`MemoryStore`] for single-instance
//! deployments and [`RedisStore`] for deployments where several processes
//! share quotas.

mod memory;
mod remote;

pub use memory::MemoryStore;
pub use remote::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::ratelimit::Millis;

/// Errors raised by a counter store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached, timed out, or answered with
    /// something the caller cannot interpret.
    #[error("{0}")]
    Unavailable(String),
}

/// Result type alias for counter store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// An atomic multi-step update executed by the store on a single key.
///
/// How a backend achieves atomicity is its own business: the in-process
/// store runs the update under the key's shard lock, the Redis store ships
/// it as a server-side script.
#[derive(Debug, Clone, PartialEq)]
pub enum CounterScript {
    /// Sliding window log: drop timestamps at or before `now_ms - window_ms`,
    /// record `member` at `now_ms` if fewer than `limit` remain, refresh the
    /// key's TTL to `window_ms`.
    SlidingWindow {
        now_ms: Millis,
        window_ms: u64,
        limit: u64,
        member: String,
    },
    /// Token bucket: refill by whole `interval_ms` periods since the last
    /// refill (capped at `capacity`), then take one token if available.
    /// A missing bucket starts full. The key expires after `ttl_ms`.
    TokenBucket {
        now_ms: Millis,
        capacity: u64,
        interval_ms: f64,
        ttl_ms: u64,
    },
}

impl CounterScript {
    pub fn name(&self) -> &'static str {
        match self {
            CounterScript::SlidingWindow { .. } => "sliding_window",
            CounterScript::TokenBucket { .. } => "token_bucket",
        }
    }
}

/// The outcome of a [`CounterScript::SlidingWindow`] update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowOutcome {
    pub admitted: bool,
    /// Timestamps counted in the window after the update.
    pub count: u64,
    /// Oldest counted timestamp, if any remain.
    pub oldest_ms: Option<Millis>,
}

/// The outcome of a [`CounterScript::TokenBucket`] update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketOutcome {
    pub admitted: bool,
    /// Whole tokens left after the update.
    pub tokens: u64,
    /// Refill anchor after the update, floored to the millisecond.
    pub last_refill_ms: Millis,
}

/// What a [`CounterScript`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOutput {
    SlidingWindow(SlidingWindowOutcome),
    TokenBucket(TokenBucketOutcome),
}

impl ScriptOutput {
    pub fn into_sliding_window(self) -> StoreResult<SlidingWindowOutcome> {
        match self {
            ScriptOutput::SlidingWindow(outcome) => Ok(outcome),
            other => Err(StoreError::Unavailable(format!(
                "expected a sliding window reply, got {:?}",
                other
            ))),
        }
    }

    pub fn into_token_bucket(self) -> StoreResult<TokenBucketOutcome> {
        match self {
            ScriptOutput::TokenBucket(outcome) => Ok(outcome),
            other => Err(StoreError::Unavailable(format!(
                "expected a token bucket reply, got {:?}",
                other
            ))),
        }
    }
}

/// Shared key-value substrate with atomic read-modify-write primitives.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read an integer counter. Missing and expired keys read as `None`.
    async fn get(&self, key: &str) -> StoreResult<Option<i64>>;

    /// Overwrite an integer counter with a fresh TTL.
    async fn set(&self, key: &str, value: i64, ttl: Duration) -> StoreResult<()>;

    /// Atomically increment a counter, creating it at 1 with `ttl` if absent.
    /// Returns the post-increment value.
    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<i64>;

    /// Atomically run a multi-step update against `key`.
    async fn eval(&self, key: &str, script: &CounterScript) -> StoreResult<ScriptOutput>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}

/// Longest expiry any store entry carries. Longer TTLs are clamped to it.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 86_400);

/// Round a TTL up to whole milliseconds, between one and [`MAX_TTL`].
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    let ttl = ttl.min(MAX_TTL);
    let ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    if Duration::from_millis(ms) < ttl {
        ms.saturating_add(1)
    } else {
        ms.max(1)
    }
}
