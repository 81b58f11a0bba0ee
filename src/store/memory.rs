//! In-process counter store.
//!
//! Keys live in a sharded [`DashMap`]. Every operation on a key runs while
//! holding that key's shard lock and does nothing but in-memory arithmetic,
//! so updates to one key are linearizable and unrelated keys rarely contend.
//! Expired entries read as absent and are reclaimed by [`MemoryStore::sweep`].

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{
    ttl_millis, CounterScript, CounterStore, ScriptOutput, SlidingWindowOutcome, StoreResult,
    TokenBucketOutcome,
};
use crate::ratelimit::{Clock, Millis};

/// Backend-resident state of one key.
#[derive(Debug, Clone)]
enum Slot {
    Counter(i64),
    Log(VecDeque<Millis>),
    Bucket { tokens: u64, last_refill_ms: f64 },
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at_ms: Millis,
}

impl Entry {
    fn is_expired(&self, now_ms: Millis) -> bool {
        self.expires_at_ms <= now_ms
    }
}

/// Counter store for single-instance deployments.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Remove every expired entry, returning how many were reclaimed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawn a background task that sweeps every `every`.
    ///
    /// The task holds only a weak reference and exits once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    debug!("Counter store dropped, stopping sweeper");
                    break;
                };
                let removed = store.sweep();
                if removed > 0 {
                    debug!(removed = removed, remaining = store.len(), "Swept expired counters");
                }
            }
        })
    }
}

/// Sliding window log update on a (possibly fresh) log.
fn apply_sliding_window(
    log: &mut VecDeque<Millis>,
    now_ms: Millis,
    window_ms: u64,
    limit: u64,
) -> SlidingWindowOutcome {
    // Callers sample the clock before taking the lock, so arrivals can be
    // slightly out of order; the log is kept sorted.
    if let Some(horizon) = now_ms.checked_sub(window_ms) {
        let stale = log.partition_point(|&ts| ts <= horizon);
        log.drain(..stale);
    }

    let admitted = (log.len() as u64) < limit;
    if admitted {
        let at = log.partition_point(|&ts| ts <= now_ms);
        log.insert(at, now_ms);
    }

    SlidingWindowOutcome {
        admitted,
        count: log.len() as u64,
        oldest_ms: log.front().copied(),
    }
}

/// Token bucket update. Fractional refill progress stays in `last_refill_ms`.
fn apply_token_bucket(
    tokens: &mut u64,
    last_refill_ms: &mut f64,
    now_ms: Millis,
    capacity: u64,
    interval_ms: f64,
) -> TokenBucketOutcome {
    let now = now_ms as f64;
    if now > *last_refill_ms {
        let intervals = ((now - *last_refill_ms) / interval_ms).floor();
        if intervals >= 1.0 {
            let refill = intervals.min(capacity as f64) as u64;
            *tokens = (*tokens + refill).min(capacity);
            *last_refill_ms += intervals * interval_ms;
        }
    }
    // A full bucket does not bank progress toward the next token.
    if *tokens >= capacity {
        *last_refill_ms = now;
    }

    let admitted = *tokens >= 1;
    if admitted {
        *tokens -= 1;
    }

    TokenBucketOutcome {
        admitted,
        tokens: *tokens,
        last_refill_ms: last_refill_ms.floor() as Millis,
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        let now = self.clock.now_ms();
        let value = self.entries.get(key).and_then(|entry| match entry.slot {
            Slot::Counter(value) if !entry.is_expired(now) => Some(value),
            _ => None,
        });
        Ok(value)
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> StoreResult<()> {
        let expires_at_ms = self.clock.now_ms().saturating_add(ttl_millis(ttl));
        self.entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Counter(value),
                expires_at_ms,
            },
        );
        Ok(())
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let now = self.clock.now_ms();
        let fresh = || Entry {
            slot: Slot::Counter(1),
            expires_at_ms: now.saturating_add(ttl_millis(ttl)),
        };

        let value = match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let current = match entry.slot {
                    Slot::Counter(value) if !entry.is_expired(now) => Some(value),
                    _ => None,
                };
                match current {
                    Some(value) => {
                        entry.slot = Slot::Counter(value + 1);
                        value + 1
                    }
                    None => {
                        *entry = fresh();
                        1
                    }
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(fresh());
                1
            }
        };

        trace!(key = %key, value = value, "Incremented counter");
        Ok(value)
    }

    async fn eval(&self, key: &str, script: &CounterScript) -> StoreResult<ScriptOutput> {
        let now = self.clock.now_ms();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::Counter(0),
            expires_at_ms: 0,
        });
        let entry = entry.value_mut();
        let expired = entry.is_expired(now);

        let previous = std::mem::replace(&mut entry.slot, Slot::Counter(0));
        let output = match script {
            CounterScript::SlidingWindow {
                now_ms,
                window_ms,
                limit,
                ..
            } => {
                let mut log = match previous {
                    Slot::Log(log) if !expired => log,
                    _ => VecDeque::new(),
                };
                let outcome = apply_sliding_window(&mut log, *now_ms, *window_ms, *limit);
                entry.slot = Slot::Log(log);
                entry.expires_at_ms = now.saturating_add((*window_ms).max(1));
                ScriptOutput::SlidingWindow(outcome)
            }
            CounterScript::TokenBucket {
                now_ms,
                capacity,
                interval_ms,
                ttl_ms,
            } => {
                let (mut tokens, mut last_refill_ms) = match previous {
                    Slot::Bucket {
                        tokens,
                        last_refill_ms,
                    } if !expired => (tokens, last_refill_ms),
                    _ => (*capacity, *now_ms as f64),
                };
                let outcome = apply_token_bucket(
                    &mut tokens,
                    &mut last_refill_ms,
                    *now_ms,
                    *capacity,
                    *interval_ms,
                );
                entry.slot = Slot::Bucket {
                    tokens,
                    last_refill_ms,
                };
                entry.expires_at_ms = now.saturating_add((*ttl_ms).max(1));
                ScriptOutput::TokenBucket(outcome)
            }
        };

        trace!(key = %key, script = script.name(), output = ?output, "Evaluated counter script");
        Ok(output)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;

    fn store_at(start_ms: Millis) -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(start_ms));
        let store = MemoryStore::new(clock.clone());
        (clock, store)
    }

    fn sliding(now_ms: Millis, limit: u64) -> CounterScript {
        CounterScript::SlidingWindow {
            now_ms,
            window_ms: 1_000,
            limit,
            member: uuid::Uuid::new_v4().to_string(),
        }
    }

    #[tokio::test]
    async fn test_increment_initializes_then_counts() {
        let (_clock, store) = store_at(0);

        assert_eq!(store.increment_with_expiry("k", Duration::from_secs(1)).await, Ok(1));
        assert_eq!(store.increment_with_expiry("k", Duration::from_secs(1)).await, Ok(2));
        assert_eq!(store.get("k").await, Ok(Some(2)));
    }

    #[tokio::test]
    async fn test_increment_restarts_after_expiry() {
        let (clock, store) = store_at(0);

        store.increment_with_expiry("k", Duration::from_secs(1)).await.unwrap();
        store.increment_with_expiry("k", Duration::from_secs(1)).await.unwrap();

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get("k").await, Ok(None));
        assert_eq!(store.increment_with_expiry("k", Duration::from_secs(1)).await, Ok(1));
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let (clock, store) = store_at(0);

        store.set("k", 42, Duration::from_millis(500)).await.unwrap();
        assert_eq!(store.get("k").await, Ok(Some(42)));

        clock.advance(Duration::from_millis(500));
        assert_eq!(store.get("k").await, Ok(None));
        assert_eq!(store.get("missing").await, Ok(None));
    }

    #[tokio::test]
    async fn test_sweep_reclaims_expired_entries() {
        let (clock, store) = store_at(0);

        store.set("short", 1, Duration::from_millis(10)).await.unwrap();
        store.set("long", 1, Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.len(), 2);

        clock.advance(Duration::from_millis(10));
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("long").await, Ok(Some(1)));
    }

    #[tokio::test]
    async fn test_sliding_window_script_evicts_and_limits() {
        let (_clock, store) = store_at(0);

        for _ in 0..3 {
            let out = store.eval("log", &sliding(0, 3)).await.unwrap();
            assert!(out.into_sliding_window().unwrap().admitted);
        }

        let out = store.eval("log", &sliding(500, 3)).await.unwrap().into_sliding_window().unwrap();
        assert!(!out.admitted);
        assert_eq!(out.count, 3);
        assert_eq!(out.oldest_ms, Some(0));

        let out = store.eval("log", &sliding(1_010, 3)).await.unwrap().into_sliding_window().unwrap();
        assert!(out.admitted);
        assert_eq!(out.count, 1);
        assert_eq!(out.oldest_ms, Some(1_010));
    }

    #[test]
    fn test_sliding_window_keeps_log_sorted() {
        let mut log = VecDeque::new();
        apply_sliding_window(&mut log, 200, 1_000, 10);
        apply_sliding_window(&mut log, 100, 1_000, 10);
        apply_sliding_window(&mut log, 300, 1_000, 10);
        assert_eq!(log, VecDeque::from(vec![100, 200, 300]));
    }

    #[test]
    fn test_token_bucket_retains_fractional_progress() {
        let mut tokens = 0;
        let mut last = 0.0;

        // 1.5 intervals elapsed: one token, anchor advanced by exactly one interval.
        let out = apply_token_bucket(&mut tokens, &mut last, 1_500, 10, 1_000.0);
        assert!(out.admitted);
        assert_eq!(out.tokens, 0);
        assert_eq!(out.last_refill_ms, 1_000);

        // The retained half interval completes at 2s.
        let out = apply_token_bucket(&mut tokens, &mut last, 2_000, 10, 1_000.0);
        assert!(out.admitted);
        assert_eq!(out.last_refill_ms, 2_000);
    }

    #[test]
    fn test_token_bucket_never_exceeds_capacity() {
        let mut tokens = 2;
        let mut last = 0.0;

        let out = apply_token_bucket(&mut tokens, &mut last, 3_600_000, 5, 1_000.0);
        assert!(out.admitted);
        assert_eq!(out.tokens, 4);
        assert_eq!(out.last_refill_ms, 3_600_000);
    }

    #[tokio::test]
    async fn test_token_bucket_script_starts_full() {
        let (_clock, store) = store_at(0);
        let script = CounterScript::TokenBucket {
            now_ms: 0,
            capacity: 2,
            interval_ms: 1_000.0,
            ttl_ms: 2_000,
        };

        let first = store.eval("bucket", &script).await.unwrap().into_token_bucket().unwrap();
        assert!(first.admitted);
        assert_eq!(first.tokens, 1);

        let second = store.eval("bucket", &script).await.unwrap().into_token_bucket().unwrap();
        assert!(second.admitted);
        assert_eq!(second.tokens, 0);

        let third = store.eval("bucket", &script).await.unwrap().into_token_bucket().unwrap();
        assert!(!third.admitted);
    }

    #[tokio::test]
    async fn test_huge_ttls_keep_entries_alive() {
        let (clock, store) = store_at(1_700_000_000_000);

        assert_eq!(store.increment_with_expiry("n", Duration::MAX).await, Ok(1));
        assert_eq!(store.increment_with_expiry("n", Duration::MAX).await, Ok(2));
        store.set("s", 1, Duration::from_secs(i64::MAX as u64)).await.unwrap();

        let script = CounterScript::TokenBucket {
            now_ms: clock.now_ms(),
            capacity: 1,
            interval_ms: 1_000.0,
            ttl_ms: u64::MAX,
        };
        assert!(store.eval("bucket", &script).await.unwrap().into_token_bucket().unwrap().admitted);
        assert!(!store.eval("bucket", &script).await.unwrap().into_token_bucket().unwrap().admitted);

        clock.advance(Duration::from_secs(86_400));
        assert_eq!(store.get("n").await, Ok(Some(2)));
        assert_eq!(store.get("s").await, Ok(Some(1)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let (_clock, store) = store_at(0);
        let store = Arc::new(store);

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.increment_with_expiry("hot", Duration::from_secs(60)).await.unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get("hot").await, Ok(Some(200)));
    }

    #[tokio::test]
    async fn test_sweeper_stops_when_store_dropped() {
        let (_clock, store) = store_at(0);
        let store = Arc::new(store);
        let handle = store.spawn_sweeper(Duration::from_millis(5));

        drop(store);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should exit")
            .unwrap();
    }
}
