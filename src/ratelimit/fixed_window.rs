//! Fixed window counting.
//!
//! Time is cut into windows aligned to multiples of the rule's window since
//! the epoch, and each window gets its own counter. A caller can spend a full
//! quota at the end of one window and another at the start of the next, so up
//! to twice the limit may pass across a boundary.

use super::clock::Millis;
use super::decision::Decision;
use super::identifier::CounterKey;
use super::rules::Rule;
use crate::store::{CounterStore, StoreResult};

pub(crate) async fn check(
    store: &dyn CounterStore,
    key: &CounterKey,
    rule: &Rule,
    now_ms: Millis,
) -> StoreResult<Decision> {
    let window_ms = rule.window_ms();
    let window_index = now_ms / window_ms;
    let window_start = window_index * window_ms;

    let count = store
        .increment_with_expiry(&key.windowed(window_index), rule.window())
        .await?
        .max(0) as u64;

    let limit = rule.limit();
    Ok(Decision::for_rule(
        rule,
        count <= limit,
        limit.saturating_sub(count),
        window_start + window_ms,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Dimension, ManualClock};
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup(limit: u64, window: Duration) -> (Arc<ManualClock>, MemoryStore, Rule, CounterKey) {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::new(clock.clone());
        let rule = Rule::fixed_window("fw", Dimension::Account, limit, window).unwrap();
        let key = CounterKey::derive("test", &rule, "acct");
        (clock, store, rule, key)
    }

    #[tokio::test]
    async fn test_counts_down_then_rejects() {
        let (_clock, store, rule, key) = setup(3, Duration::from_secs(10));

        for expected in [2, 1, 0] {
            let d = check(&store, &key, &rule, 1_000).await.unwrap();
            assert!(d.allowed);
            assert_eq!(d.remaining, expected);
            assert_eq!(d.limit, 3);
            assert_eq!(d.reset_at_ms, 10_000);
        }

        let d = check(&store, &key, &rule, 2_000).await.unwrap();
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
    }

    #[tokio::test]
    async fn test_boundary_burst_admits_twice_the_limit() {
        let (clock, store, rule, key) = setup(5, Duration::from_secs(1));

        clock.set(990);
        for _ in 0..5 {
            assert!(check(&store, &key, &rule, 990).await.unwrap().allowed);
        }
        assert!(!check(&store, &key, &rule, 995).await.unwrap().allowed);

        clock.set(1_010);
        for _ in 0..5 {
            let d = check(&store, &key, &rule, 1_010).await.unwrap();
            assert!(d.allowed);
            assert_eq!(d.reset_at_ms, 2_000);
        }
    }
}
