//! Algorithm dispatch.

use super::clock::Millis;
use super::decision::Decision;
use super::identifier::CounterKey;
use super::rules::{Algorithm, Rule};
use super::{fixed_window, sliding_window, token_bucket};
use crate::store::{CounterStore, StoreResult};

/// Run the rule's algorithm for one request against the store.
pub async fn check(
    store: &dyn CounterStore,
    key: &CounterKey,
    rule: &Rule,
    now_ms: Millis,
) -> StoreResult<Decision> {
    match rule.algorithm() {
        Algorithm::FixedWindow => fixed_window::check(store, key, rule, now_ms).await,
        Algorithm::SlidingWindow => sliding_window::check(store, key, rule, now_ms).await,
        Algorithm::TokenBucket {
            capacity,
            refill_rate,
        } => token_bucket::check(store, key, rule, capacity, refill_rate, now_ms).await,
    }
}
