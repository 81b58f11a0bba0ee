//! Sliding window log.
//!
//! The store keeps the timestamps admitted in the trailing window; eviction,
//! the capacity check and recording the new timestamp happen as one atomic
//! update. Rejected requests are not recorded.

use super::clock::Millis;
use super::decision::Decision;
use super::identifier::CounterKey;
use super::rules::Rule;
use crate::store::{CounterScript, CounterStore, StoreResult};

pub(crate) async fn check(
    store: &dyn CounterStore,
    key: &CounterKey,
    rule: &Rule,
    now_ms: Millis,
) -> StoreResult<Decision> {
    let window_ms = rule.window_ms();
    let script = CounterScript::SlidingWindow {
        now_ms,
        window_ms,
        limit: rule.limit(),
        // Distinct members so simultaneous requests are all counted.
        member: format!("{}-{}", now_ms, uuid::Uuid::new_v4()),
    };

    let outcome = store.eval(key.as_str(), &script).await?.into_sliding_window()?;

    // The earliest counted event leaving the window frees the next slot.
    let reset_at_ms = match outcome.oldest_ms {
        Some(oldest) => oldest + window_ms,
        None => now_ms + window_ms,
    };

    Ok(Decision::for_rule(
        rule,
        outcome.admitted,
        rule.limit().saturating_sub(outcome.count),
        reset_at_ms,
    ))
}
