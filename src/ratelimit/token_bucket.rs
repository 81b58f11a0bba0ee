//! Token bucket.
//!
//! A bucket holds up to `capacity` whole tokens and gains one every
//! `window / refill_rate`. Each admitted request takes a token. The refill
//! anchor only moves by whole intervals, so partial progress toward the next
//! token carries over between requests.

use super::clock::Millis;
use super::decision::Decision;
use super::identifier::CounterKey;
use super::rules::Rule;
use crate::store::{CounterScript, CounterStore, StoreResult, MAX_TTL};

pub(crate) async fn check(
    store: &dyn CounterStore,
    key: &CounterKey,
    rule: &Rule,
    capacity: u64,
    refill_rate: f64,
    now_ms: Millis,
) -> StoreResult<Decision> {
    let interval_ms = rule.window_ms() as f64 / refill_rate;
    // An idle bucket is full again after this long, so its state can go.
    let ttl_ms = (capacity as f64 * interval_ms)
        .ceil()
        .clamp(1.0, MAX_TTL.as_millis() as f64) as u64;

    let script = CounterScript::TokenBucket {
        now_ms,
        capacity,
        interval_ms,
        ttl_ms,
    };
    let outcome = store.eval(key.as_str(), &script).await?.into_token_bucket()?;

    let reset_at_ms = if outcome.tokens >= 1 {
        now_ms
    } else {
        let next_token = (outcome.last_refill_ms as f64 + interval_ms).ceil() as Millis;
        next_token.max(now_ms)
    };

    Ok(Decision::for_rule(rule, outcome.admitted, outcome.tokens, reset_at_ms))
}
