//! Core limiter: evaluates every applicable rule for a request.

use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::clock::{Clock, Millis};
use super::decision::{CombinedDecision, Decision};
use super::identifier::{CounterKey, IdentifierBundle};
use super::rules::{Rule, RuleSet};
use super::strategy;
use crate::error::Result;
use crate::store::{CounterStore, StoreError};

/// Default key namespace in the counter store.
pub const DEFAULT_KEY_PREFIX: &str = "floodgate";
/// Default bound on a single store operation.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(50);

/// What to do with a rule whose counter store is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit: availability of the protected resource first.
    Open,
    /// Reject: protect the backend during an outage.
    Closed,
}

/// Limiter settings that apply to every rule.
#[derive(Debug, Clone)]
pub struct LimiterOptions {
    pub failure_policy: FailurePolicy,
    pub store_timeout: Duration,
    pub key_prefix: String,
}

impl LimiterOptions {
    /// Options with the given policy and default timeout and prefix.
    pub fn new(failure_policy: FailurePolicy) -> Self {
        Self {
            failure_policy,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

/// The admission limiter.
///
/// Holds no per-request state: every evaluation reads and mutates the
/// counter store. The rule set is immutable and replaced wholesale on reload.
pub struct Limiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    rules: RwLock<Arc<RuleSet>>,
    options: LimiterOptions,
}

impl Limiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        rules: RuleSet,
        options: LimiterOptions,
    ) -> Self {
        debug!(
            rules = rules.len(),
            backend = store.backend_name(),
            failure_policy = ?options.failure_policy,
            "Creating limiter"
        );
        Self {
            store,
            clock,
            rules: RwLock::new(Arc::new(rules)),
            options,
        }
    }

    /// Snapshot of the active rule set.
    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules.read().clone()
    }

    /// Install a new rule set. In-flight evaluations finish on the old one.
    pub fn replace_rules(&self, rules: RuleSet) {
        *self.rules.write() = Arc::new(rules);
    }

    /// Re-read the rule file at `path`, swapping it in if it changed.
    ///
    /// On error the active rules stay in place. Returns whether the rules changed.
    pub fn reload_rules(&self, path: &Path) -> Result<bool> {
        let rules = RuleSet::from_file(path)?;
        if *self.rules() == rules {
            return Ok(false);
        }
        info!(rules = rules.len(), path = %path.display(), "Rate limit rules reloaded");
        self.replace_rules(rules);
        Ok(true)
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.options.failure_policy
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The store key a rule uses for an identifier value.
    pub fn counter_key(&self, rule: &Rule, value: &str) -> CounterKey {
        CounterKey::derive(&self.options.key_prefix, rule, value)
    }

    /// Decide whether a request carrying `identifiers` may proceed.
    ///
    /// Rules whose dimension is absent from the bundle are skipped. The
    /// remaining rules are checked concurrently; store failures are resolved
    /// by the failure policy and never surface as errors.
    pub async fn evaluate(&self, identifiers: &IdentifierBundle) -> CombinedDecision {
        let rules = self.rules();
        let now = self.clock.now_ms();

        let checks = rules.iter().filter_map(|rule| {
            let Some(value) = identifiers.get(rule.dimension()) else {
                trace!(rule = %rule.id(), dimension = %rule.dimension(), "Identifier missing, skipping rule");
                return None;
            };
            let key = self.counter_key(rule, value);
            Some(self.check_rule(rule, key, now))
        });
        let decisions = join_all(checks).await;

        let combined = CombinedDecision::combine(decisions, now);
        if !combined.allowed {
            if let Some(binding) = &combined.binding {
                debug!(
                    rule = %binding.rule,
                    limit = binding.limit,
                    reset_at_ms = binding.reset_at_ms,
                    degraded = combined.degraded,
                    "Rate limit exceeded"
                );
            }
        }
        combined
    }

    async fn check_rule(&self, rule: &Rule, key: CounterKey, now: Millis) -> Decision {
        trace!(key = %key, rule = %rule.id(), algorithm = rule.algorithm().name(), "Checking rate limit");

        let result = tokio::time::timeout(
            self.options.store_timeout,
            strategy::check(self.store.as_ref(), &key, rule, now),
        )
        .await
        .unwrap_or_else(|_| {
            Err(StoreError::Unavailable(format!(
                "timed out after {:?}",
                self.options.store_timeout
            )))
        });

        match result {
            Ok(decision) => decision,
            Err(err) => {
                warn!(
                    key = %key,
                    rule = %rule.id(),
                    backend = self.store.backend_name(),
                    error = %err,
                    failure_policy = ?self.options.failure_policy,
                    "Counter store unavailable, applying failure policy"
                );
                self.degraded_decision(rule, now)
            }
        }
    }

    fn degraded_decision(&self, rule: &Rule, now: Millis) -> Decision {
        let reset_at_ms = now + rule.window_ms();
        let mut decision = match self.options.failure_policy {
            FailurePolicy::Open => Decision::for_rule(rule, true, rule.limit(), reset_at_ms),
            FailurePolicy::Closed => Decision::for_rule(rule, false, 0, reset_at_ms),
        };
        decision.degraded = true;
        decision
    }
}
