//! Admission decisions.

use std::time::Duration;

use super::clock::Millis;
use super::rules::{Dimension, Rule};

/// The verdict of one rule for one request. Created fresh per evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Identity of the rule that produced this decision
    pub rule: String,
    pub algorithm: &'static str,
    pub dimension: Dimension,
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// When the window or bucket will next yield capacity (epoch ms)
    pub reset_at_ms: Millis,
    /// Decided by failure policy because the counter store was unavailable
    pub degraded: bool,
}

impl Decision {
    pub(crate) fn for_rule(rule: &Rule, allowed: bool, remaining: u64, reset_at_ms: Millis) -> Self {
        Self {
            rule: rule.id().to_string(),
            algorithm: rule.algorithm().name(),
            dimension: rule.dimension(),
            allowed,
            limit: rule.limit(),
            remaining,
            reset_at_ms,
            degraded: false,
        }
    }

    /// Time from `now_ms` until the reset, zero if already passed.
    pub fn reset_after(&self, now_ms: Millis) -> Duration {
        Duration::from_millis(self.reset_at_ms.saturating_sub(now_ms))
    }
}

/// The single verdict for a request across every applicable rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinedDecision {
    /// False if any applicable rule rejected the request
    pub allowed: bool,
    /// The most restrictive decision; `None` when no rule applied
    pub binding: Option<Decision>,
    /// Every evaluated rule, in rule set order
    pub decisions: Vec<Decision>,
    /// True if any decision was produced under degraded conditions
    pub degraded: bool,
    pub evaluated_at_ms: Millis,
}

impl CombinedDecision {
    /// Combine per-rule decisions.
    ///
    /// The binding decision is picked among rejecting rules when there are
    /// any, otherwise among all rules: lowest `remaining` wins, ties go to the
    /// nearest reset.
    pub fn combine(decisions: Vec<Decision>, evaluated_at_ms: Millis) -> Self {
        let allowed = decisions.iter().all(|d| d.allowed);
        let degraded = decisions.iter().any(|d| d.degraded);

        let binding = decisions
            .iter()
            .filter(|d| allowed || !d.allowed)
            .min_by_key(|d| (d.remaining, d.reset_at_ms))
            .cloned();

        Self {
            allowed,
            binding,
            decisions,
            degraded,
            evaluated_at_ms,
        }
    }

    pub fn limit(&self) -> Option<u64> {
        self.binding.as_ref().map(|d| d.limit)
    }

    pub fn remaining(&self) -> Option<u64> {
        self.binding.as_ref().map(|d| d.remaining)
    }

    pub fn reset_at_ms(&self) -> Option<Millis> {
        self.binding.as_ref().map(|d| d.reset_at_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(rule: &str, allowed: bool, remaining: u64, reset_at_ms: Millis) -> Decision {
        Decision {
            rule: rule.to_string(),
            algorithm: "fixed_window",
            dimension: Dimension::Account,
            allowed,
            limit: 100,
            remaining,
            reset_at_ms,
            degraded: false,
        }
    }

    #[test]
    fn test_most_restrictive_wins() {
        let combined = CombinedDecision::combine(
            vec![decision("roomy", true, 50, 1_000), decision("exhausted", false, 0, 2_000)],
            0,
        );

        assert!(!combined.allowed);
        assert_eq!(combined.remaining(), Some(0));
        assert_eq!(combined.binding.unwrap().rule, "exhausted");
        assert_eq!(combined.decisions.len(), 2);
    }

    #[test]
    fn test_ties_go_to_nearest_reset() {
        let combined = CombinedDecision::combine(
            vec![decision("late", true, 3, 9_000), decision("soon", true, 3, 4_000)],
            0,
        );

        assert!(combined.allowed);
        assert_eq!(combined.binding.unwrap().rule, "soon");
    }

    #[test]
    fn test_rejection_binds_over_allowed_at_zero() {
        // The last permitted request leaves remaining = 0 but must not mask a rejection.
        let combined = CombinedDecision::combine(
            vec![decision("last-one", true, 0, 1_000), decision("over", false, 0, 5_000)],
            0,
        );

        assert!(!combined.allowed);
        assert_eq!(combined.binding.unwrap().rule, "over");
    }

    #[test]
    fn test_no_rules_is_allowed_without_binding() {
        let combined = CombinedDecision::combine(Vec::new(), 0);

        assert!(combined.allowed);
        assert!(combined.binding.is_none());
        assert_eq!(combined.limit(), None);
        assert!(!combined.degraded);
    }

    #[test]
    fn test_reset_after_saturates() {
        let d = decision("r", true, 1, 1_500);
        assert_eq!(d.reset_after(1_000), Duration::from_millis(500));
        assert_eq!(d.reset_after(2_000), Duration::ZERO);
    }
}
