//! The client-facing admission contract.
//!
//! Whatever transport fronts the limiter, a decision reaches clients as an
//! HTTP status plus the `X-RateLimit-*` headers below. The header names and
//! their meaning are fixed for compatibility with existing clients.

use std::time::Duration;

use crate::ratelimit::{CombinedDecision, Millis};

/// Maximum units permitted by the binding rule's window.
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
/// Units left under the binding rule.
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
/// Unix time, in seconds, at which the binding rule yields more capacity.
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
/// Seconds to wait before retrying; only sent on rejection.
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

pub const STATUS_OK: u16 = 200;
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

fn ceil_secs(millis: u64) -> u64 {
    millis.div_ceil(1_000)
}

/// HTTP status the fronting transport should answer with.
pub fn http_status(decision: &CombinedDecision) -> u16 {
    if decision.allowed {
        STATUS_OK
    } else {
        STATUS_TOO_MANY_REQUESTS
    }
}

/// Delay before a rejected caller should retry: whole seconds, at least one.
pub fn retry_after(decision: &CombinedDecision, now_ms: Millis) -> Option<Duration> {
    if decision.allowed {
        return None;
    }
    let wait_ms = decision.reset_at_ms()?.saturating_sub(now_ms);
    Some(Duration::from_secs(ceil_secs(wait_ms).max(1)))
}

/// Rate limit headers for a decision. Empty when no rule applied.
pub fn rate_limit_headers(decision: &CombinedDecision, now_ms: Millis) -> Vec<(&'static str, String)> {
    let Some(binding) = &decision.binding else {
        return Vec::new();
    };

    let mut headers = vec![
        (HEADER_LIMIT, binding.limit.to_string()),
        (HEADER_REMAINING, binding.remaining.to_string()),
        (HEADER_RESET, ceil_secs(binding.reset_at_ms).to_string()),
    ];
    if let Some(wait) = retry_after(decision, now_ms) {
        headers.push((HEADER_RETRY_AFTER, wait.as_secs().to_string()));
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Decision, Dimension};

    fn combined(allowed: bool, remaining: u64, reset_at_ms: Millis) -> CombinedDecision {
        CombinedDecision::combine(
            vec![Decision {
                rule: "r".to_string(),
                algorithm: "fixed_window",
                dimension: Dimension::Account,
                allowed,
                limit: 100,
                remaining,
                reset_at_ms,
                degraded: false,
            }],
            0,
        )
    }

    #[test]
    fn test_headers_for_allowed_request() {
        let headers = rate_limit_headers(&combined(true, 42, 1_700_000_000_250), 1_699_999_999_000);

        assert_eq!(
            headers,
            vec![
                ("X-RateLimit-Limit", "100".to_string()),
                ("X-RateLimit-Remaining", "42".to_string()),
                ("X-RateLimit-Reset", "1700000001".to_string()),
            ]
        );
    }

    #[test]
    fn test_rejection_carries_retry_after() {
        let decision = combined(false, 0, 10_500);

        assert_eq!(http_status(&decision), 429);
        assert_eq!(retry_after(&decision, 8_000), Some(Duration::from_secs(3)));

        let headers = rate_limit_headers(&decision, 8_000);
        assert!(headers.contains(&(HEADER_RETRY_AFTER, "3".to_string())));
        assert!(headers.contains(&(HEADER_REMAINING, "0".to_string())));
    }

    #[test]
    fn test_retry_after_is_at_least_one_second() {
        let decision = combined(false, 0, 1_000);
        assert_eq!(retry_after(&decision, 1_000), Some(Duration::from_secs(1)));
        assert_eq!(retry_after(&decision, 5_000), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_no_binding_means_no_headers() {
        let decision = CombinedDecision::combine(Vec::new(), 0);

        assert_eq!(http_status(&decision), 200);
        assert!(rate_limit_headers(&decision, 0).is_empty());
        assert_eq!(retry_after(&decision, 0), None);
    }
}
