//! The outcome of a rate limit check.

use serde::Serialize;

/// Whether a request is admitted, plus the quota metadata callers use to
/// throttle themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The quota in force
    pub limit: u64,
    /// Units left, always within `0..=limit`
    pub remaining: u64,
    /// Epoch second at which the quota is next fully or partially restored
    pub reset_at: u64,
    /// Seconds to wait before retrying; present only on denial
    pub retry_after: Option<u64>,
}

impl Decision {
    /// An admitting decision.
    pub fn allow(limit: u64, remaining: u64, reset_at: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: remaining.min(limit),
            reset_at,
            retry_after: None,
        }
    }

    /// A denying decision. The retry hint is never below one second.
    pub fn deny(limit: u64, remaining: u64, reset_at: u64, retry_after: u64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: remaining.min(limit),
            reset_at,
            retry_after: Some(retry_after.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_clamped_to_limit() {
        let decision = Decision::allow(5, 9, 100);
        assert_eq!(decision.remaining, 5);
        assert!(decision.retry_after.is_none());
    }

    #[test]
    fn test_deny_always_carries_retry_hint() {
        let decision = Decision::deny(5, 0, 100, 0);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, Some(1));
    }
}
