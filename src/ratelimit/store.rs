//! Shared store abstraction.
//!
//! Every strategy's read-modify-write runs as one atomic operation inside the
//! store, never under a lock local to this process, so the result is correct
//! however many instances share the store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::strategy::{BucketOutcome, CounterOutcome, LogOutcome};
use crate::error::Result;

/// Trait for shared rate limit stores.
///
/// Each method is a single atomic step for one strategy. Implementations must
/// refresh the entry's time-to-live on every call so idle keys expire.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Add `cost` to a window counter, rolling the addition back if the
    /// result would exceed `limit`.
    async fn fixed_window(
        &self,
        key: &str,
        cost: u64,
        limit: u64,
        now: f64,
        ttl_secs: u64,
    ) -> Result<CounterOutcome>;

    /// Prune the request log to the trailing window, then record `cost`
    /// entries at `now` if they fit under `limit`.
    async fn sliding_window(
        &self,
        key: &str,
        cost: u64,
        limit: u64,
        window_secs: f64,
        now: f64,
        ttl_secs: u64,
    ) -> Result<LogOutcome>;

    /// Refill a token bucket up to `capacity` and take `cost` tokens if
    /// available.
    async fn token_bucket(
        &self,
        key: &str,
        cost: f64,
        capacity: f64,
        rate: f64,
        now: f64,
        ttl_secs: u64,
    ) -> Result<BucketOutcome>;

    /// Drain a leaky bucket and pour `cost` in if it fits under `capacity`.
    async fn leaky_bucket(
        &self,
        key: &str,
        cost: f64,
        capacity: f64,
        rate: f64,
        now: f64,
        ttl_secs: u64,
    ) -> Result<BucketOutcome>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<()>;

    /// Backend name for logs and health output.
    fn name(&self) -> &'static str;
}

/// What a check resolves to when the store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request, preserving availability
    #[default]
    Open,
    /// Deny the request, preserving the limiting guarantee
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_policy_defaults_open() {
        assert_eq!(FailurePolicy::default(), FailurePolicy::Open);
    }

    #[test]
    fn test_failure_policy_names() {
        let closed: FailurePolicy = serde_yaml::from_str("closed").unwrap();
        assert_eq!(closed, FailurePolicy::Closed);
        assert_eq!(serde_json::to_string(&FailurePolicy::Open).unwrap(), "\"open\"");
    }
}
