//! The four counting algorithms.
//!
//! Each algorithm is split in two halves that live side by side here:
//!
//! - a pure state transition (`*_step`) that stores execute atomically, either
//!   directly under a per-key lock ([`MemoryStore`](super::MemoryStore)) or as
//!   the equivalent server-side script (`RedisStore`);
//! - the mapping from the store's outcome to a [`Decision`].
//!
//! [`check`] is the only place that dispatches on [`Strategy`].

use std::collections::VecDeque;
use tracing::trace;

use super::decision::Decision;
use super::key::RateLimitKey;
use super::rules::{RateLimitConfig, Strategy};
use super::store::RateLimitStore;
use crate::error::Result;

/// Tolerance for floating point comparisons on bucket levels.
pub const EPSILON: f64 = 1e-9;

/// Result of a fixed window step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterOutcome {
    pub admitted: bool,
    /// Counter value after the step (after rollback on denial)
    pub count: u64,
}

/// Result of a sliding window step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogOutcome {
    pub admitted: bool,
    /// Units recorded in the trailing window after the step
    pub count: u64,
    /// Timestamp of the oldest surviving entry
    pub oldest: Option<f64>,
}

/// Result of a token or leaky bucket step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    pub admitted: bool,
    /// Tokens left (token bucket) or volume held (leaky bucket) after the step
    pub level: f64,
}

/// Persisted bucket state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSnapshot {
    pub level: f64,
    pub updated_at: f64,
}

/// Increment a window counter by `cost`; undo the increment when the result
/// exceeds `limit`.
pub fn fixed_window_step(current: u64, cost: u64, limit: u64) -> CounterOutcome {
    let count = current.saturating_add(cost);
    if count <= limit {
        CounterOutcome {
            admitted: true,
            count,
        }
    } else {
        CounterOutcome {
            admitted: false,
            count: current,
        }
    }
}

/// Drop log entries at or before `now - window`, then append `cost` entries
/// at `now` if they fit.
pub fn sliding_window_step(
    log: &mut VecDeque<f64>,
    cost: u64,
    limit: u64,
    window: f64,
    now: f64,
) -> LogOutcome {
    let cutoff = now - window;
    log.retain(|&ts| ts > cutoff);

    let count = log.len() as u64;
    let admitted = count.saturating_add(cost) <= limit;
    if admitted {
        // Entries stay ordered even if another writer recorded a later time
        let at = log.back().map_or(now, |&last| last.max(now));
        log.extend(std::iter::repeat(at).take(cost as usize));
    }

    LogOutcome {
        admitted,
        count: log.len() as u64,
        oldest: log.front().copied(),
    }
}

/// Refill a token bucket for the time elapsed since its last update, then
/// take `cost` tokens if the bucket holds them. A missing bucket starts full.
pub fn token_bucket_step(
    state: Option<BucketSnapshot>,
    cost: f64,
    capacity: f64,
    rate: f64,
    now: f64,
) -> (BucketSnapshot, BucketOutcome) {
    let (tokens, last) = state.map_or((capacity, now), |s| (s.level, s.updated_at));
    let elapsed = (now - last).max(0.0);
    let mut tokens = (tokens + elapsed * rate).min(capacity);

    let admitted = tokens + EPSILON >= cost;
    if admitted {
        tokens = (tokens - cost).max(0.0);
    }

    (
        BucketSnapshot {
            level: tokens,
            updated_at: now.max(last),
        },
        BucketOutcome {
            admitted,
            level: tokens,
        },
    )
}

/// Drain a leaky bucket for the time elapsed since its last update, then pour
/// `cost` in if it fits under `capacity`. A missing bucket starts empty.
pub fn leaky_bucket_step(
    state: Option<BucketSnapshot>,
    cost: f64,
    capacity: f64,
    rate: f64,
    now: f64,
) -> (BucketSnapshot, BucketOutcome) {
    let (volume, last) = state.map_or((0.0, now), |s| (s.level, s.updated_at));
    let elapsed = (now - last).max(0.0);
    let mut volume = (volume - elapsed * rate).max(0.0);

    let admitted = volume + cost <= capacity + EPSILON;
    if admitted {
        volume += cost;
    }

    (
        BucketSnapshot {
            level: volume,
            updated_at: now.max(last),
        },
        BucketOutcome {
            admitted,
            level: volume,
        },
    )
}

/// Time-to-live for bucket entries: long enough to fully refill or drain, and
/// never shorter than the window.
pub fn bucket_ttl(config: &RateLimitConfig) -> u64 {
    let recover = ceil_secs(config.burst_capacity() as f64 / config.refill_rate());
    config.window_seconds.max(recover).max(1)
}

/// Start of the epoch-aligned window containing `now`.
pub fn window_start(now: f64, window_seconds: u64) -> u64 {
    let now = now.max(0.0).floor() as u64;
    now - (now % window_seconds.max(1))
}

/// Round seconds up, ignoring floating point noise just above an integer.
fn ceil_secs(seconds: f64) -> u64 {
    (seconds - EPSILON).ceil().max(0.0) as u64
}

fn floor_units(level: f64) -> u64 {
    (level + EPSILON).floor().max(0.0) as u64
}

/// Run one check for `key` under `config`, charging `cost` units.
///
/// `prefix` namespaces the store keys; `now` is the single clock reading used
/// for all arithmetic in this check.
pub async fn check(
    store: &dyn RateLimitStore,
    prefix: &str,
    key: &RateLimitKey,
    config: &RateLimitConfig,
    cost: u64,
    now: f64,
) -> Result<Decision> {
    let store_key = key.store_key(prefix, config.strategy);

    trace!(
        key = %key,
        strategy = %config.strategy,
        cost = cost,
        "Checking rate limit"
    );

    match config.strategy {
        Strategy::FixedWindow => {
            let limit = config.max_requests;
            let start = window_start(now, config.window_seconds);
            let window_key = format!("{}:{}", store_key, start);

            let outcome = store
                .fixed_window(&window_key, cost, limit, now, config.window_seconds)
                .await?;

            let reset_at = start + config.window_seconds;
            let remaining = limit.saturating_sub(outcome.count);
            if outcome.admitted {
                Ok(Decision::allow(limit, remaining, reset_at))
            } else {
                let retry_after = reset_at.saturating_sub(now.floor() as u64);
                Ok(Decision::deny(limit, remaining, reset_at, retry_after))
            }
        }
        Strategy::SlidingWindow => {
            let limit = config.max_requests;
            let window = config.window_seconds as f64;

            let outcome = store
                .sliding_window(&store_key, cost, limit, window, now, config.window_seconds)
                .await?;

            let reset_at = outcome.oldest.map_or(now + window, |oldest| oldest + window);
            let remaining = limit.saturating_sub(outcome.count);
            if outcome.admitted {
                Ok(Decision::allow(limit, remaining, ceil_secs(reset_at)))
            } else {
                let retry_after = ceil_secs(reset_at - now);
                Ok(Decision::deny(limit, remaining, ceil_secs(reset_at), retry_after))
            }
        }
        Strategy::TokenBucket => {
            let limit = config.burst_capacity();
            let capacity = limit as f64;
            let rate = config.refill_rate();

            let outcome = store
                .token_bucket(&store_key, cost as f64, capacity, rate, now, bucket_ttl(config))
                .await?;

            let until_full = (capacity - outcome.level).max(0.0) / rate;
            let reset_at = ceil_secs(now + until_full);
            let remaining = floor_units(outcome.level);
            if outcome.admitted {
                Ok(Decision::allow(limit, remaining, reset_at))
            } else {
                let retry_after = ceil_secs((cost as f64 - outcome.level) / rate);
                Ok(Decision::deny(limit, remaining, reset_at, retry_after))
            }
        }
        Strategy::LeakyBucket => {
            let limit = config.burst_capacity();
            let capacity = limit as f64;
            let rate = config.refill_rate();

            let outcome = store
                .leaky_bucket(&store_key, cost as f64, capacity, rate, now, bucket_ttl(config))
                .await?;

            let until_empty = outcome.level / rate;
            let reset_at = ceil_secs(now + until_empty);
            let remaining = floor_units(capacity - outcome.level);
            if outcome.admitted {
                Ok(Decision::allow(limit, remaining, reset_at))
            } else {
                let overflow = outcome.level + cost as f64 - capacity;
                let retry_after = ceil_secs(overflow / rate);
                Ok(Decision::deny(limit, remaining, reset_at, retry_after))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::memory::MemoryStore;

    const T0: f64 = 1_700_000_040.0; // aligned to a 60s window

    fn key() -> RateLimitKey {
        RateLimitKey::new("user:42", "/api/v1/auth/login")
    }

    async fn run(
        store: &MemoryStore,
        config: &RateLimitConfig,
        cost: u64,
        now: f64,
    ) -> Decision {
        check(store, "test:", &key(), config, cost, now).await.unwrap()
    }

    #[test]
    fn test_fixed_window_step_rolls_back_on_denial() {
        assert_eq!(
            fixed_window_step(4, 1, 5),
            CounterOutcome { admitted: true, count: 5 }
        );
        assert_eq!(
            fixed_window_step(5, 1, 5),
            CounterOutcome { admitted: false, count: 5 }
        );
        assert_eq!(
            fixed_window_step(3, 5, 5),
            CounterOutcome { admitted: false, count: 3 }
        );
    }

    #[test]
    fn test_sliding_window_step_prunes_and_inserts_cost_entries() {
        let mut log = VecDeque::from(vec![10.0, 20.0, 30.0]);
        let outcome = sliding_window_step(&mut log, 2, 5, 15.0, 36.0);

        assert!(outcome.admitted);
        assert_eq!(outcome.count, 3);
        assert_eq!(outcome.oldest, Some(30.0));
        assert_eq!(log, VecDeque::from(vec![30.0, 36.0, 36.0]));

        let outcome = sliding_window_step(&mut log, 3, 5, 15.0, 36.0);
        assert!(!outcome.admitted);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_token_bucket_step_clamps_negative_elapsed() {
        let state = BucketSnapshot { level: 2.0, updated_at: 100.0 };
        let (snapshot, outcome) = token_bucket_step(Some(state), 1.0, 10.0, 1.0, 90.0);

        assert!(outcome.admitted);
        assert_eq!(outcome.level, 1.0);
        // The stored timestamp never moves backwards
        assert_eq!(snapshot.updated_at, 100.0);
    }

    #[test]
    fn test_leaky_bucket_step_clamps_negative_elapsed() {
        let state = BucketSnapshot { level: 5.0, updated_at: 100.0 };
        let (snapshot, outcome) = leaky_bucket_step(Some(state), 1.0, 10.0, 1.0, 50.0);

        assert!(outcome.admitted);
        assert_eq!(outcome.level, 6.0);
        assert_eq!(snapshot.updated_at, 100.0);
    }

    #[test]
    fn test_window_start_alignment() {
        assert_eq!(window_start(125.7, 60), 120);
        assert_eq!(window_start(120.0, 60), 120);
        assert_eq!(window_start(119.9, 60), 60);
    }

    #[test]
    fn test_bucket_ttl_covers_recovery_time() {
        let config = RateLimitConfig::new(10, 5, Strategy::TokenBucket).with_refill_rate(0.5);
        assert_eq!(bucket_ttl(&config), 20);

        let config = RateLimitConfig::new(10, 60, Strategy::LeakyBucket).with_refill_rate(5.0);
        assert_eq!(bucket_ttl(&config), 60);
    }

    #[tokio::test]
    async fn test_fixed_window_login_scenario() {
        let store = MemoryStore::new();
        let config = RateLimitConfig::new(5, 60, Strategy::FixedWindow);

        let mut remaining = Vec::new();
        for i in 0..5 {
            let decision = run(&store, &config, 1, T0 + i as f64).await;
            assert!(decision.allowed, "request {} should be admitted", i + 1);
            remaining.push(decision.remaining);
        }
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        let decision = run(&store, &config, 1, T0 + 10.0).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset_at, T0 as u64 + 60);
        let retry_after = decision.retry_after.unwrap();
        assert!(retry_after <= 60);
        assert_eq!(retry_after, 50);
    }

    #[tokio::test]
    async fn test_fixed_window_boundary_burst_is_preserved() {
        let store = MemoryStore::new();
        let config = RateLimitConfig::new(5, 60, Strategy::FixedWindow);

        // Last instant of window N
        for _ in 0..5 {
            assert!(run(&store, &config, 1, T0 + 59.999).await.allowed);
        }
        // First instant of window N+1
        for _ in 0..5 {
            assert!(run(&store, &config, 1, T0 + 60.0).await.allowed);
        }
        assert!(!run(&store, &config, 1, T0 + 60.0).await.allowed);
    }

    #[tokio::test]
    async fn test_fixed_window_denial_is_idempotent() {
        let store = MemoryStore::new();
        let config = RateLimitConfig::new(2, 60, Strategy::FixedWindow);

        run(&store, &config, 1, T0).await;
        run(&store, &config, 1, T0).await;

        let first = run(&store, &config, 1, T0 + 1.0).await;
        let second = run(&store, &config, 1, T0 + 1.0).await;
        assert_eq!(first, second);
        assert!(!first.allowed);

        // A denied heavy request leaves room that a light one can still use
        let store = MemoryStore::new();
        let config = RateLimitConfig::new(5, 60, Strategy::FixedWindow);
        run(&store, &config, 3, T0).await;
        assert!(!run(&store, &config, 3, T0).await.allowed);
        let decision = run(&store, &config, 2, T0).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_sliding_window_expires_old_entries() {
        let store = MemoryStore::new();
        let config = RateLimitConfig::new(3, 10, Strategy::SlidingWindow);

        for _ in 0..3 {
            assert!(run(&store, &config, 1, T0).await.allowed);
        }

        let denied = run(&store, &config, 1, T0 + 5.0).await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(5));
        assert_eq!(denied.reset_at, T0 as u64 + 10);

        let admitted = run(&store, &config, 1, T0 + 10.001).await;
        assert!(admitted.allowed);
        assert_eq!(admitted.remaining, 2);
    }

    #[tokio::test]
    async fn test_sliding_window_has_no_boundary_burst() {
        let store = MemoryStore::new();
        let config = RateLimitConfig::new(5, 60, Strategy::SlidingWindow);

        for _ in 0..5 {
            assert!(run(&store, &config, 1, T0 + 59.9).await.allowed);
        }
        assert!(!run(&store, &config, 1, T0 + 60.0).await.allowed);
    }

    #[tokio::test]
    async fn test_sliding_window_weighted_cost() {
        let store = MemoryStore::new();
        let config = RateLimitConfig::new(10, 60, Strategy::SlidingWindow);

        let decision = run(&store, &config, 5, T0).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 5);

        assert!(run(&store, &config, 5, T0 + 1.0).await.allowed);
        let denied = run(&store, &config, 1, T0 + 2.0).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
    }

    #[tokio::test]
    async fn test_token_bucket_scenario() {
        let store = MemoryStore::new();
        let config = RateLimitConfig::new(10, 10, Strategy::TokenBucket)
            .with_burst_capacity(10)
            .with_refill_rate(1.0);

        for i in 0..10 {
            let decision = run(&store, &config, 1, T0).await;
            assert!(decision.allowed, "burst request {} should be admitted", i + 1);
            assert_eq!(decision.remaining, 9 - i);
        }

        let denied = run(&store, &config, 1, T0).await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(1));

        let admitted = run(&store, &config, 1, T0 + 1.0).await;
        assert!(admitted.allowed);
    }

    #[tokio::test]
    async fn test_token_bucket_fractional_refill_rate() {
        let store = MemoryStore::new();
        let config = RateLimitConfig::new(4, 24, Strategy::TokenBucket);
        let rate = config.refill_rate();

        run(&store, &config, 4, T0).await;
        assert!(!run(&store, &config, 1, T0).await.allowed);
        assert!(run(&store, &config, 1, T0 + 1.0 / rate).await.allowed);
    }

    #[tokio::test]
    async fn test_token_bucket_refill_never_exceeds_capacity() {
        let store = MemoryStore::new();
        let config = RateLimitConfig::new(5, 5, Strategy::TokenBucket);

        run(&store, &config, 1, T0).await;
        let decision = run(&store, &config, 1, T0 + 3600.0).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
        assert!(decision.remaining <= decision.limit);
    }

    #[tokio::test]
    async fn test_leaky_bucket_burst_then_leak() {
        let store = MemoryStore::new();
        let config = RateLimitConfig::new(10, 10, Strategy::LeakyBucket);

        for _ in 0..10 {
            assert!(run(&store, &config, 1, T0).await.allowed);
        }

        let denied = run(&store, &config, 1, T0).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after, Some(1));
        assert_eq!(denied.reset_at, T0 as u64 + 10);

        // Half a second leaks half a unit: still full
        assert!(!run(&store, &config, 1, T0 + 0.5).await.allowed);

        let admitted = run(&store, &config, 1, T0 + 1.0).await;
        assert!(admitted.allowed);
        assert_eq!(admitted.remaining, 0);

        let later = run(&store, &config, 3, T0 + 4.0).await;
        assert!(later.allowed);
    }

    #[tokio::test]
    async fn test_remaining_within_bounds_for_all_strategies() {
        let strategies = [
            Strategy::FixedWindow,
            Strategy::SlidingWindow,
            Strategy::TokenBucket,
            Strategy::LeakyBucket,
        ];

        for strategy in strategies {
            let store = MemoryStore::new();
            let config = RateLimitConfig::new(3, 6, strategy);
            for step in 0..20 {
                let now = T0 + step as f64 * 0.7;
                let cost = (step % 3) as u64 + 1;
                let decision = run(&store, &config, cost, now).await;
                assert!(decision.remaining <= decision.limit, "{:?}", strategy);
                assert_eq!(decision.retry_after.is_some(), !decision.allowed);
            }
        }
    }

    #[tokio::test]
    async fn test_bucket_denial_does_not_change_next_outcome() {
        for strategy in [Strategy::TokenBucket, Strategy::LeakyBucket] {
            let store = MemoryStore::new();
            let config = RateLimitConfig::new(2, 2, strategy);

            run(&store, &config, 2, T0).await;
            let first = run(&store, &config, 1, T0 + 0.2).await;
            let second = run(&store, &config, 1, T0 + 0.2).await;
            assert!(!first.allowed);
            assert_eq!(first, second);
        }
    }
}
