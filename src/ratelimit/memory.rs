//! In-process rate limit store.
//!
//! Suitable for a single instance and for tests. Each step runs while holding
//! the dashmap shard lock for its key, which makes it atomic with respect to
//! every other check in this process.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use super::clock::Clock;
use super::store::RateLimitStore;
use super::strategy::{
    fixed_window_step, leaky_bucket_step, sliding_window_step, token_bucket_step, BucketOutcome,
    BucketSnapshot, CounterOutcome, LogOutcome,
};
use crate::error::Result;

#[derive(Debug, Clone)]
enum Entry {
    Vacant,
    Counter(u64),
    Log(VecDeque<f64>),
    Bucket(BucketSnapshot),
}

#[derive(Debug, Clone)]
struct Slot {
    entry: Entry,
    expires_at: f64,
}

impl Slot {
    fn is_expired(&self, now: f64) -> bool {
        self.expires_at <= now
    }
}

/// A rate limit store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry whose time-to-live has passed. Returns how many were
    /// removed.
    pub fn purge_expired(&self, now: f64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, slot| !slot.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Periodically purge expired entries on a background task.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = self.purge_expired(clock.now());
                if removed > 0 {
                    debug!(removed = removed, remaining = self.len(), "Purged expired rate limit entries");
                }
            }
        })
    }

    /// Run `step` on the live entry for `key` and refresh its time-to-live.
    fn update<R>(&self, key: &str, now: f64, ttl_secs: u64, step: impl FnOnce(&mut Entry) -> R) -> R {
        let mut slot = self.entries.entry(key.to_string()).or_insert_with(|| Slot {
            entry: Entry::Vacant,
            expires_at: now,
        });
        if slot.is_expired(now) {
            slot.entry = Entry::Vacant;
        }

        let result = step(&mut slot.entry);
        slot.expires_at = now + ttl_secs as f64;
        result
    }

    fn fixed_window_sync(&self, key: &str, cost: u64, limit: u64, now: f64, ttl_secs: u64) -> CounterOutcome {
        self.update(key, now, ttl_secs, |entry| {
            let current = match entry {
                Entry::Counter(count) => *count,
                _ => 0,
            };
            let outcome = fixed_window_step(current, cost, limit);
            *entry = Entry::Counter(outcome.count);
            outcome
        })
    }

    fn sliding_window_sync(
        &self,
        key: &str,
        cost: u64,
        limit: u64,
        window_secs: f64,
        now: f64,
        ttl_secs: u64,
    ) -> LogOutcome {
        self.update(key, now, ttl_secs, |entry| {
            let mut log = match std::mem::replace(entry, Entry::Vacant) {
                Entry::Log(log) => log,
                _ => VecDeque::new(),
            };
            let outcome = sliding_window_step(&mut log, cost, limit, window_secs, now);
            *entry = Entry::Log(log);
            outcome
        })
    }

    fn bucket_sync(
        &self,
        key: &str,
        now: f64,
        ttl_secs: u64,
        step: impl FnOnce(Option<BucketSnapshot>) -> (BucketSnapshot, BucketOutcome),
    ) -> BucketOutcome {
        self.update(key, now, ttl_secs, |entry| {
            let state = match entry {
                Entry::Bucket(snapshot) => Some(*snapshot),
                _ => None,
            };
            let (snapshot, outcome) = step(state);
            *entry = Entry::Bucket(snapshot);
            outcome
        })
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn fixed_window(
        &self,
        key: &str,
        cost: u64,
        limit: u64,
        now: f64,
        ttl_secs: u64,
    ) -> Result<CounterOutcome> {
        Ok(self.fixed_window_sync(key, cost, limit, now, ttl_secs))
    }

    async fn sliding_window(
        &self,
        key: &str,
        cost: u64,
        limit: u64,
        window_secs: f64,
        now: f64,
        ttl_secs: u64,
    ) -> Result<LogOutcome> {
        Ok(self.sliding_window_sync(key, cost, limit, window_secs, now, ttl_secs))
    }

    async fn token_bucket(
        &self,
        key: &str,
        cost: f64,
        capacity: f64,
        rate: f64,
        now: f64,
        ttl_secs: u64,
    ) -> Result<BucketOutcome> {
        Ok(self.bucket_sync(key, now, ttl_secs, |state| {
            token_bucket_step(state, cost, capacity, rate, now)
        }))
    }

    async fn leaky_bucket(
        &self,
        key: &str,
        cost: f64,
        capacity: f64,
        rate: f64,
        now: f64,
        ttl_secs: u64,
    ) -> Result<BucketOutcome> {
        Ok(self.bucket_sync(key, now, ttl_secs, |state| {
            leaky_bucket_step(state, cost, capacity, rate, now)
        }))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
