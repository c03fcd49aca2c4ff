//! Rate limit orchestration.

use axum::http::HeaderMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};
use super::cost::CostEstimator;
use super::decision::Decision;
use super::identity::ClientIdentifier;
use super::key::RateLimitKey;
use super::rules::{normalize_path, ConfigResolver, RateLimitConfig, RulesConfig};
use super::store::{FailurePolicy, RateLimitStore};
use super::strategy;
use crate::error::{RateWardenError, Result};

/// Default namespace for store keys.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit:";
/// Default bound on a single store round-trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(100);

/// The parts of an inbound request the limiter looks at.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    /// Route path, without query string
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    /// Transport-level peer address
    pub peer: Option<IpAddr>,
}

/// Composes config resolution, caller identification, cost estimation and the
/// configured strategy into a single [`Decision`] per request.
///
/// Holds no counting state: all of it lives in the shared store.
pub struct RateLimiter {
    resolver: ConfigResolver,
    identifier: ClientIdentifier,
    costs: CostEstimator,
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    timeout: Duration,
    failure_policy: FailurePolicy,
    /// Checks that fell back to the failure policy
    store_failures: AtomicU64,
}

impl RateLimiter {
    /// Create a rate limiter over `store`, validating `rules` first.
    pub fn new(rules: &RulesConfig, store: Arc<dyn RateLimitStore>) -> Result<Self> {
        Ok(Self {
            resolver: ConfigResolver::new(rules)?,
            identifier: ClientIdentifier::new(),
            costs: CostEstimator::new(&rules.costs),
            store,
            clock: Arc::new(SystemClock::new()),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            timeout: DEFAULT_STORE_TIMEOUT,
            failure_policy: FailurePolicy::default(),
            store_failures: AtomicU64::new(0),
        })
    }

    pub fn with_identifier(mut self, identifier: ClientIdentifier) -> Self {
        self.identifier = identifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Decide whether `request` may proceed.
    ///
    /// Never fails: store errors and timeouts resolve through the configured
    /// failure policy.
    pub async fn decide(&self, request: &RequestContext<'_>) -> Decision {
        let identity = self.identifier.identify(request.headers, request.peer);
        let path = normalize_path(request.path);
        let resolved = self.resolver.resolve_route(&path, identity.caller_class);
        let cost = self.costs.cost(&path);
        let key = RateLimitKey::new(&identity.id, &resolved.route);

        self.check(key, resolved.limit, cost).await
    }

    /// Charge `cost` units against `key` under `config`.
    pub async fn check(&self, key: RateLimitKey, config: RateLimitConfig, cost: u64) -> Decision {
        let now = self.clock.now();

        // Spawned so the store step completes even if the caller goes away
        // or the timeout below fires first.
        let store = self.store.clone();
        let prefix = self.key_prefix.clone();
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            strategy::check(store.as_ref(), &prefix, &task_key, &config, cost, now).await
        });

        let result = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(RateWardenError::Store(format!("store task failed: {}", e))),
            Err(_) => Err(RateWardenError::Timeout(self.timeout)),
        };

        match result {
            Ok(decision) => {
                if !decision.allowed {
                    debug!(
                        key = %key,
                        strategy = %config.strategy,
                        limit = decision.limit,
                        retry_after = ?decision.retry_after,
                        "Rate limit exceeded"
                    );
                }
                decision
            }
            Err(e) => self.fall_back(&key, &config, now, &e),
        }
    }

    fn fall_back(
        &self,
        key: &RateLimitKey,
        config: &RateLimitConfig,
        now: f64,
        error: &RateWardenError,
    ) -> Decision {
        let failures = self.store_failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            key = %key,
            store = self.store.name(),
            policy = ?self.failure_policy,
            failures = failures,
            error = %error,
            "Rate limit store unavailable, applying failure policy"
        );

        let limit = config.limit();
        let reset_at = now.max(0.0).floor() as u64 + config.window_seconds;
        match self.failure_policy {
            FailurePolicy::Open => Decision::allow(limit, limit, reset_at),
            FailurePolicy::Closed => Decision::deny(limit, 0, reset_at, config.window_seconds),
        }
    }

    /// Number of checks that could not reach the store.
    pub fn store_failures(&self) -> u64 {
        self.store_failures.load(Ordering::Relaxed)
    }

    pub fn resolver(&self) -> &ConfigResolver {
        &self.resolver
    }

    pub fn store(&self) -> &Arc<dyn RateLimitStore> {
        &self.store
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &self.store.name())
            .field("key_prefix", &self.key_prefix)
            .field("timeout", &self.timeout)
            .field("failure_policy", &self.failure_policy)
            .finish()
    }
}
