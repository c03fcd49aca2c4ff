//! Rate limit rules configuration and route resolution.
//!
//! Rules are two static lookup tables (route pattern -> limit and caller
//! class -> limit) plus a global default. They are loaded once at startup,
//! validated, and only read afterwards.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

use super::cost::CostRule;
use crate::error::{RateWardenError, Result};

/// Counting algorithm applied to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Epoch-aligned counter per window
    FixedWindow,
    /// Exact trailing window over a log of request timestamps
    SlidingWindow,
    /// Refilling token reservoir that permits bursts
    TokenBucket,
    /// Draining reservoir that smooths bursts into a constant outflow
    LeakyBucket,
}

impl Strategy {
    /// Short stable tag used in store keys and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::FixedWindow => "fixed_window",
            Strategy::SlidingWindow => "sliding_window",
            Strategy::TokenBucket => "token_bucket",
            Strategy::LeakyBucket => "leaky_bucket",
        }
    }

    /// Whether the strategy is parameterised by burst capacity and refill rate.
    pub fn is_bucket(&self) -> bool {
        matches!(self, Strategy::TokenBucket | Strategy::LeakyBucket)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Class of caller, used to pick elevated limits for trusted callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallerClass {
    Admin,
    Service,
    Guest,
    Regular,
}

impl CallerClass {
    /// Map a verified role claim to a caller class.
    pub fn from_role(role: &str) -> Self {
        match role.to_ascii_lowercase().as_str() {
            "admin" => CallerClass::Admin,
            "service" => CallerClass::Service,
            _ => CallerClass::Regular,
        }
    }

    /// Only trusted classes may carry their own limits.
    pub fn is_trusted(&self) -> bool {
        matches!(self, CallerClass::Admin | CallerClass::Service)
    }
}

/// A resolved rate limit: how many requests per window and how to count them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests (cost units) allowed per window
    pub max_requests: u64,
    /// Window length in seconds
    pub window_seconds: u64,
    /// Counting algorithm
    #[serde(default = "default_strategy")]
    pub strategy: Strategy,
    /// Bucket size; defaults to `max_requests`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_capacity: Option<u64>,
    /// Units per second a bucket refills (token) or drains (leaky);
    /// defaults to `max_requests / window_seconds`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refill_rate: Option<f64>,
}

fn default_strategy() -> Strategy {
    Strategy::SlidingWindow
}

impl RateLimitConfig {
    pub fn new(max_requests: u64, window_seconds: u64, strategy: Strategy) -> Self {
        Self {
            max_requests,
            window_seconds,
            strategy,
            burst_capacity: None,
            refill_rate: None,
        }
    }

    pub fn with_burst_capacity(mut self, burst_capacity: u64) -> Self {
        self.burst_capacity = Some(burst_capacity);
        self
    }

    pub fn with_refill_rate(mut self, refill_rate: f64) -> Self {
        self.refill_rate = Some(refill_rate);
        self
    }

    /// Effective burst capacity.
    pub fn burst_capacity(&self) -> u64 {
        self.burst_capacity.unwrap_or(self.max_requests)
    }

    /// Effective refill (or leak) rate in units per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
            .unwrap_or_else(|| self.max_requests as f64 / self.window_seconds.max(1) as f64)
    }

    /// The quota reported to callers as `X-RateLimit-Limit`.
    pub fn limit(&self) -> u64 {
        if self.strategy.is_bucket() {
            self.burst_capacity()
        } else {
            self.max_requests
        }
    }

    /// Check the invariants every resolved config must hold.
    pub fn validate(&self, context: &str) -> Result<()> {
        if self.max_requests == 0 {
            return Err(RateWardenError::Config(format!(
                "{}: max_requests must be greater than 0",
                context
            )));
        }
        if self.window_seconds == 0 {
            return Err(RateWardenError::Config(format!(
                "{}: window_seconds must be greater than 0",
                context
            )));
        }
        if self.strategy.is_bucket() {
            let rate = self.refill_rate();
            if !rate.is_finite() || rate <= 0.0 {
                return Err(RateWardenError::Config(format!(
                    "{}: refill_rate must be a positive number for {}, got {}",
                    context, self.strategy, rate
                )));
            }
        }
        Ok(())
    }
}

/// A route pattern and the limit that applies to it.
///
/// A pattern ending in `/*` matches everything below its prefix. A plain
/// pattern matches itself exactly and, failing an exact hit elsewhere, any
/// path below it at a `/` boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRule {
    pub pattern: String,
    #[serde(flatten)]
    pub limit: RateLimitConfig,
}

impl EndpointRule {
    pub fn new(pattern: &str, limit: RateLimitConfig) -> Self {
        Self {
            pattern: pattern.to_string(),
            limit,
        }
    }
}

/// The complete rule set: endpoint table, caller-class table, default, and
/// request cost weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Applies when nothing else matches
    #[serde(default = "default_limit")]
    pub default: RateLimitConfig,
    /// Route pattern table
    #[serde(default)]
    pub endpoints: Vec<EndpointRule>,
    /// Elevated limits for trusted caller classes
    #[serde(default)]
    pub caller_classes: HashMap<CallerClass, RateLimitConfig>,
    /// Route prefixes whose requests cost more than one unit
    #[serde(default)]
    pub costs: Vec<CostRule>,
}

fn default_limit() -> RateLimitConfig {
    RateLimitConfig::new(100, 60, Strategy::SlidingWindow)
}

impl Default for RulesConfig {
    fn default() -> Self {
        let endpoints = vec![
            EndpointRule::new(
                "/api/v1/auth/login",
                RateLimitConfig::new(5, 60, Strategy::FixedWindow),
            ),
            EndpointRule::new(
                "/api/v1/auth/refresh",
                RateLimitConfig::new(10, 60, Strategy::FixedWindow),
            ),
            EndpointRule::new(
                "/api/v1/auth/password-reset",
                RateLimitConfig::new(3, 300, Strategy::FixedWindow),
            ),
            EndpointRule::new(
                "/api/v1/bulk/*",
                RateLimitConfig::new(10, 60, Strategy::TokenBucket).with_burst_capacity(20),
            ),
            EndpointRule::new(
                "/api/v1/reports/*",
                RateLimitConfig::new(30, 60, Strategy::LeakyBucket),
            ),
            EndpointRule::new(
                "/api/v1/integrations/*",
                RateLimitConfig::new(60, 60, Strategy::TokenBucket),
            ),
        ];

        let mut caller_classes = HashMap::new();
        caller_classes.insert(
            CallerClass::Admin,
            RateLimitConfig::new(10_000, 60, Strategy::TokenBucket),
        );
        caller_classes.insert(
            CallerClass::Service,
            RateLimitConfig::new(100_000, 60, Strategy::TokenBucket),
        );

        Self {
            default: default_limit(),
            endpoints,
            caller_classes,
            costs: CostRule::defaults(),
        }
    }
}

impl RulesConfig {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: RulesConfig = serde_yaml::from_str(yaml).map_err(|e| {
            RateWardenError::Config(format!("Failed to parse rate limit rules: {}", e))
        })?;
        rules.validate()?;
        Ok(rules)
    }

    /// Reject malformed tables before any request is counted against them.
    pub fn validate(&self) -> Result<()> {
        self.default.validate("default")?;

        let mut seen = std::collections::HashSet::new();
        for rule in &self.endpoints {
            if !rule.pattern.starts_with('/') {
                return Err(RateWardenError::Config(format!(
                    "endpoint pattern '{}' must start with '/'",
                    rule.pattern
                )));
            }
            if !seen.insert(rule.pattern.as_str()) {
                return Err(RateWardenError::Config(format!(
                    "endpoint pattern '{}' is defined more than once",
                    rule.pattern
                )));
            }
            rule.limit.validate(&rule.pattern)?;
        }

        for (class, limit) in &self.caller_classes {
            if !class.is_trusted() {
                return Err(RateWardenError::Config(format!(
                    "caller class {:?} cannot carry its own limit; only admin and service can",
                    class
                )));
            }
            limit.validate(&format!("caller class {:?}", class))?;
        }

        for cost in &self.costs {
            cost.validate()?;
        }

        Ok(())
    }
}

/// A prefix entry in the resolver's longest-match table.
#[derive(Debug, Clone)]
struct PrefixEntry {
    /// Rule pattern as configured, used as the counting route
    pattern: String,
    prefix: String,
    wildcard: bool,
    limit: RateLimitConfig,
}

impl PrefixEntry {
    fn matches(&self, path: &str) -> bool {
        if self.wildcard {
            // "/a/b/*" covers "/a/b" itself as well as everything below it
            path.starts_with(&self.prefix) || path == self.prefix.trim_end_matches('/')
        } else {
            path.strip_prefix(self.prefix.as_str())
                .map(|rest| rest.starts_with('/'))
                .unwrap_or(false)
        }
    }
}

/// The limit governing a request and the route its usage is counted under.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRoute {
    /// The matched endpoint pattern, or the normalized path when no endpoint
    /// rule applies
    pub route: String,
    pub limit: RateLimitConfig,
}

/// Maps a route and caller class to the limit that governs it.
///
/// Resolution order, first match wins: exact route, longest route prefix,
/// trusted caller class, global default.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    exact: HashMap<String, RateLimitConfig>,
    prefixes: Vec<PrefixEntry>,
    caller_classes: HashMap<CallerClass, RateLimitConfig>,
    default: RateLimitConfig,
}

impl ConfigResolver {
    /// Build a resolver, validating the rules first.
    pub fn new(rules: &RulesConfig) -> Result<Self> {
        rules.validate()?;

        let mut exact = HashMap::new();
        let mut prefixes = Vec::new();

        for rule in &rules.endpoints {
            match rule.pattern.strip_suffix('*') {
                Some(prefix) => prefixes.push(PrefixEntry {
                    pattern: rule.pattern.clone(),
                    prefix: prefix.to_string(),
                    wildcard: true,
                    limit: rule.limit,
                }),
                None => {
                    let pattern = normalize_path(&rule.pattern).into_owned();
                    exact.insert(pattern.clone(), rule.limit);
                    prefixes.push(PrefixEntry {
                        pattern: pattern.clone(),
                        prefix: pattern,
                        wildcard: false,
                        limit: rule.limit,
                    });
                }
            }
        }

        prefixes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        debug!(
            exact = exact.len(),
            prefixes = prefixes.len(),
            caller_classes = rules.caller_classes.len(),
            "Rate limit resolver built"
        );

        Ok(Self {
            exact,
            prefixes,
            caller_classes: rules.caller_classes.clone(),
            default: rules.default,
        })
    }

    /// Resolve the limit for a route and caller class. Never fails.
    pub fn resolve(&self, path: &str, caller: CallerClass) -> RateLimitConfig {
        self.resolve_route(path, caller).limit
    }

    /// Resolve the limit together with the route it is counted under.
    ///
    /// Every spelling of a path that resolves through the same endpoint rule
    /// yields the same route, so they share one quota.
    pub fn resolve_route(&self, path: &str, caller: CallerClass) -> ResolvedRoute {
        let path = normalize_path(path);

        if let Some((pattern, limit)) = self.exact.get_key_value(&*path) {
            return ResolvedRoute {
                route: pattern.clone(),
                limit: *limit,
            };
        }

        if let Some(entry) = self.prefixes.iter().find(|e| e.matches(&path)) {
            return ResolvedRoute {
                route: entry.pattern.clone(),
                limit: entry.limit,
            };
        }

        let limit = match self.caller_classes.get(&caller) {
            Some(limit) if caller.is_trusted() => *limit,
            _ => self.default,
        };
        ResolvedRoute {
            route: path.into_owned(),
            limit,
        }
    }

    /// The global default limit.
    pub fn default_limit(&self) -> RateLimitConfig {
        self.default
    }
}

/// Canonical spelling of a route: repeated slashes collapsed and trailing
/// slashes dropped, so `/a//b/` and `/a/b` are the same route.
pub fn normalize_path(path: &str) -> Cow<'_, str> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Cow::Borrowed("/");
    }
    if !trimmed.contains("//") {
        return Cow::Borrowed(trimmed);
    }

    let mut normalized = String::with_capacity(trimmed.len());
    let mut previous_slash = false;
    for c in trimmed.chars() {
        if c == '/' && previous_slash {
            continue;
        }
        previous_slash = c == '/';
        normalized.push(c);
    }
    Cow::Owned(normalized)
}
