//! Configuration management for Ratewarden.
//!
//! Settings come from an optional YAML file layered with `RATEWARDEN__*`
//! environment variables, e.g. `RATEWARDEN__STORE__BACKEND=redis`.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RateWardenError, Result};
use crate::http::DEFAULT_HEALTH_PATHS;
use crate::ratelimit::{FailurePolicy, RulesConfig, DEFAULT_KEY_PREFIX};

/// Main configuration for the Ratewarden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Which store holds the shared counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local; only correct for a single instance
    #[default]
    Memory,
    Redis,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Namespace prepended to every store key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on a single store round-trip
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Outcome of a check when the store errors or times out
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// How often the memory backend drops expired entries
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            failure_policy: FailurePolicy::default(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_timeout_ms() -> u64 {
    100
}

fn default_sweep_interval() -> u64 {
    30
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Rules file; the built-in tables apply when unset
    pub rules_path: Option<String>,

    /// Paths that bypass rate limiting
    #[serde(default = "default_health_paths")]
    pub health_paths: Vec<String>,

    /// HMAC secret for bearer tokens; bearer tokens are ignored when unset
    pub jwt_secret: Option<String>,

    /// Required `iss` claim, if any
    pub jwt_issuer: Option<String>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            health_paths: default_health_paths(),
            jwt_secret: None,
            jwt_issuer: None,
        }
    }
}

fn default_health_paths() -> Vec<String> {
    DEFAULT_HEALTH_PATHS.iter().map(|p| p.to_string()).collect()
}

impl RateLimitingConfig {
    /// Load and validate the rule tables.
    pub fn load_rules(&self) -> Result<RulesConfig> {
        match &self.rules_path {
            Some(path) => RulesConfig::from_file(path),
            None => {
                info!("No rules file configured, using built-in rate limit rules");
                let rules = RulesConfig::default();
                rules.validate()?;
                Ok(rules)
            }
        }
    }
}

impl ServiceConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, environment())
    }

    fn load_with(path: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path).required(true));
        }

        let config: ServiceConfig = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(RateWardenError::Config(
                "store.timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.store.sweep_interval_secs == 0 {
            return Err(RateWardenError::Config(
                "store.sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        if let Some(path) = self
            .rate_limiting
            .health_paths
            .iter()
            .find(|p| !p.starts_with('/'))
        {
            return Err(RateWardenError::Config(format!(
                "health path '{}' must start with '/'",
                path
            )));
        }
        Ok(())
    }
}

fn environment() -> Environment {
    Environment::with_prefix("RATEWARDEN")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("rate_limiting.health_paths")
}
