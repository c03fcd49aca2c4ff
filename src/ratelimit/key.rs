//! Rate limit key generation.

use super::rules::Strategy;

/// A key that scopes rate limit state to one caller on one route.
///
/// Two requests share counting state if and only if their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Stable caller identity, e.g. `user:42` or `ip:10.0.0.1`
    pub client: String,
    /// The route the request was made against
    pub route: String,
}

impl RateLimitKey {
    /// Create a new key from a client identity and a route.
    pub fn new(client: &str, route: &str) -> Self {
        Self {
            client: client.to_string(),
            route: route.to_string(),
        }
    }

    /// Render the key as `client:route`.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.client, self.route)
    }

    /// The key a store entry is addressed by.
    ///
    /// The strategy tag keeps entries of different shapes apart, so at most
    /// one logical entry exists per key and strategy.
    pub fn store_key(&self, prefix: &str, strategy: Strategy) -> String {
        format!("{}{}:{}", prefix, strategy.as_str(), self.to_string_key())
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.client, self.route)
    }
}
