//! Rate limiting engine: rule resolution, caller identity, the four
//! strategies and the stores they run against.

mod clock;
mod cost;
mod decision;
mod identity;
mod key;
mod limiter;
mod memory;
#[cfg(feature = "redis")]
mod redis_store;
mod rules;
mod store;
pub mod strategy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cost::{CostEstimator, CostRule, DEFAULT_COST};
pub use decision::Decision;
pub use identity::{
    hash_api_key, ClientIdentifier, Identity, JwtVerifier, TokenVerifier, VerifiedClaims,
    API_KEY_HEADER, FORWARDED_FOR_HEADER,
};
pub use key::RateLimitKey;
pub use limiter::{RateLimiter, RequestContext, DEFAULT_KEY_PREFIX, DEFAULT_STORE_TIMEOUT};
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
pub use rules::{
    normalize_path, CallerClass, ConfigResolver, EndpointRule, RateLimitConfig, ResolvedRoute,
    RulesConfig, Strategy,
};
pub use store::{FailurePolicy, RateLimitStore};
