//! HTTP integration: the rate limit middleware and a server that hosts it.

pub mod middleware;
mod server;

pub use middleware::{RateLimitLayer, RateLimitService, DEFAULT_HEALTH_PATHS};
pub use server::HttpServer;
