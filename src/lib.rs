//! Ratewarden - Multi-Strategy Distributed Rate Limiting
//!
//! This crate decides, for each inbound HTTP request, whether it may proceed.
//! Limits are resolved per route and caller class, callers are identified by
//! verified token, API key or address, and requests are counted with one of
//! four strategies (fixed window, sliding window, token bucket, leaky bucket)
//! against a store shared by every instance of the service.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
