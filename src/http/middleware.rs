//! tower middleware that runs every request through the [`RateLimiter`].

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{instrument, trace};

use crate::ratelimit::{normalize_path, Decision, RateLimiter, RequestContext};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Paths that are never rate limited unless configured otherwise.
pub const DEFAULT_HEALTH_PATHS: [&str; 3] = ["/health", "/health/live", "/health/ready"];

fn bypass_set<I, P>(paths: I) -> Arc<HashSet<String>>
where
    I: IntoIterator<Item = P>,
    P: AsRef<str>,
{
    Arc::new(
        paths
            .into_iter()
            .map(|p| normalize_path(p.as_ref()).into_owned())
            .collect(),
    )
}

/// Applies rate limiting to every request of the wrapped service.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
    bypass: Arc<HashSet<String>>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            bypass: bypass_set(DEFAULT_HEALTH_PATHS),
        }
    }

    /// Replace the set of paths that skip rate limiting. Matching ignores
    /// trailing and repeated slashes.
    pub fn with_health_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        self.bypass = bypass_set(paths);
        self
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            bypass: self.bypass.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
    bypass: Arc<HashSet<String>>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        // Take the service that was polled ready, leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if self.bypass.contains(&*normalize_path(request.uri().path())) {
            return Box::pin(inner.call(request));
        }

        let limiter = self.limiter.clone();
        Box::pin(async move {
            let peer = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip());
            let decision = {
                let context = RequestContext {
                    path: request.uri().path(),
                    headers: request.headers(),
                    peer,
                };
                check_request(&limiter, &context).await
            };

            if !decision.allowed {
                return Ok(too_many_requests(&decision));
            }

            let mut response = inner.call(request).await?;
            apply_headers(response.headers_mut(), &decision);
            Ok(response)
        })
    }
}

#[instrument(level = "debug", skip_all, fields(path = %request.path))]
async fn check_request(limiter: &RateLimiter, request: &RequestContext<'_>) -> Decision {
    let decision = limiter.decide(request).await;
    trace!(
        allowed = decision.allowed,
        limit = decision.limit,
        remaining = decision.remaining,
        "Rate limit decision"
    );
    decision
}

/// Attach the quota headers for `decision`.
pub fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at));
}

/// The 429 response for a denied request.
pub fn too_many_requests(decision: &Decision) -> Response {
    let retry_after = decision.retry_after.unwrap_or(1).max(1);
    let body = serde_json::json!({
        "error": "rate_limit_exceeded",
        "message": format!("Too many requests. Retry after {} seconds.", retry_after),
        "limit": decision.limit,
        "remaining": decision.remaining,
        "reset": decision.reset_at,
        "retry_after": retry_after,
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, axum::Json(body)).into_response();
    let headers = response.headers_mut();
    apply_headers(headers, decision);
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ManualClock, MemoryStore, RulesConfig};
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    const T0: f64 = 1_700_000_040.0;

    fn app() -> Router {
        let limiter = RateLimiter::new(&RulesConfig::default(), Arc::new(MemoryStore::new()))
            .unwrap()
            .with_clock(Arc::new(ManualClock::new(T0)));

        Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/api/v1/auth/login", get(|| async { "welcome" }))
            .layer(RateLimitLayer::new(Arc::new(limiter)))
    }

    fn request(path: &str, peer: &str) -> Request<Body> {
        let mut request = Request::builder().uri(path).body(Body::empty()).unwrap();
        let addr: SocketAddr = format!("{}:40000", peer).parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        request
    }

    fn header(response: &Response, name: &HeaderName) -> u64 {
        response.headers()[name].to_str().unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn test_admitted_response_carries_headers() {
        let response = app()
            .oneshot(request("/api/v1/auth/login", "10.0.0.1"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, &X_RATELIMIT_LIMIT), 5);
        assert_eq!(header(&response, &X_RATELIMIT_REMAINING), 4);
        assert!(header(&response, &X_RATELIMIT_RESET) >= T0 as u64);
        assert!(response.headers().get(RETRY_AFTER).is_none());
    }

    #[tokio::test]
    async fn test_denied_request_short_circuits_with_429() {
        let app = app();
        for _ in 0..5 {
            let response = app
                .clone()
                .oneshot(request("/api/v1/auth/login", "10.0.0.2"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .clone()
            .oneshot(request("/api/v1/auth/login", "10.0.0.2"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&response, &X_RATELIMIT_REMAINING), 0);

        let retry_after = header(&response, &RETRY_AFTER);
        assert!((1..=60).contains(&retry_after));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "rate_limit_exceeded");
        assert_eq!(json["limit"], 5);
        assert_eq!(json["remaining"], 0);
        assert_eq!(json["retry_after"], retry_after);
        assert!(json["reset"].as_u64().is_some());
        assert!(json["message"].as_str().is_some());

        // A different address has its own quota
        let response = app
            .oneshot(request("/api/v1/auth/login", "10.0.0.3"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_paths_bypass() {
        let app = app();
        for _ in 0..200 {
            let response = app
                .clone()
                .oneshot(request("/health", "10.0.0.4"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get(X_RATELIMIT_LIMIT).is_none());
        }
    }

    #[tokio::test]
    async fn test_health_path_spellings_bypass() {
        let app = app();
        for path in ["/health/", "//health", "/health//"] {
            for _ in 0..200 {
                let response = app.clone().oneshot(request(path, "10.0.0.5")).await.unwrap();
                assert_ne!(response.status(), StatusCode::TOO_MANY_REQUESTS, "{}", path);
                assert!(response.headers().get(X_RATELIMIT_LIMIT).is_none(), "{}", path);
            }
        }
    }

    #[tokio::test]
    async fn test_configured_health_paths_are_normalized() {
        let limiter = RateLimiter::new(&RulesConfig::default(), Arc::new(MemoryStore::new())).unwrap();
        let app = Router::new()
            .route("/livez", get(|| async { "ok" }))
            .layer(RateLimitLayer::new(Arc::new(limiter)).with_health_paths(["/livez/"]));

        let response = app.oneshot(request("/livez", "10.0.0.6")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(X_RATELIMIT_LIMIT).is_none());
    }

    #[test]
    fn test_too_many_requests_floors_retry_after() {
        let decision = Decision {
            allowed: false,
            limit: 10,
            remaining: 0,
            reset_at: 1_700_000_060,
            retry_after: None,
        };
        let response = too_many_requests(&decision);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "1");
        assert_eq!(response.headers()[X_RATELIMIT_RESET], "1700000060");
    }
}
