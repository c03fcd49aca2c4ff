//! HTTP server hosting the rate limit middleware.

use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::middleware::{RateLimitLayer, DEFAULT_HEALTH_PATHS};
use crate::error::Result;
use crate::ratelimit::RateLimiter;

/// HTTP front end: health probes plus a rate limited catch-all.
pub struct HttpServer {
    addr: SocketAddr,
    limiter: Arc<RateLimiter>,
    health_paths: Vec<String>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, limiter: Arc<RateLimiter>) -> Self {
        Self {
            addr,
            limiter,
            health_paths: DEFAULT_HEALTH_PATHS.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn with_health_paths(mut self, paths: Vec<String>) -> Self {
        self.health_paths = paths;
        self
    }

    /// Build the router, with rate limiting applied to every route except the
    /// health probes.
    pub fn router(&self) -> Router {
        let mut router = Router::new();
        for path in &self.health_paths {
            router = router.route(path, get(health));
        }

        router
            .fallback(echo)
            .with_state(self.limiter.clone())
            .layer(RateLimitLayer::new(self.limiter.clone()).with_health_paths(self.health_paths.clone()))
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(
            addr = %listener.local_addr()?,
            store = self.limiter.store().name(),
            failure_policy = ?self.limiter.failure_policy(),
            "Starting HTTP server"
        );

        let app = self.router();
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(signal)
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }
}

async fn health(State(limiter): State<Arc<RateLimiter>>) -> Response {
    let store = limiter.store();
    match store.ping().await {
        Ok(()) => Json(serde_json::json!({
            "status": "ok",
            "store": store.name(),
            "store_failures": limiter.store_failures(),
        }))
        .into_response(),
        Err(e) => {
            warn!(store = store.name(), error = %e, "Store health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "degraded",
                    "store": store.name(),
                    "error": e.to_string(),
                    "failure_policy": limiter.failure_policy(),
                })),
            )
                .into_response()
        }
    }
}

async fn echo(uri: Uri) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "path": uri.path() }))
}
