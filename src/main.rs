use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ratewarden::config::{ServiceConfig, StoreBackend};
use ratewarden::http::HttpServer;
use ratewarden::ratelimit::{
    ClientIdentifier, JwtVerifier, MemoryStore, RateLimitStore, RateLimiter, SystemClock,
};

/// Multi-strategy distributed rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "RATEWARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting Ratewarden Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = ServiceConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        backend = ?config.store.backend,
        "Configuration loaded"
    );

    let rules = config.rate_limiting.load_rules()?;
    info!(
        endpoints = rules.endpoints.len(),
        caller_classes = rules.caller_classes.len(),
        "Rate limit rules loaded"
    );

    let clock = Arc::new(SystemClock::new());
    let store = build_store(&config, clock.clone()).await?;

    let identifier = match &config.rate_limiting.jwt_secret {
        Some(secret) => {
            let mut verifier = JwtVerifier::new(secret.as_bytes());
            if let Some(issuer) = &config.rate_limiting.jwt_issuer {
                verifier = verifier.with_issuer(issuer);
            }
            ClientIdentifier::with_verifier(Arc::new(verifier))
        }
        None => {
            info!("No JWT secret configured, bearer tokens will not be trusted");
            ClientIdentifier::new()
        }
    };

    let limiter = RateLimiter::new(&rules, store)?
        .with_identifier(identifier)
        .with_clock(clock)
        .with_key_prefix(&config.store.key_prefix)
        .with_timeout(config.store.timeout())
        .with_failure_policy(config.store.failure_policy);
    info!(limiter = ?limiter, "Rate limiter initialized");

    let server = HttpServer::new(config.server.listen_addr, Arc::new(limiter))
        .with_health_paths(config.rate_limiting.health_paths.clone());
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Ratewarden Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn build_store(
    config: &ServiceConfig,
    clock: Arc<SystemClock>,
) -> anyhow::Result<Arc<dyn RateLimitStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            store
                .clone()
                .spawn_sweeper(clock, config.store.sweep_interval());
            info!(
                sweep_interval_secs = config.store.sweep_interval_secs,
                "Using in-memory rate limit store"
            );
            Ok(store as Arc<dyn RateLimitStore>)
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let store = ratewarden::ratelimit::RedisStore::connect(&config.store.redis_url).await?;
            if let Err(e) = store.ping().await {
                error!(error = %e, "Redis is not reachable yet, continuing with failure policy");
            }
            Ok(Arc::new(store) as Arc<dyn RateLimitStore>)
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => {
            anyhow::bail!("store.backend is redis but this build has the redis feature disabled")
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
