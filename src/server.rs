use axum::{Router, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::concurrency::ConcurrencyLimiter;
use crate::config::GatewayConfig;
use crate::error::{ConfigError, StoreError};
use crate::forward::Forwarder;
use crate::handlers::{health_handler, metrics_handler, proxy_handler};
use crate::metrics::GatewayMetrics;
use crate::rate_limit::RateLimiter;
use crate::state::AppState;
use crate::store::{CounterStore, MemoryCounterStore, RedisCounterStore, memory_sweeper};

// selects the in-process counter store
pub const MEMORY_STORE_SCHEME: &str = "memory://";

/// `memory://` gives a process-local store with a background sweeper.
/// Anything else is a redis url and must answer a PING.
pub async fn connect_store(config: &GatewayConfig) -> Result<Arc<dyn CounterStore>, StoreError> {
    if config.redis_url.starts_with(MEMORY_STORE_SCHEME) {
        let store = Arc::new(MemoryCounterStore::new());
        tokio::spawn(memory_sweeper(
            Arc::clone(&store),
            Duration::from_secs(config.time_window),
        ));
        info!("Using in-process counter store; limits are not shared between instances");
        return Ok(store);
    }

    let store = RedisCounterStore::connect(&config.redis_url, config.store_timeout()).await?;
    Ok(Arc::new(store))
}

// Validates the config first
pub fn build_state(config: &GatewayConfig, store: Arc<dyn CounterStore>) -> Result<AppState, ConfigError> {
    config.validate()?;

    Ok(AppState {
        rate_limiter: RateLimiter::new(store, config.rate_limit, config.time_window)
            .with_key_prefix(config.key_prefix.clone()),
        concurrency: ConcurrencyLimiter::new(config.max_concurrent),
        forwarder: Forwarder::new(&config.backend, config.backend_timeout(), config.max_body_bytes)?,
        metrics: GatewayMetrics::new()?,
        fail_policy: config.fail_policy,
        trust_forwarded_for: config.trust_forwarded_for,
        health_timeout: config.health_timeout(),
    })
}

// /health and /metrics, everything else goes through the proxy
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, app: Router) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Gateway listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
}

// Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
