use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratelimit_gateway::config::GatewayConfig;
use ratelimit_gateway::server::{build_router, build_state, connect_store, serve};

// this is main async function with tokio
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    // flags or environment
    let config = GatewayConfig::parse();
    config.validate().context("invalid configuration")?;

    let store = connect_store(&config)
        .await
        .with_context(|| format!("counter store unreachable at {}", config.redis_url))?;

    let state = Arc::new(build_state(&config, store).context("failed to build gateway state")?);

    // the backend has to answer before we take traffic
    let backend_status = state
        .forwarder
        .probe_health(config.health_timeout())
        .await
        .with_context(|| format!("backend unreachable at {}", config.backend))?;
    if !backend_status.is_success() {
        anyhow::bail!("backend health check at {} returned {}", config.backend, backend_status);
    }

    info!(backend = %config.backend, "Gateway started with primary backend");
    info!(
        "Rate limit: {} requests per {} seconds (fail policy: {:?})",
        config.rate_limit, config.time_window, config.fail_policy
    );
    info!("Max concurrent requests: {}", config.max_concurrent);

    let app = build_router(state);
    serve(config.listen, app).await.context("server error")?;

    info!("Gateway stopped");
    Ok(())
}
