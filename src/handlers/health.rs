use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, warn};

use crate::state::AppState;

// GET /health - store and backend connectivity plus running totals
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (store_ok, store_status) = match state.rate_limiter.store().ping().await {
        Ok(()) => (true, "Connected".to_string()),
        Err(e) => {
            error!(error = %e, "Counter store health check failed");
            (false, format!("Disconnected: {}", e))
        }
    };

    let (backend_ok, backend_status) = match state.forwarder.probe_health(state.health_timeout).await {
        Ok(status) if status.is_success() => (true, "Connected".to_string()),
        Ok(status) => {
            warn!(status = status.as_u16(), "Backend health check returned error status");
            (false, format!("Connected (backend error status: {})", status.as_u16()))
        }
        Err(e) => {
            error!(error = %e, "Backend health check failed");
            (false, format!("Disconnected: {}", e))
        }
    };

    let (code, overall) = match (store_ok, backend_ok) {
        (true, true) => (StatusCode::OK, "OK"),
        (false, false) => (StatusCode::SERVICE_UNAVAILABLE, "UNHEALTHY"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "DEGRADED"),
    };

    (
        code,
        Json(json!({
            "status": overall,
            "store_status": store_status,
            "backend_status": backend_status,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "metrics": state.metrics.snapshot(),
        })),
    )
}
