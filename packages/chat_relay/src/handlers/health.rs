use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use gateway_client::ConnectionState;

use crate::AppState;
use crate::metrics;

/// Health check endpoint - relay status plus the gateway connection
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let gateway = state.gateway.status();
    let metrics = state.metrics.snapshot();

    let status = if gateway.state == ConnectionState::Connected {
        "healthy"
    } else {
        "degraded"
    };

    Json(metrics::HealthStatus {
        status: status.to_string(),
        gateway,
        active_streams: metrics.active_streams,
        uptime_secs: metrics.uptime_secs,
    })
}

/// Metrics endpoint - returns relay counters
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

/// Readiness probe - returns 200 once the gateway handshake has completed
pub async fn health_ready_handler(State(state): State<AppState>) -> Response {
    if state.gateway.is_connected() {
        Json(serde_json::json!({
            "status": "ready",
            "gateway": "connected"
        }))
        .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "gateway": "disconnected"
            })),
        )
            .into_response()
    }
}
