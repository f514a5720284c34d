//! JSON health handler.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use super::super::types::{HealthResponse, StatusState};

/// Engine health; 503 when the store is unreachable or the scheduler stopped.
pub async fn health_handler(State(state): State<StatusState>) -> Response {
    let health = state.engine.health().await;
    let code = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let response = HealthResponse {
        uptime_seconds: state.start_time.elapsed().as_secs_f64(),
        health,
    };
    (code, Json(response)).into_response()
}
