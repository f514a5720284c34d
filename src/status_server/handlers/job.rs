//! Per-job status handler.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use super::super::types::{ErrorResponse, StatusState};
use crate::scheduler::JobId;

/// Snapshot of one collection job, or 404 once it is unknown or purged.
pub async fn job_status_handler(
    State(state): State<StatusState>,
    Path(job_id): Path<u64>,
) -> Response {
    match state.engine.job(JobId(job_id)) {
        Some(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("job {job_id} not found"),
            }),
        )
            .into_response(),
    }
}
