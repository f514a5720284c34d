//! Prometheus metrics handler.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use super::super::types::StatusState;

/// Prometheus-compatible metrics endpoint
pub async fn metrics_handler(State(state): State<StatusState>) -> Response {
    let health = state.engine.health().await;
    let scheduler = &health.scheduler;

    let metrics = format!(
        r#"# HELP parcel_records_up Whether the store answers queries
# TYPE parcel_records_up gauge
parcel_records_up {}

# HELP parcel_records_jobs_queued Collection jobs waiting for a worker
# TYPE parcel_records_jobs_queued gauge
parcel_records_jobs_queued {}

# HELP parcel_records_jobs_running Collection jobs in progress
# TYPE parcel_records_jobs_running gauge
parcel_records_jobs_running {}

# HELP parcel_records_jobs_completed_total Collection jobs completed
# TYPE parcel_records_jobs_completed_total counter
parcel_records_jobs_completed_total {}

# HELP parcel_records_jobs_failed_total Collection jobs failed
# TYPE parcel_records_jobs_failed_total counter
parcel_records_jobs_failed_total {}

# HELP parcel_records_cache_hit_rate Fraction of cache lookups that hit
# TYPE parcel_records_cache_hit_rate gauge
parcel_records_cache_hit_rate {}

# HELP parcel_records_cache_entries Live cache entries
# TYPE parcel_records_cache_entries gauge
parcel_records_cache_entries {}

# HELP parcel_records_store_failures_total Failed store operations
# TYPE parcel_records_store_failures_total counter
parcel_records_store_failures_total {}

# HELP parcel_records_errors_total Source and job errors
# TYPE parcel_records_errors_total counter
parcel_records_errors_total {}

# HELP parcel_records_remote_rps Current remote request rate
# TYPE parcel_records_remote_rps gauge
parcel_records_remote_rps {}
"#,
        u8::from(health.healthy),
        scheduler.queued,
        scheduler.running,
        scheduler.completed,
        scheduler.failed,
        health.cache.hit_rate,
        health.cache.size,
        health.storage.total_failures,
        health.errors.total_errors,
        health.rate_limit_rps.unwrap_or(0),
    );

    (StatusCode::OK, metrics).into_response()
}
