//! HTTP status server for monitoring the engine.
//!
//! Provides three endpoints:
//! - `/health` - JSON engine health (store, cache, scheduler, error counters)
//! - `/status/:job_id` - JSON snapshot of one collection job
//! - `/metrics` - Prometheus-compatible metrics
//!
//! The server runs in the background and never blocks collection work.

mod handlers;
mod types;

use axum::routing::get;
use axum::Router;

use handlers::{health_handler, job_status_handler, metrics_handler};
pub use types::StatusState;

/// Builds the router without binding a socket.
pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status/:job_id", get(job_status_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Creates and starts the status server
pub async fn start_status_server(port: u16, state: StatusState) -> Result<(), anyhow::Error> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind status server to port {}: {}", port, e))?;

    log::info!("Status server listening on http://127.0.0.1:{}/", port);
    log::info!("  - Health: http://127.0.0.1:{}/health", port);
    log::info!("  - Job status: http://127.0.0.1:{}/status/<job_id>", port);

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("Status server error: {}", e))?;

    Ok(())
}
