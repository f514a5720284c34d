//! Status server data structures.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::engine::{EngineHealth, PropertyEngine};

/// Shared state for the status server
#[derive(Clone)]
pub struct StatusState {
    pub engine: Arc<PropertyEngine>,
    pub start_time: Arc<Instant>,
}

impl StatusState {
    pub fn new(engine: Arc<PropertyEngine>) -> Self {
        StatusState {
            engine,
            start_time: Arc::new(Instant::now()),
        }
    }
}

/// JSON response for `/health`
#[derive(Serialize)]
pub struct HealthResponse {
    pub uptime_seconds: f64,
    #[serde(flatten)]
    pub health: EngineHealth,
}

/// JSON body for lookups that found nothing
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
