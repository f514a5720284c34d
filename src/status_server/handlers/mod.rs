//! Status server HTTP handlers.

mod health;
mod job;
mod metrics;

pub use health::health_handler;
pub use job::job_status_handler;
pub use metrics::metrics_handler;
