//! parcel_records library: multi-source property records acquisition
//!
//! This library collects ownership, assessment, tax and sales records for a
//! parcel (keyed by APN) from a structured remote service, falling back to a
//! headless browser scrape of the public parcel page, and keeps everything in
//! a local SQLite store fronted by a TTL cache. Collections run in the
//! background on a small worker pool; searches only ever read locally.
//!
//! # Example
//!
//! ```no_run
//! use parcel_records::{EngineConfig, Priority, PropertyEngine};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = EngineConfig::default();
//! config.remote.api_token = std::env::var("PARCEL_API_TOKEN")?;
//!
//! let engine = PropertyEngine::start(config).await?;
//! let mut events = engine.subscribe();
//! let job = engine.submit_collection("132-38-011", Priority::High)?;
//!
//! while let Ok(event) = events.recv().await {
//!     if event.job_id == job {
//!         break;
//!     }
//! }
//! if let Some(record) = engine.lookup("132-38-011").await? {
//!     println!("{} tax years on file", record.tax_history.len());
//! }
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Requirements
//!
//! This library requires a Tokio runtime. Use `#[tokio::main]` in your application
//! or ensure you're calling library functions within an async context.

mod adaptive_rate_limiter;
mod cache;
pub mod config;
mod engine;
pub mod error_handling;
pub mod initialization;
mod models;
pub mod orchestrator;
pub mod remote;
pub mod scheduler;
pub mod scrape;
pub mod status_server;
pub mod storage;

#[cfg(test)]
mod test_helpers;

// Re-export public API
pub use cache::{CacheStats, Fingerprint, ResultCache};
pub use config::{EngineConfig, LogFormat, LogLevel, RemoteConfig, ScrapeConfig};
pub use engine::{EngineHealth, PropertyEngine};
pub use error_handling::{
    BackoffPolicy, CollectError, ConstructionError, EngineError, SourceError, StorageError,
};
pub use models::{
    Apn, DataKind, DataSource, DependentRecord, NormalizedPayload, Priority, PropertyRecord,
    SalesRecord, SearchCriteria, TaxRecord,
};
pub use orchestrator::{CollectionOutcome, CollectionResult, CollectionSummary, SourceOrchestrator};
pub use remote::{HttpRemoteSource, RemoteSource};
pub use scheduler::{
    CollectionScheduler, CompletionEvent, JobId, JobOutcome, JobSnapshot, JobStatus,
    SchedulerConfig, SchedulerStats,
};
pub use scrape::{BrowserEngine, BrowserSession, BrowserSource};
pub use storage::{run_migrations, StorageManager};
