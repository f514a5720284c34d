//! Error handling and processing statistics.
//!
//! This module provides:
//! - The error taxonomy (`SourceError`, `StorageError`, `CollectError`,
//!   `ConstructionError`)
//! - Classification of HTTP outcomes into that taxonomy
//! - The shared retry policy used by the source adapters
//! - Processing statistics (errors, warnings, info) for health reporting

mod categorization;
mod retry;
mod stats;
mod types;

// Re-export public API
pub use categorization::{
    classify_reqwest_error, classify_status, error_type_for, parse_retry_after,
    update_error_stats,
};
pub use retry::{BackoffPolicy, RetryOutcome};
pub use stats::{ProcessingStats, ProcessingStatsSnapshot};
pub use types::{
    CollectError, ConstructionError, EngineError, ErrorType, InfoType, InitializationError,
    SourceError, StorageError, WarningType,
};
