//! Error type definitions.
//!
//! This module defines the error taxonomy of the engine plus the counters used
//! for health reporting.

use std::time::Duration;

use log::SetLoggerError;
use reqwest::Error as ReqwestError;
use strum_macros::EnumIter as EnumIterMacro;
use thiserror::Error;

use crate::models::DataKind;

/// Error types for initialization failures.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)] // All variants end with "Error" by convention
pub enum InitializationError {
    /// Error initializing the logger.
    #[error("Logger initialization error: {0}")]
    LoggerError(#[from] SetLoggerError),

    /// Error initializing the HTTP client.
    #[error("HTTP client initialization error: {0}")]
    HttpClientError(#[from] ReqwestError),
}

/// Failure of a single source adapter call.
///
/// Cloneable so the orchestrator can aggregate errors per collection and the
/// scheduler can keep them on finished jobs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    /// Credentials missing or rejected. Fatal for the session, never retried.
    #[error("remote service rejected the credentials")]
    Unauthorized,

    /// Provider throttled us (HTTP 429).
    #[error("rate limited by remote service")]
    RateLimited { retry_after: Option<Duration> },

    /// Network or server trouble that may clear up on retry.
    #[error("transient source failure: {0}")]
    Transient(String),

    /// The source has no data for this identifier. Drives fallback.
    #[error("no data found")]
    NotFound,

    /// The source does not cover this data kind. Drives fallback.
    #[error("{0} data is not supported by this source")]
    Unsupported(DataKind),

    /// The response could not be mapped to the canonical shape.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The browser-automation engine is not installed or failed to start.
    #[error("browser automation engine unavailable: {0}")]
    EngineUnavailable(String),

    /// A page or request exceeded its time budget.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Page content did not match the extraction rules.
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    /// Fetched data could not be persisted.
    #[error("storage error: {0}")]
    Storage(String),
}

impl SourceError {
    /// Errors worth another attempt after a backoff delay.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            SourceError::RateLimited { .. } | SourceError::Transient(_)
        )
    }

    /// The source answered that it has nothing for the kind. Anything else
    /// means the collection itself failed.
    pub fn is_absence(&self) -> bool {
        matches!(self, SourceError::NotFound | SourceError::Unsupported(_))
    }

    /// Errors after which the browser fallback should be tried.
    pub fn allows_fallback(&self) -> bool {
        self.is_absence()
    }
}

/// Error types for Storage Manager operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Required fields missing. Caller error, never reaches the store.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// No property with this APN.
    #[error("property {0} not found")]
    NotFound(String),

    /// No connection slot became free within the acquire timeout.
    #[error("connection pool exhausted (waited {0:?})")]
    PoolExhausted(Duration),

    /// Rejected pool or store settings.
    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),

    /// Writes are suspended after repeated failures.
    #[error("store writes suspended by circuit breaker")]
    CircuitOpen,

    /// Error creating the database file.
    #[error("Database file creation error: {0}")]
    FileCreationError(String),

    /// Schema migration failure.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// SQL execution error.
    #[error("SQL error: {0}")]
    SqlError(#[from] sqlx::Error),
}

/// Failure of a collection as a whole.
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("collection cancelled")]
    Cancelled,

    #[error("collection timed out after {0:?}")]
    Timeout(Duration),

    #[error("scheduler is shut down")]
    Shutdown,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Construction-time failures. A component that returns one of these was
/// never built, so there is no schedulable-but-broken instance.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConstructionError {
    #[error("a remote source adapter is required to build the scheduler")]
    MissingRemoteSource,

    #[error("remote source adapter is not usable: {0}")]
    InvalidRemoteSource(String),

    #[error("missing required dependency: {0}")]
    MissingDependency(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors raised while assembling the full engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Construction(#[from] ConstructionError),

    #[error(transparent)]
    Initialization(#[from] InitializationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Collect(#[from] CollectError),
}

/// Error conditions counted for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIterMacro)]
pub enum ErrorType {
    // Remote service
    RemoteUnauthorized,
    RemoteRateLimited,
    RemoteTransient,
    RemoteNotFound,
    RemoteUnsupported,
    RemoteMalformed,
    // Browser automation
    ScrapeEngineUnavailable,
    ScrapeTimeout,
    ScrapeExtractionFailed,
    ScrapeNotFound,
    // Storage
    StorageWriteFailed,
    // Jobs
    JobTimeout,
    JobPanicked,
}

/// Notable events that are not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIterMacro)]
pub enum InfoType {
    CacheHit,
    FallbackToScrape,
    JobDeduplicated,
    JobCancelled,
}

/// Outcomes worth flagging that still count as a finished collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIterMacro)]
pub enum WarningType {
    PartialCollection,
    NoDataCollected,
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::RemoteUnauthorized => "Remote unauthorized",
            ErrorType::RemoteRateLimited => "Remote rate limited",
            ErrorType::RemoteTransient => "Remote transient error",
            ErrorType::RemoteNotFound => "Remote not found",
            ErrorType::RemoteUnsupported => "Remote unsupported kind",
            ErrorType::RemoteMalformed => "Remote malformed response",
            ErrorType::ScrapeEngineUnavailable => "Browser engine unavailable",
            ErrorType::ScrapeTimeout => "Browser page timeout",
            ErrorType::ScrapeExtractionFailed => "Browser extraction failed",
            ErrorType::ScrapeNotFound => "Browser page has no data",
            ErrorType::StorageWriteFailed => "Store write failed",
            ErrorType::JobTimeout => "Collection job timeout",
            ErrorType::JobPanicked => "Collection worker panicked",
        }
    }
}

impl std::fmt::Display for InfoType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InfoType::CacheHit => "Cache hit",
            InfoType::FallbackToScrape => "Fallback to browser automation",
            InfoType::JobDeduplicated => "Job deduplicated",
            InfoType::JobCancelled => "Job cancelled",
        };
        f.write_str(s)
    }
}

impl std::fmt::Display for WarningType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WarningType::PartialCollection => "Partial collection",
            WarningType::NoDataCollected => "No data collected",
        };
        f.write_str(s)
    }
}
