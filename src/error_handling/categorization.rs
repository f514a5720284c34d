//! Error categorization.
//!
//! Maps HTTP outcomes to the `SourceError` taxonomy and source errors to the
//! `ErrorType` counters used for health reporting.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};

use super::stats::ProcessingStats;
use super::types::{ErrorType, SourceError};
use crate::models::DataSource;

/// Classifies a non-success HTTP status.
///
/// Returns `None` for 2xx responses.
pub fn classify_status(status: u16, retry_after: Option<Duration>) -> Option<SourceError> {
    match status {
        200..=299 => None,
        401 | 403 => Some(SourceError::Unauthorized),
        404 | 410 => Some(SourceError::NotFound),
        429 => Some(SourceError::RateLimited { retry_after }),
        408 => Some(SourceError::Transient("HTTP 408 request timeout".into())),
        500..=599 => Some(SourceError::Transient(format!("HTTP {status}"))),
        other => Some(SourceError::Malformed(format!("unexpected HTTP status {other}"))),
    }
}

/// Reads a `Retry-After` header expressed in seconds.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Categorizes a `reqwest::Error` raised before a status code was available.
pub fn classify_reqwest_error(error: &reqwest::Error) -> SourceError {
    if let Some(status) = error.status() {
        if let Some(classified) = classify_status(status.as_u16(), None) {
            return classified;
        }
    }

    if error.is_timeout() {
        SourceError::Transient(format!("request timed out: {error}"))
    } else if error.is_connect() || error.is_request() || error.is_body() {
        SourceError::Transient(error.to_string())
    } else if error.is_decode() {
        SourceError::Malformed(error.to_string())
    } else {
        SourceError::Transient(error.to_string())
    }
}

/// Maps a source failure to its health counter.
pub fn error_type_for(origin: DataSource, error: &SourceError) -> ErrorType {
    match (origin, error) {
        (_, SourceError::Storage(_)) => ErrorType::StorageWriteFailed,
        (DataSource::Scrape, SourceError::EngineUnavailable(_)) => {
            ErrorType::ScrapeEngineUnavailable
        }
        (DataSource::Scrape, SourceError::Timeout(_)) => ErrorType::ScrapeTimeout,
        (DataSource::Scrape, SourceError::NotFound) => ErrorType::ScrapeNotFound,
        (DataSource::Scrape, _) => ErrorType::ScrapeExtractionFailed,
        (_, SourceError::Unauthorized) => ErrorType::RemoteUnauthorized,
        (_, SourceError::RateLimited { .. }) => ErrorType::RemoteRateLimited,
        (_, SourceError::NotFound) => ErrorType::RemoteNotFound,
        (_, SourceError::Unsupported(_)) => ErrorType::RemoteUnsupported,
        (_, SourceError::Malformed(_)) => ErrorType::RemoteMalformed,
        (_, _) => ErrorType::RemoteTransient,
    }
}

/// Records a source failure in the processing statistics.
pub fn update_error_stats(stats: &ProcessingStats, origin: DataSource, error: &SourceError) {
    stats.increment_error(error_type_for(origin, error));
}
