//! Configuration constants.
//!
//! This module defines the defaults used throughout the engine: pool bounds,
//! rate limits, cache lifetimes, retry policy, and worker/job limits.

use std::time::Duration;

/// Default SQLite database path used by the CLI.
pub const DB_PATH: &str = "./parcel_records.db";

// Connection pool
/// Default maximum number of pooled store connections.
/// The pool is sized between 5 and 20 in practice; 10 covers 3 workers plus
/// interactive searches with headroom.
pub const DEFAULT_POOL_MAX_CONNECTIONS: u32 = 10;
/// Upper bound accepted by `EngineConfig::validate`.
pub const MAX_POOL_CONNECTIONS: u32 = 64;
/// How long an operation waits for a free connection slot before failing with
/// `PoolExhausted`.
pub const DEFAULT_POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
/// SQLite busy timeout for lock contention between pooled connections.
pub const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// Remote service
/// Initial requests per second against the remote service (~60 req/min).
pub const DEFAULT_RATE_LIMIT_RPS: u32 = 1;
/// Token bucket burst capacity.
pub const DEFAULT_RATE_LIMIT_BURST: usize = 1;
/// Error rate above which the adaptive limiter halves the request rate.
pub const DEFAULT_ADAPTIVE_ERROR_THRESHOLD: f64 = 0.2;
/// Per-request timeout for the remote service.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
/// HTTP status code for rate limiting.
pub const HTTP_STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// Default User-Agent for both the remote service and the browser engine.
pub const DEFAULT_USER_AGENT: &str = concat!("parcel_records/", env!("CARGO_PKG_VERSION"));

// Retry strategy
/// Initial delay before the first retry.
pub const RETRY_INITIAL_DELAY_MS: u64 = 500;
/// Maximum delay between retries in seconds.
pub const RETRY_MAX_DELAY_SECS: u64 = 15;
/// Maximum number of attempts (initial attempt + retries).
pub const RETRY_MAX_ATTEMPTS: usize = 3;
/// Upper bound on the summed backoff delays of one call.
pub const RETRY_MAX_TOTAL_WAIT_SECS: u64 = 30;

// Browser automation
/// Per-page load timeout for the browser adapter.
pub const DEFAULT_PAGE_TIMEOUT: Duration = Duration::from_secs(30);
/// Public parcel detail page. `{apn}` is replaced with the identifier.
pub const DEFAULT_SCRAPE_URL_TEMPLATE: &str =
    "https://assessor.example.gov/parcel-viewer/parcel/{apn}";

// Result cache
/// Default lifetime of a cached per-kind payload.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Default lifetime of a cached search result.
pub const DEFAULT_SEARCH_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
/// Default cap on cached entries.
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 10_000;
/// How often the background sweeper evicts expired entries.
pub const DEFAULT_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// Scheduler
/// Number of concurrent collection workers.
pub const DEFAULT_WORKERS: usize = 3;
/// Upper bound on a single collection job.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(120);
/// How long finished jobs remain queryable.
pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(10 * 60);
/// Capacity of the completion event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

// Store write circuit breaker
/// Consecutive write failures before the breaker opens.
pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 5;
/// How long the breaker stays open.
pub const CIRCUIT_BREAKER_COOLDOWN: Duration = Duration::from_secs(60);

// Search
/// Default maximum number of records returned by a search.
pub const DEFAULT_SEARCH_LIMIT: u32 = 50;

// Status server
/// Port used by `parcel-records serve` when none is given.
pub const DEFAULT_STATUS_PORT: u16 = 8787;
