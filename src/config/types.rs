//! Configuration types.
//!
//! `EngineConfig` is the opaque configuration object the engine receives at
//! construction. The engine never reads files or environment variables; the
//! caller (the CLI, or the desktop client) builds this struct.

use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;

use crate::config::constants::*;
use crate::error_handling::{BackoffPolicy, ConstructionError};
use crate::models::DataSource;

/// Logging level for the application.
///
/// Controls the verbosity of log output, from most restrictive (Error) to most
/// verbose (Trace).
#[derive(Clone, Debug, ValueEnum)]
pub enum LogLevel {
    /// Only error messages
    Error,
    /// Error and warning messages
    Warn,
    /// Error, warning, and informational messages
    Info,
    /// All messages except trace
    Debug,
    /// All messages including trace
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(l: LogLevel) -> Self {
        match l {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Log output format.
///
/// - `Plain`: Human-readable format with colors (default)
/// - `Json`: Structured JSON format for machine parsing
#[derive(Clone, Debug, ValueEnum)]
pub enum LogFormat {
    /// Human-readable format with colors (default)
    Plain,
    /// Structured JSON format for machine parsing
    Json,
}

/// Settings for the structured remote service.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Base URL, e.g. `https://api.county.example/v1`
    pub base_url: String,
    /// Bearer token sent with every request
    pub api_token: String,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Whether the service exposes sales history. When false, sales are
    /// collected through the browser fallback only.
    pub supports_sales: bool,
    /// HTTP User-Agent header value
    pub user_agent: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_token: String::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            supports_sales: false,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// CSS selectors used to pull records out of a rendered parcel page.
///
/// Detail fields are looked up by `field_selector` with `{field}` replaced by
/// the field name (`owner`, `situs_address`, ...). History tables are read row
/// by row; cells are addressed by column index.
#[derive(Debug, Clone)]
pub struct ExtractionRules {
    pub field_selector: String,
    pub tax_row_selector: String,
    pub sales_row_selector: String,
    pub cell_selector: String,
    /// Column order of the tax table: year, assessed value, tax amount, paid
    pub tax_columns: [usize; 4],
    /// Column order of the sales table: date, price, buyer, seller, deed type, document
    pub sales_columns: [usize; 6],
}

impl Default for ExtractionRules {
    fn default() -> Self {
        Self {
            field_selector: "[data-field=\"{field}\"]".to_string(),
            tax_row_selector: "table#tax-history tbody tr".to_string(),
            sales_row_selector: "table#sales-history tbody tr".to_string(),
            cell_selector: "td".to_string(),
            tax_columns: [0, 1, 2, 3],
            sales_columns: [0, 1, 2, 3, 4, 5],
        }
    }
}

/// Settings for the browser-automation fallback.
#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    /// Page URL with an `{apn}` placeholder
    pub url_template: String,
    /// Maximum time to wait for one page to load
    pub page_timeout: Duration,
    /// Explicit Chrome/Chromium binary; auto-detected when `None`
    pub chrome_executable: Option<PathBuf>,
    pub rules: ExtractionRules,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            url_template: DEFAULT_SCRAPE_URL_TEMPLATE.to_string(),
            page_timeout: DEFAULT_PAGE_TIMEOUT,
            chrome_executable: None,
            rules: ExtractionRules::default(),
        }
    }
}

/// Engine configuration (no CLI dependencies).
///
/// # Examples
///
/// ```no_run
/// use parcel_records::EngineConfig;
/// use std::path::PathBuf;
///
/// let mut config = EngineConfig {
///     db_path: PathBuf::from("records.db"),
///     workers: 4,
///     ..Default::default()
/// };
/// config.remote.base_url = "https://api.county.example/v1".into();
/// config.remote.api_token = "secret".into();
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite database path
    pub db_path: PathBuf,
    /// Connection pool size
    pub pool_max_connections: u32,
    /// Maximum wait for a connection slot
    pub pool_acquire_timeout: Duration,

    /// Initial requests per second against the remote service
    pub rate_limit_rps: u32,
    /// Token bucket burst capacity
    pub rate_limit_burst: usize,
    /// Error rate threshold for adaptive rate limiting (0.0-1.0)
    pub adaptive_error_threshold: f64,
    /// Retry policy shared by the adapters
    pub backoff: BackoffPolicy,

    /// Lifetime of cached per-kind payloads
    pub cache_ttl: Duration,
    /// Lifetime of cached search results
    pub search_cache_ttl: Duration,
    /// Maximum number of cache entries
    pub cache_max_entries: usize,
    /// Interval of the expired-entry sweeper
    pub cache_sweep_interval: Duration,

    /// Enabled sources. Order of evaluation is always cache, remote, scrape.
    pub sources: Vec<DataSource>,
    pub remote: RemoteConfig,
    pub scrape: ScrapeConfig,

    /// Number of collection workers
    pub workers: usize,
    /// Upper bound on one collection job
    pub job_timeout: Duration,
    /// How long finished jobs stay queryable
    pub job_retention: Duration,
    /// Completion event channel capacity
    pub event_capacity: usize,

    /// HTTP status server port (optional, disabled by default)
    pub status_port: Option<u16>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DB_PATH),
            pool_max_connections: DEFAULT_POOL_MAX_CONNECTIONS,
            pool_acquire_timeout: DEFAULT_POOL_ACQUIRE_TIMEOUT,
            rate_limit_rps: DEFAULT_RATE_LIMIT_RPS,
            rate_limit_burst: DEFAULT_RATE_LIMIT_BURST,
            adaptive_error_threshold: DEFAULT_ADAPTIVE_ERROR_THRESHOLD,
            backoff: BackoffPolicy::default(),
            cache_ttl: DEFAULT_CACHE_TTL,
            search_cache_ttl: DEFAULT_SEARCH_CACHE_TTL,
            cache_max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            cache_sweep_interval: DEFAULT_CACHE_SWEEP_INTERVAL,
            sources: vec![DataSource::Cache, DataSource::Remote, DataSource::Scrape],
            remote: RemoteConfig::default(),
            scrape: ScrapeConfig::default(),
            workers: DEFAULT_WORKERS,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            job_retention: DEFAULT_JOB_RETENTION,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            status_port: None,
        }
    }
}

impl EngineConfig {
    /// Returns true if `source` is part of the enabled chain.
    pub fn source_enabled(&self, source: DataSource) -> bool {
        self.sources.contains(&source)
    }

    /// Checks bounds that would otherwise produce a broken engine.
    pub fn validate(&self) -> Result<(), ConstructionError> {
        if self.pool_max_connections == 0 || self.pool_max_connections > MAX_POOL_CONNECTIONS {
            return Err(ConstructionError::InvalidConfig(format!(
                "pool_max_connections must be between 1 and {MAX_POOL_CONNECTIONS}, got {}",
                self.pool_max_connections
            )));
        }
        if self.workers == 0 {
            return Err(ConstructionError::InvalidConfig(
                "workers must be at least 1".into(),
            ));
        }
        if self.rate_limit_burst == 0 {
            return Err(ConstructionError::InvalidConfig(
                "rate_limit_burst must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.adaptive_error_threshold) {
            return Err(ConstructionError::InvalidConfig(format!(
                "adaptive_error_threshold must be within 0.0-1.0, got {}",
                self.adaptive_error_threshold
            )));
        }
        if self.event_capacity == 0 {
            return Err(ConstructionError::InvalidConfig(
                "event_capacity must be at least 1".into(),
            ));
        }
        if self.source_enabled(DataSource::Scrape) && !self.scrape.url_template.contains("{apn}") {
            return Err(ConstructionError::InvalidConfig(
                "scrape url_template must contain an {apn} placeholder".into(),
            ));
        }
        self.backoff.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_default_source_chain() {
        let config = EngineConfig::default();
        assert!(config.source_enabled(DataSource::Cache));
        assert!(config.source_enabled(DataSource::Remote));
        assert!(config.source_enabled(DataSource::Scrape));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = EngineConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConstructionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_pool_bounds_rejected() {
        let config = EngineConfig {
            pool_max_connections: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            pool_max_connections: MAX_POOL_CONNECTIONS + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_scrape_template_requires_placeholder() {
        let mut config = EngineConfig::default();
        config.scrape.url_template = "https://example.com/parcel".into();
        assert!(config.validate().is_err());

        // Not checked when the scrape source is disabled
        config.sources = vec![DataSource::Cache, DataSource::Remote];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(
            log::LevelFilter::from(LogLevel::Debug),
            log::LevelFilter::Debug
        );
        assert_eq!(
            log::LevelFilter::from(LogLevel::Error),
            log::LevelFilter::Error
        );
    }
}
