//! Client-facing engine.
//!
//! `PropertyEngine` wires the Storage Manager, Result Cache, source adapters
//! and scheduler from one `EngineConfig`, and exposes the handful of calls the
//! desktop client needs. Searches only read (cache, then store); collections
//! are always asynchronous.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheStats, Fingerprint, ResultCache};
use crate::config::EngineConfig;
use crate::error_handling::{EngineError, ProcessingStats, ProcessingStatsSnapshot, StorageError};
use crate::models::{Apn, DataSource, Priority, PropertyRecord, SearchCriteria};
use crate::remote::{HttpRemoteSource, RemoteSource};
use crate::scheduler::{
    CollectionScheduler, CompletionEvent, JobId, JobSnapshot, JobStatus, SchedulerConfig,
    SchedulerStats,
};
use crate::scrape::{BrowserEngine, BrowserSource};
use crate::storage::{StorageManager, StorageStats};

/// Snapshot of the engine's health, serializable for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    /// The store answered a trivial query
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_error: Option<String>,
    pub storage: StorageStats,
    pub cache: CacheStats,
    pub scheduler: SchedulerStats,
    pub errors: ProcessingStatsSnapshot,
    /// Current remote request rate, when throttled
    pub rate_limit_rps: Option<u32>,
}

pub struct PropertyEngine {
    config: EngineConfig,
    storage: StorageManager,
    cache: Arc<ResultCache>,
    remote: Arc<dyn RemoteSource>,
    scheduler: CollectionScheduler,
    stats: Arc<ProcessingStats>,
    sweeper: CancellationToken,
}

impl PropertyEngine {
    /// Opens the store and starts the production adapters and workers.
    pub async fn start(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let storage = StorageManager::open(
            &config.db_path,
            config.pool_max_connections,
            config.pool_acquire_timeout,
        )
        .await?;

        let remote = HttpRemoteSource::new(config.remote.clone(), config.backoff.clone())?
            .with_rate_limit(
                config.rate_limit_rps,
                config.rate_limit_burst,
                config.adaptive_error_threshold,
            );

        let browser = config
            .source_enabled(DataSource::Scrape)
            .then(|| Arc::new(BrowserSource::new(config.scrape.clone(), browser_engine(&config))));

        Self::with_components(config, storage, Arc::new(remote), browser)
    }

    /// Assembles an engine from prepared components. The store must already
    /// be migrated.
    pub fn with_components(
        config: EngineConfig,
        storage: StorageManager,
        remote: Arc<dyn RemoteSource>,
        browser: Option<Arc<BrowserSource>>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let cache = Arc::new(ResultCache::new(
            config.cache_ttl,
            Some(config.cache_max_entries),
        ));
        let stats = Arc::new(ProcessingStats::new());

        let mut builder = CollectionScheduler::builder()
            .remote(Arc::clone(&remote))
            .storage(storage.clone())
            .cache(Arc::clone(&cache))
            .stats(Arc::clone(&stats))
            .config(SchedulerConfig::from(&config));
        if let Some(browser) = browser {
            builder = builder.browser(browser);
        }
        let scheduler = builder.build()?;
        let sweeper = cache.start_sweeper(config.cache_sweep_interval);

        Ok(PropertyEngine {
            config,
            storage,
            cache,
            remote,
            scheduler,
            stats,
            sweeper,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Finds stored records. Never contacts a remote source.
    ///
    /// Results are cached for `search_cache_ttl` under a fingerprint of the
    /// criteria, tagged with every APN involved so a later collection of any
    /// of them drops the entry.
    pub async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<PropertyRecord>, EngineError> {
        let fingerprint = Fingerprint::for_search(criteria);
        if self.config.source_enabled(DataSource::Cache) {
            if let Some(value) = self.cache.get(&fingerprint) {
                match serde_json::from_value::<Vec<PropertyRecord>>(value) {
                    Ok(records) => return Ok(records),
                    Err(e) => log::warn!("Discarding unreadable cached search: {e}"),
                }
            }
        }

        let records = self.storage.search(criteria).await?;

        if self.config.source_enabled(DataSource::Cache) {
            let mut identifiers: Vec<String> = records.iter().map(|r| r.apn.clone()).collect();
            if let Some(apn) = criteria.apn.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
                identifiers.push(apn.to_string());
            }
            match serde_json::to_value(&records) {
                Ok(value) => self.cache.put(
                    fingerprint,
                    identifiers,
                    value,
                    Some(self.config.search_cache_ttl),
                ),
                Err(e) => log::warn!("Could not cache search results: {e}"),
            }
        }
        Ok(records)
    }

    /// Convenience search for a single APN.
    pub async fn lookup(&self, apn: &str) -> Result<Option<PropertyRecord>, EngineError> {
        let apn = Apn::parse(apn)?;
        let records = self.search(&SearchCriteria::by_apn(apn.as_str())).await?;
        Ok(records.into_iter().next())
    }

    /// Queues a background collection of every data kind. Returns at once.
    pub fn submit_collection(&self, apn: &str, priority: Priority) -> Result<JobId, EngineError> {
        Ok(self.scheduler.submit(apn, priority)?)
    }

    pub fn get_status(&self, id: JobId) -> Option<JobStatus> {
        self.scheduler.status(id)
    }

    pub fn job(&self, id: JobId) -> Option<JobSnapshot> {
        self.scheduler.job(id)
    }

    pub fn cancel(&self, id: JobId) -> bool {
        self.scheduler.cancel(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CompletionEvent> {
        self.scheduler.subscribe()
    }

    pub async fn health(&self) -> EngineHealth {
        let storage_error = self
            .storage
            .health_check()
            .await
            .err()
            .map(|e: StorageError| e.to_string());
        EngineHealth {
            healthy: storage_error.is_none() && !self.scheduler.is_shut_down(),
            storage_error,
            storage: self.storage.stats(),
            cache: self.cache.stats(),
            scheduler: self.scheduler.stats(),
            errors: self.stats.snapshot(),
            rate_limit_rps: self.remote.current_rps(),
        }
    }

    /// Stops the workers and the cache sweeper, then closes the store.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.sweeper.cancel();
        self.storage.close().await;
        log::info!("Engine shut down");
    }
}

fn browser_engine(config: &EngineConfig) -> Arc<dyn BrowserEngine> {
    #[cfg(feature = "browser")]
    {
        Arc::new(crate::scrape::ChromiumEngine::new(
            config.scrape.chrome_executable.clone(),
        ))
    }
    #[cfg(not(feature = "browser"))]
    {
        let _ = config;
        Arc::new(crate::scrape::UnavailableEngine::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    use crate::test_helpers::{create_test_storage, FakeRemote};

    async fn engine(dir: &TempDir) -> PropertyEngine {
        let storage = create_test_storage(dir, 4).await;
        let config = EngineConfig {
            db_path: dir.path().join("records.db"),
            workers: 2,
            ..Default::default()
        };
        PropertyEngine::with_components(config, storage, Arc::new(FakeRemote::complete()), None).unwrap()
    }

    async fn wait_finished(engine: &PropertyEngine, id: JobId) -> JobStatus {
        for _ in 0..200 {
            match engine.get_status(id) {
                Some(status) if status.is_finished() => return status,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        panic!("job {id} did not finish");
    }

    #[tokio::test]
    async fn test_collection_then_lookup() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;

        assert_eq!(engine.lookup("13238011").await.unwrap(), None);
        let id = engine.submit_collection("13238011", Priority::High).unwrap();
        assert!(matches!(wait_finished(&engine, id).await, JobStatus::Completed { .. }));

        // the earlier miss was cached; the collection must have dropped it
        let record = engine.lookup("13238011").await.unwrap().unwrap();
        assert_eq!(record.owner_name.as_deref(), Some("SMITH JOHN"));
        assert_eq!(record.tax_history.len(), 1);
        assert_eq!(record.sales_history.len(), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_search_is_served_from_cache() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        let criteria = SearchCriteria {
            owner_contains: Some("smith".into()),
            ..Default::default()
        };
        engine.search(&criteria).await.unwrap();
        engine.search(&criteria).await.unwrap();
        assert_eq!(engine.health().await.cache.hits, 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_report() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        let health = engine.health().await;
        assert!(health.healthy);
        assert_eq!(health.scheduler.queued, 0);
        assert_eq!(health.rate_limit_rps, None);

        let value = serde_json::to_value(&health).unwrap();
        assert!(value.get("storage_error").is_none());
        engine.shutdown().await;
        assert!(!engine.health().await.healthy);
    }

    #[tokio::test]
    async fn test_blank_apn_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        assert!(engine.submit_collection(" ", Priority::Normal).is_err());
        assert!(engine.lookup("").await.is_err());
        engine.shutdown().await;
    }
}
