//! Source Orchestrator: runs the fallback chain for one collection.
//!
//! For each requested kind, in persistence order (property first):
//! cache, then the remote service, then the browser adapter when the remote
//! reports `NotFound` or does not cover the kind. Fresh results are written
//! through the Storage Manager and mirrored into the cache.

mod result;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cache::{Fingerprint, ResultCache};
use crate::error_handling::{
    update_error_stats, CollectError, InfoType, ProcessingStats, SourceError,
};
use crate::models::{Apn, DataKind, DataSource, DependentRecord, NormalizedPayload};
use crate::remote::RemoteSource;
use crate::scrape::BrowserSource;
use crate::storage::StorageManager;

pub use result::{CollectionOutcome, CollectionResult, CollectionSummary, KindError};

/// Runs `$fut` unless `$cancel` fires first.
macro_rules! or_cancelled {
    ($cancel:expr, $fut:expr) => {
        tokio::select! {
            biased;
            _ = $cancel.cancelled() => return Err(CollectError::Cancelled),
            value = $fut => value,
        }
    };
}

#[derive(Clone)]
pub struct SourceOrchestrator {
    storage: StorageManager,
    cache: Arc<ResultCache>,
    remote: Option<Arc<dyn RemoteSource>>,
    browser: Option<Arc<BrowserSource>>,
    use_cache: bool,
    stats: Arc<ProcessingStats>,
}

impl SourceOrchestrator {
    /// An orchestrator with only the cache enabled. Add sources with
    /// `with_remote` / `with_browser`.
    pub fn new(storage: StorageManager, cache: Arc<ResultCache>, stats: Arc<ProcessingStats>) -> Self {
        SourceOrchestrator {
            storage,
            cache,
            remote: None,
            browser: None,
            use_cache: true,
            stats,
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteSource>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_browser(mut self, browser: Arc<BrowserSource>) -> Self {
        self.browser = Some(browser);
        self
    }

    /// Keeps only the sources listed in `enabled`. Listing order is ignored;
    /// the chain always runs cache, remote, scrape.
    pub fn restrict_to(mut self, enabled: &[DataSource]) -> Self {
        self.use_cache = enabled.contains(&DataSource::Cache);
        if !enabled.contains(&DataSource::Remote) {
            self.remote = None;
        }
        if !enabled.contains(&DataSource::Scrape) {
            self.browser = None;
        }
        self
    }

    pub fn remote(&self) -> Option<&Arc<dyn RemoteSource>> {
        self.remote.as_ref()
    }

    /// Collects `kinds` for `apn`.
    ///
    /// Per-kind failures are aggregated in the result and never fail the
    /// collection; only cancellation does.
    pub async fn collect(
        &self,
        apn: &Apn,
        kinds: &[DataKind],
        cancel: &CancellationToken,
    ) -> Result<CollectionResult, CollectError> {
        let mut kinds = kinds.to_vec();
        kinds.sort();
        kinds.dedup();

        let mut result = CollectionResult::new(apn.clone(), kinds.clone());
        // set once the remote rejects our credentials
        let mut remote_halted = false;

        for kind in kinds {
            if cancel.is_cancelled() {
                return Err(CollectError::Cancelled);
            }

            if self.use_cache {
                if let Some(payload) = self.cached(apn, kind) {
                    self.stats.increment_info(InfoType::CacheHit);
                    result.record(payload, DataSource::Cache);
                    continue;
                }
            }

            let mut try_browser = true;
            if let Some(remote) = &self.remote {
                if remote_halted {
                    result.record_error(kind, DataSource::Remote, SourceError::Unauthorized);
                    try_browser = false;
                } else {
                    match or_cancelled!(cancel, remote.fetch(apn, kind)) {
                        Ok(payload) => {
                            self.persist(&mut result, payload, DataSource::Remote, cancel).await?;
                            continue;
                        }
                        Err(error) => {
                            update_error_stats(&self.stats, DataSource::Remote, &error);
                            if error == SourceError::Unauthorized {
                                log::error!("Remote service rejected credentials; no further remote calls for {apn}");
                                remote_halted = true;
                            }
                            try_browser = error.allows_fallback();
                            result.record_error(kind, DataSource::Remote, error);
                        }
                    }
                }
            }

            let Some(browser) = self.browser.as_ref().filter(|_| try_browser) else {
                continue;
            };
            if self.remote.is_some() {
                self.stats.increment_info(InfoType::FallbackToScrape);
                log::info!("Falling back to browser automation for {kind} of {apn}");
            }
            if cancel.is_cancelled() {
                return Err(CollectError::Cancelled);
            }
            match or_cancelled!(cancel, browser.scrape(apn, kind)) {
                Ok(payload) => {
                    self.persist(&mut result, payload, DataSource::Scrape, cancel).await?;
                }
                Err(error) => {
                    update_error_stats(&self.stats, DataSource::Scrape, &error);
                    result.record_error(kind, DataSource::Scrape, error);
                }
            }
        }

        if result.has_fresh_data() {
            self.refresh_cache(&result);
        }
        log::debug!(
            "Collection of {apn} finished: {:?} from {:?}, {} error(s)",
            result.outcome(),
            result.sources(),
            result.errors.len()
        );
        Ok(result)
    }

    fn cached(&self, apn: &Apn, kind: DataKind) -> Option<NormalizedPayload> {
        let value = self.cache.get(&Fingerprint::for_kind(apn, kind))?;
        match serde_json::from_value::<NormalizedPayload>(value) {
            Ok(payload) if payload.kind() == kind => Some(payload),
            Ok(_) | Err(_) => {
                log::warn!("Discarding unreadable cache entry for {kind} of {apn}");
                None
            }
        }
    }

    /// Writes a fresh payload through the store and records it. A storage
    /// failure is recorded but the payload is kept for the caller; it is not
    /// cached, so the next collection fetches it again.
    async fn persist(
        &self,
        result: &mut CollectionResult,
        payload: NormalizedPayload,
        source: DataSource,
        cancel: &CancellationToken,
    ) -> Result<(), CollectError> {
        if cancel.is_cancelled() {
            return Err(CollectError::Cancelled);
        }
        let kind = payload.kind();
        let written = match &payload {
            NormalizedPayload::Property(record) => self.storage.upsert_property(record).await,
            NormalizedPayload::Tax(rows) => {
                let dependents: Vec<_> = rows.iter().cloned().map(DependentRecord::Tax).collect();
                self.storage.upsert_dependents(&dependents).await
            }
            NormalizedPayload::Sales(rows) => {
                let dependents: Vec<_> = rows.iter().cloned().map(DependentRecord::Sales).collect();
                self.storage.upsert_dependents(&dependents).await
            }
        };
        if let Err(e) = written {
            log::warn!("Failed to persist {kind} of {}: {e}", result.apn);
            let error = SourceError::Storage(e.to_string());
            update_error_stats(&self.stats, source, &error);
            result.record_error(kind, source, error);
        }
        result.record(payload, source);
        Ok(())
    }

    /// Drops every cache entry derived from the APN, then re-caches what this
    /// collection produced and the store accepted.
    fn refresh_cache(&self, result: &CollectionResult) {
        self.cache.invalidate(&result.apn);
        for (kind, payload) in &result.data {
            if result.write_failed(*kind) {
                continue;
            }
            match serde_json::to_value(payload) {
                Ok(value) => self.cache.put(
                    Fingerprint::for_kind(&result.apn, *kind),
                    [result.apn.as_str()],
                    value,
                    None,
                ),
                Err(e) => log::warn!("Could not cache {kind} of {}: {e}", result.apn),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::config::ScrapeConfig;
    use crate::error_handling::ErrorType;
    use crate::models::{SalesRecord, SearchCriteria, TaxRecord};
    use crate::scrape::{BrowserEngine, BrowserSession};
    use crate::test_helpers::{create_test_storage, sample_payload, FakeRemote};

    /// Engine whose pages always carry one tax row and one sale.
    struct StaticPages;

    struct StaticSession;

    #[async_trait]
    impl BrowserEngine for StaticPages {
        async fn open_session(&self) -> Result<Box<dyn BrowserSession>, SourceError> {
            Ok(Box::new(StaticSession))
        }
    }

    #[async_trait]
    impl BrowserSession for StaticSession {
        async fn render(&mut self, _url: &str, _timeout: Duration) -> Result<String, SourceError> {
            Ok(r#"<html><body>
                <table id="tax-history"><tbody><tr><td>2023</td><td>1</td><td>2</td><td>2</td></tr></tbody></table>
                <table id="sales-history"><tbody><tr><td>2020-05-01</td><td>$100</td><td>B</td><td>S</td><td>WD</td><td>D1</td></tr></tbody></table>
            </body></html>"#
                .to_string())
        }

        async fn close(&mut self) {}
    }

    fn apn() -> Apn {
        Apn::parse("13238011").unwrap()
    }

    fn property() -> NormalizedPayload {
        sample_payload(&apn(), DataKind::Property)
    }

    async fn orchestrator(dir: &TempDir) -> (SourceOrchestrator, StorageManager, Arc<ResultCache>, Arc<ProcessingStats>) {
        let storage = create_test_storage(dir, 2).await;
        let cache = Arc::new(ResultCache::new(Duration::from_secs(60), None));
        let stats = Arc::new(ProcessingStats::new());
        let orchestrator = SourceOrchestrator::new(storage.clone(), Arc::clone(&cache), Arc::clone(&stats))
            .with_browser(Arc::new(BrowserSource::new(
                ScrapeConfig::default(),
                Arc::new(StaticPages),
            )));
        (orchestrator, storage, cache, stats)
    }

    #[tokio::test]
    async fn test_remote_not_found_falls_back_to_scrape() {
        let dir = TempDir::new().unwrap();
        let (orchestrator, storage, _, stats) = orchestrator(&dir).await;
        let orchestrator = orchestrator.with_remote(Arc::new(FakeRemote::scripted(vec![])));

        let result = orchestrator
            .collect(&apn(), &[DataKind::Tax], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.sources(), vec![DataSource::Scrape]);
        assert_eq!(result.outcome(), CollectionOutcome::Collected);
        assert_eq!(stats.get_info_count(InfoType::FallbackToScrape), 1);
        assert_eq!(stats.get_error_count(ErrorType::RemoteNotFound), 1);

        // persisted under a stub parent
        let stored = storage.query(&apn()).await.unwrap();
        assert_eq!(stored.tax_history.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_remote_failure_does_not_fall_back() {
        let dir = TempDir::new().unwrap();
        let (orchestrator, _, _, _) = orchestrator(&dir).await;
        let orchestrator = orchestrator.with_remote(Arc::new(FakeRemote::scripted(vec![(
            DataKind::Tax,
            Err(SourceError::Transient("502".into())),
        )])));

        let result = orchestrator
            .collect(&apn(), &[DataKind::Tax], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.outcome(), CollectionOutcome::NoData);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].source, DataSource::Remote);
    }

    #[tokio::test]
    async fn test_second_collection_is_served_from_cache() {
        let dir = TempDir::new().unwrap();
        let (orchestrator, _, _, stats) = orchestrator(&dir).await;
        let remote = Arc::new(FakeRemote::scripted(vec![(DataKind::Property, Ok(property()))]));
        let orchestrator = orchestrator.with_remote(remote.clone());

        let first = orchestrator
            .collect(&apn(), &[DataKind::Property], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.sources(), vec![DataSource::Remote]);

        let second = orchestrator
            .collect(&apn(), &[DataKind::Property], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.sources(), vec![DataSource::Cache]);
        assert_eq!(second.data[&DataKind::Property], first.data[&DataKind::Property]);
        assert_eq!(remote.call_count(), 1);
        assert_eq!(stats.get_info_count(InfoType::CacheHit), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_stops_remote_calls() {
        let dir = TempDir::new().unwrap();
        let (orchestrator, _, _, _) = orchestrator(&dir).await;
        let remote = Arc::new(FakeRemote::scripted(vec![
            (DataKind::Property, Err(SourceError::Unauthorized)),
            (DataKind::Tax, Ok(NormalizedPayload::Tax(vec![TaxRecord::default()]))),
        ]));
        let orchestrator = orchestrator.with_remote(remote.clone());

        let result = orchestrator
            .collect(&apn(), &DataKind::ALL, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(remote.call_count(), 1);
        assert_eq!(result.outcome(), CollectionOutcome::NoData);
        assert!(result
            .errors
            .iter()
            .all(|e| e.error == SourceError::Unauthorized));
        assert_eq!(result.errors.len(), 3);
    }

    #[tokio::test]
    async fn test_fresh_fetch_invalidates_stale_entries() {
        let dir = TempDir::new().unwrap();
        let (orchestrator, _, cache, _) = orchestrator(&dir).await;
        let stale_search = Fingerprint::for_search(&SearchCriteria {
            owner_contains: Some("smith".into()),
            ..Default::default()
        });
        cache.put(stale_search.clone(), ["13238011"], serde_json::json!([]), None);

        let sale = SalesRecord {
            apn: "13238011".into(),
            sale_date: "2020-05-01".into(),
            ..Default::default()
        };
        let orchestrator = orchestrator.with_remote(Arc::new(FakeRemote::scripted(vec![
            (DataKind::Property, Ok(property())),
            (DataKind::Sales, Ok(NormalizedPayload::Sales(vec![sale]))),
        ])));
        orchestrator
            .collect(&apn(), &[DataKind::Sales, DataKind::Property], &CancellationToken::new())
            .await
            .unwrap();

        assert!(cache.get(&stale_search).is_none());
        assert!(cache.get(&Fingerprint::for_kind(&apn(), DataKind::Sales)).is_some());
        assert!(cache.get(&Fingerprint::for_kind(&apn(), DataKind::Property)).is_some());
    }

    #[tokio::test]
    async fn test_failed_write_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let storage = StorageManager::open(&dir.path().join("records.db"), 1, Duration::from_millis(100))
            .await
            .unwrap();
        let cache = Arc::new(ResultCache::new(Duration::from_secs(60), None));
        let remote = Arc::new(FakeRemote::scripted(vec![(DataKind::Property, Ok(property()))]));
        let orchestrator =
            SourceOrchestrator::new(storage.clone(), Arc::clone(&cache), Arc::new(ProcessingStats::new()))
                .with_remote(remote.clone());

        // the only connection is busy for the whole first collection
        let held = storage.lease().await.unwrap();
        let first = orchestrator
            .collect(&apn(), &[DataKind::Property], &CancellationToken::new())
            .await
            .unwrap();
        assert!(first.data.contains_key(&DataKind::Property));
        assert!(matches!(first.errors[0].error, SourceError::Storage(_)));
        assert!(cache.get(&Fingerprint::for_kind(&apn(), DataKind::Property)).is_none());
        drop(held);

        let second = orchestrator
            .collect(&apn(), &[DataKind::Property], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.sources(), vec![DataSource::Remote]);
        assert!(second.errors.is_empty());
        assert_eq!(remote.call_count(), 2);
        assert!(storage.query(&apn()).await.is_ok());
        assert!(cache.get(&Fingerprint::for_kind(&apn(), DataKind::Property)).is_some());
    }

    #[tokio::test]
    async fn test_disabled_sources_are_skipped() {
        let dir = TempDir::new().unwrap();
        let (orchestrator, _, _, _) = orchestrator(&dir).await;
        let remote = Arc::new(FakeRemote::scripted(vec![(DataKind::Property, Ok(property()))]));
        let orchestrator = orchestrator
            .with_remote(remote.clone())
            .restrict_to(&[DataSource::Scrape, DataSource::Cache]);

        let result = orchestrator
            .collect(&apn(), &[DataKind::Sales], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(remote.call_count(), 0);
        assert_eq!(result.sources(), vec![DataSource::Scrape]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let (orchestrator, _, _, _) = orchestrator(&dir).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            orchestrator.collect(&apn(), &[DataKind::Tax], &cancel).await,
            Err(CollectError::Cancelled)
        ));
    }
}
