//! Background Collection Scheduler.
//!
//! Accepts collection requests, deduplicates them per APN, orders them by
//! priority and runs them on a fixed pool of Tokio worker tasks. Clients
//! never wait on a running collection: they poll `status` or listen on the
//! completion broadcast.

mod events;
mod job;
mod queue;
mod state;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::ResultCache;
use crate::config::{
    EngineConfig, DEFAULT_EVENT_CAPACITY, DEFAULT_JOB_RETENTION, DEFAULT_JOB_TIMEOUT,
    DEFAULT_WORKERS,
};
use crate::error_handling::{CollectError, ConstructionError, InfoType, ProcessingStats};
use crate::models::{Apn, DataKind, DataSource, Priority};
use crate::orchestrator::SourceOrchestrator;
use crate::remote::RemoteSource;
use crate::scrape::BrowserSource;
use crate::storage::StorageManager;

pub use events::{CompletionEvent, JobOutcome};
pub use job::{JobId, JobSnapshot, JobStatus};
pub use state::SchedulerStats;

use state::{Admission, Cancellation, SchedulerState};
use worker::{run_worker, Shared};

/// Scheduler tuning, usually taken from `EngineConfig`.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub job_timeout: Duration,
    pub job_retention: Duration,
    pub event_capacity: usize,
    pub sources: Vec<DataSource>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            job_retention: DEFAULT_JOB_RETENTION,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            sources: vec![DataSource::Cache, DataSource::Remote, DataSource::Scrape],
        }
    }
}

impl From<&EngineConfig> for SchedulerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            workers: config.workers,
            job_timeout: config.job_timeout,
            job_retention: config.job_retention,
            event_capacity: config.event_capacity,
            sources: config.sources.clone(),
        }
    }
}

/// Builder for [`CollectionScheduler`].
///
/// The remote source, storage and cache are required. `build` refuses to
/// produce a scheduler without them.
#[derive(Default)]
pub struct SchedulerBuilder {
    remote: Option<Arc<dyn RemoteSource>>,
    browser: Option<Arc<BrowserSource>>,
    storage: Option<StorageManager>,
    cache: Option<Arc<ResultCache>>,
    stats: Option<Arc<ProcessingStats>>,
    config: SchedulerConfig,
}

impl SchedulerBuilder {
    pub fn remote(mut self, remote: Arc<dyn RemoteSource>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn browser(mut self, browser: Arc<BrowserSource>) -> Self {
        self.browser = Some(browser);
        self
    }

    pub fn storage(mut self, storage: StorageManager) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Shares processing counters with the caller. A private set is created
    /// when omitted.
    pub fn stats(mut self, stats: Arc<ProcessingStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn config(mut self, config: impl Into<SchedulerConfig>) -> Self {
        self.config = config.into();
        self
    }

    /// Validates the collaborators and spawns the workers. Must be called
    /// inside a Tokio runtime.
    pub fn build(self) -> Result<CollectionScheduler, ConstructionError> {
        let remote = self.remote.ok_or(ConstructionError::MissingRemoteSource)?;
        remote.validate()?;
        let storage = self
            .storage
            .ok_or(ConstructionError::MissingDependency("storage manager"))?;
        let cache = self
            .cache
            .ok_or(ConstructionError::MissingDependency("result cache"))?;
        let config = self.config;
        if config.workers == 0 {
            return Err(ConstructionError::InvalidConfig(
                "workers must be at least 1".into(),
            ));
        }
        if config.event_capacity == 0 {
            return Err(ConstructionError::InvalidConfig(
                "event_capacity must be at least 1".into(),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| ConstructionError::MissingDependency("tokio runtime"))?;

        let stats = self.stats.unwrap_or_else(|| Arc::new(ProcessingStats::new()));
        let mut orchestrator = SourceOrchestrator::new(storage, cache, Arc::clone(&stats)).with_remote(remote);
        if let Some(browser) = self.browser {
            orchestrator = orchestrator.with_browser(browser);
        }
        let orchestrator = orchestrator.restrict_to(&config.sources);

        let (events, _) = broadcast::channel(config.event_capacity);
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState::new(config.job_retention)),
            wakeup: Notify::new(),
            events,
            shutdown: CancellationToken::new(),
            orchestrator,
            job_timeout: config.job_timeout,
            stats,
        });

        let workers = (0..config.workers)
            .map(|index| runtime.spawn(run_worker(index, Arc::clone(&shared))))
            .collect();
        log::info!("Collection scheduler started with {} workers", config.workers);

        Ok(CollectionScheduler {
            shared,
            workers: Mutex::new(workers),
        })
    }
}

/// Handle to the running scheduler.
pub struct CollectionScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CollectionScheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    /// Queues a collection of every data kind.
    pub fn submit(&self, apn: &str, priority: Priority) -> Result<JobId, CollectError> {
        self.submit_kinds(apn, &DataKind::ALL, priority)
    }

    /// Queues a collection of `kinds`. Returns immediately.
    ///
    /// When a job for the same APN is already queued or running, the new
    /// request is recorded as `Deduplicated` and the existing job inherits
    /// the higher priority (and, while still queued, the extra kinds).
    pub fn submit_kinds(
        &self,
        apn: &str,
        kinds: &[DataKind],
        priority: Priority,
    ) -> Result<JobId, CollectError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(CollectError::Shutdown);
        }
        let apn = Apn::parse(apn)?;
        if kinds.is_empty() {
            return Err(CollectError::InvalidRecord(
                "at least one data kind must be requested".into(),
            ));
        }
        let mut kinds = kinds.to_vec();
        kinds.sort();
        kinds.dedup();

        let cancel = self.shared.shutdown.child_token();
        let admission = self
            .shared
            .state
            .lock()
            .admit(apn.clone(), kinds, priority, cancel);
        match admission {
            Admission::Queued(id) => {
                log::debug!("Queued collection {id} for {apn} at {priority:?}");
                self.shared.wakeup.notify_one();
                Ok(id)
            }
            Admission::Deduplicated { id, into } => {
                log::debug!("Collection {id} for {apn} merged into {into}");
                self.shared.stats.increment_info(InfoType::JobDeduplicated);
                Ok(id)
            }
        }
    }

    /// Cancels a queued or running job. Queued jobs end immediately; running
    /// ones stop at their next cancellation point. Returns false for unknown
    /// or finished jobs.
    pub fn cancel(&self, id: JobId) -> bool {
        let cancellation = self.shared.state.lock().cancel(id);
        match cancellation {
            Cancellation::Dequeued(snapshot) => {
                self.shared.stats.increment_info(InfoType::JobCancelled);
                self.shared.publish(snapshot, JobOutcome::Cancelled);
                true
            }
            Cancellation::Signalled => true,
            Cancellation::NotActive => false,
        }
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.shared.state.lock().status(id)
    }

    pub fn job(&self, id: JobId) -> Option<JobSnapshot> {
        self.shared.state.lock().job(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CompletionEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.state.lock().stats()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Stops accepting work, cancels queued and running jobs, and waits for
    /// the workers to exit.
    pub async fn shutdown(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        self.shared.shutdown.cancel();

        let queued = {
            let mut state = self.shared.state.lock();
            state.clear_queue();
            state.queued_ids()
        };
        for id in queued {
            self.shared.complete(id, JobStatus::Cancelled, None);
        }

        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                log::warn!("Collection worker ended abnormally: {e}");
            }
        }
        log::info!("Collection scheduler stopped");
    }
}

impl Drop for CollectionScheduler {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    use crate::error_handling::SourceError;
    use crate::models::NormalizedPayload;
    use crate::orchestrator::CollectionOutcome;
    use crate::test_helpers::{create_test_storage, sample_payload, FakeRemote};

    async fn build(
        dir: &TempDir,
        remote: Arc<FakeRemote>,
        workers: usize,
    ) -> CollectionScheduler {
        let storage = create_test_storage(dir, 4).await;
        CollectionScheduler::builder()
            .remote(remote)
            .storage(storage)
            .cache(Arc::new(ResultCache::new(Duration::from_secs(60), None)))
            .config(SchedulerConfig {
                workers,
                job_timeout: Duration::from_secs(5),
                sources: vec![DataSource::Cache, DataSource::Remote],
                ..Default::default()
            })
            .build()
            .unwrap()
    }

    async fn wait_for(scheduler: &CollectionScheduler, id: JobId) -> JobStatus {
        for _ in 0..200 {
            if let Some(status) = scheduler.status(id) {
                if status.is_finished() {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not finish");
    }

    #[tokio::test]
    async fn test_missing_remote_is_a_construction_error() {
        let dir = TempDir::new().unwrap();
        let storage = create_test_storage(&dir, 1).await;
        let result = CollectionScheduler::builder()
            .storage(storage)
            .cache(Arc::new(ResultCache::new(Duration::from_secs(60), None)))
            .build();
        assert!(matches!(result, Err(ConstructionError::MissingRemoteSource)));
    }

    #[tokio::test]
    async fn test_invalid_remote_is_a_construction_error() {
        let dir = TempDir::new().unwrap();
        let storage = create_test_storage(&dir, 1).await;
        let result = CollectionScheduler::builder()
            .remote(Arc::new(FakeRemote::complete().invalid()))
            .storage(storage)
            .cache(Arc::new(ResultCache::new(Duration::from_secs(60), None)))
            .build();
        assert!(matches!(result, Err(ConstructionError::InvalidRemoteSource(_))));
    }

    #[tokio::test]
    async fn test_missing_storage_and_zero_workers() {
        let result = CollectionScheduler::builder()
            .remote(Arc::new(FakeRemote::complete()))
            .cache(Arc::new(ResultCache::new(Duration::from_secs(60), None)))
            .build();
        assert!(matches!(result, Err(ConstructionError::MissingDependency(_))));

        let dir = TempDir::new().unwrap();
        let storage = create_test_storage(&dir, 1).await;
        let result = CollectionScheduler::builder()
            .remote(Arc::new(FakeRemote::complete()))
            .storage(storage)
            .cache(Arc::new(ResultCache::new(Duration::from_secs(60), None)))
            .config(SchedulerConfig {
                workers: 0,
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(ConstructionError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_run_once() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FakeRemote::complete().with_delay(Duration::from_millis(50)));
        let scheduler = build(&dir, remote.clone(), 3).await;

        let first = scheduler.submit("13238011", Priority::Normal).unwrap();
        let second = scheduler.submit("13238011", Priority::High).unwrap();
        assert_ne!(first, second);
        assert_eq!(
            scheduler.status(second),
            Some(JobStatus::Deduplicated { into: first })
        );

        assert!(matches!(wait_for(&scheduler, first).await, JobStatus::Completed { .. }));
        // one job ran: one fetch per kind
        assert_eq!(remote.call_count(), DataKind::ALL.len());
        let stats = scheduler.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.deduplicated, 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_priority_order_with_single_worker() {
        let dir = TempDir::new().unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let remote = Arc::new(FakeRemote::complete().gated("blocker", Arc::clone(&gate)));
        let scheduler = build(&dir, remote.clone(), 1).await;

        let blocker = scheduler
            .submit_kinds("blocker", &[DataKind::Property], Priority::Normal)
            .unwrap();
        // the worker is now parked on the gate
        for _ in 0..100 {
            if remote.in_flight() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let low = scheduler.submit_kinds("low", &[DataKind::Property], Priority::Low).unwrap();
        let normal = scheduler
            .submit_kinds("normal", &[DataKind::Property], Priority::Normal)
            .unwrap();
        let critical = scheduler
            .submit_kinds("critical", &[DataKind::Property], Priority::Critical)
            .unwrap();
        gate.add_permits(1);

        for id in [blocker, low, normal, critical] {
            wait_for(&scheduler, id).await;
        }
        assert_eq!(remote.apn_order(), vec!["blocker", "critical", "normal", "low"]);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let dir = TempDir::new().unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let remote = Arc::new(FakeRemote::complete().gated("blocker", Arc::clone(&gate)));
        let scheduler = build(&dir, remote.clone(), 1).await;
        let mut events = scheduler.subscribe();

        let blocker = scheduler
            .submit_kinds("blocker", &[DataKind::Property], Priority::Normal)
            .unwrap();
        let queued = scheduler.submit("100", Priority::Low).unwrap();
        assert!(scheduler.cancel(queued));
        assert_eq!(scheduler.status(queued), Some(JobStatus::Cancelled));
        assert!(!scheduler.cancel(queued));

        let event = events.recv().await.unwrap();
        assert_eq!(event.job_id, queued);
        assert_eq!(event.outcome, JobOutcome::Cancelled);

        gate.add_permits(1);
        assert!(matches!(wait_for(&scheduler, blocker).await, JobStatus::Completed { .. }));
        assert!(remote.calls().iter().all(|(apn, _)| apn == "blocker"));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let dir = TempDir::new().unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let remote = Arc::new(FakeRemote::complete().gated("blocker", Arc::clone(&gate)));
        let scheduler = build(&dir, remote.clone(), 1).await;

        let running = scheduler
            .submit_kinds("blocker", &[DataKind::Property], Priority::Normal)
            .unwrap();
        for _ in 0..100 {
            if scheduler.status(running) == Some(JobStatus::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(scheduler.cancel(running));
        assert_eq!(wait_for(&scheduler, running).await, JobStatus::Cancelled);
        scheduler.shutdown().await;
    }

    async fn final_status(answers: Vec<(DataKind, Result<NormalizedPayload, SourceError>)>) -> JobStatus {
        let dir = TempDir::new().unwrap();
        let scheduler = build(&dir, Arc::new(FakeRemote::scripted(answers)), 1).await;
        let id = scheduler.submit("13238011", Priority::Normal).unwrap();
        let status = wait_for(&scheduler, id).await;
        scheduler.shutdown().await;
        status
    }

    #[tokio::test]
    async fn test_unknown_parcel_completes_with_no_data() {
        assert_eq!(
            final_status(vec![]).await,
            JobStatus::Completed {
                outcome: CollectionOutcome::NoData
            }
        );
    }

    #[tokio::test]
    async fn test_unreachable_remote_fails_job() {
        let unavailable = DataKind::ALL
            .iter()
            .map(|kind| (*kind, Err(SourceError::Transient("503".into()))))
            .collect();
        match final_status(unavailable).await {
            JobStatus::Failed { error } => {
                assert_eq!(error, "property via remote: transient source failure: 503")
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejected_credentials_fail_job() {
        let status = final_status(vec![(DataKind::Property, Err(SourceError::Unauthorized))]).await;
        match status {
            JobStatus::Failed { error } => assert!(error.contains("rejected the credentials")),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_summary() {
        let dir = TempDir::new().unwrap();
        let apn = Apn::parse("13238011").unwrap();
        let remote = Arc::new(FakeRemote::scripted(vec![
            (DataKind::Property, Ok(sample_payload(&apn, DataKind::Property))),
            (DataKind::Tax, Err(SourceError::Transient("503".into()))),
        ]));
        let scheduler = build(&dir, remote, 1).await;
        let mut events = scheduler.subscribe();

        let id = scheduler.submit("13238011", Priority::Normal).unwrap();
        assert!(matches!(wait_for(&scheduler, id).await, JobStatus::Failed { .. }));
        let event = events.recv().await.unwrap();
        assert!(matches!(event.outcome, JobOutcome::Failed { .. }));

        let summary = scheduler.job(id).unwrap().summary.unwrap();
        assert_eq!(summary.outcome, CollectionOutcome::Partial);
        assert_eq!(summary.collected, vec![DataKind::Property]);
        assert_eq!(scheduler.stats().failed, 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_job_timeout_fails_job() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(FakeRemote::complete().with_delay(Duration::from_secs(30)));
        let storage = create_test_storage(&dir, 2).await;
        let scheduler = CollectionScheduler::builder()
            .remote(remote)
            .storage(storage)
            .cache(Arc::new(ResultCache::new(Duration::from_secs(60), None)))
            .config(SchedulerConfig {
                workers: 1,
                job_timeout: Duration::from_millis(100),
                ..Default::default()
            })
            .build()
            .unwrap();

        let id = scheduler.submit("13238011", Priority::Normal).unwrap();
        match wait_for(&scheduler, id).await {
            JobStatus::Failed { error } => assert!(error.contains("timed out")),
            other => panic!("unexpected status {other:?}"),
        }
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_and_blank_apn() {
        let dir = TempDir::new().unwrap();
        let scheduler = build(&dir, Arc::new(FakeRemote::complete()), 1).await;
        assert!(matches!(
            scheduler.submit("   ", Priority::Normal),
            Err(CollectError::InvalidRecord(_))
        ));
        scheduler.shutdown().await;
        assert!(matches!(
            scheduler.submit("1", Priority::Normal),
            Err(CollectError::Shutdown)
        ));
    }
}
