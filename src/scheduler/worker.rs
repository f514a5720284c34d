//! Worker loop: claim, run under a timeout in its own task, record.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;

use super::events::{CompletionEvent, JobOutcome};
use super::job::{JobId, JobSnapshot, JobStatus};
use super::state::{Claim, SchedulerState};
use crate::error_handling::{CollectError, ErrorType, InfoType, ProcessingStats, WarningType};
use crate::orchestrator::{CollectionOutcome, CollectionSummary, SourceOrchestrator};

/// State shared by the scheduler handle and its workers.
pub(crate) struct Shared {
    pub state: Mutex<SchedulerState>,
    pub wakeup: Notify,
    pub events: broadcast::Sender<CompletionEvent>,
    pub shutdown: CancellationToken,
    pub orchestrator: SourceOrchestrator,
    pub job_timeout: Duration,
    pub stats: Arc<ProcessingStats>,
}

impl Shared {
    /// Records a terminal status and broadcasts the matching event.
    pub fn complete(&self, claim_id: JobId, status: JobStatus, summary: Option<CollectionSummary>) {
        let outcome = match (&status, &summary) {
            (JobStatus::Completed { .. }, Some(summary)) => JobOutcome::Completed {
                summary: summary.clone(),
            },
            (JobStatus::Failed { error }, _) => JobOutcome::Failed {
                error: error.clone(),
            },
            _ => JobOutcome::Cancelled,
        };

        let snapshot = {
            let mut state = self.state.lock();
            if let Some(summary) = summary {
                state.set_summary(claim_id, summary);
            }
            state.finish(claim_id, status)
        };
        if let Some(snapshot) = snapshot {
            self.publish(snapshot, outcome);
        }
    }

    /// Broadcasts a finished job. Call without holding the state lock.
    pub fn publish(&self, snapshot: JobSnapshot, outcome: JobOutcome) {
        let event = CompletionEvent {
            job_id: snapshot.id,
            apn: snapshot.apn,
            outcome,
        };
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

pub(crate) async fn run_worker(index: usize, shared: Arc<Shared>) {
    log::debug!("Collection worker {index} started");
    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }
        let claim = shared.state.lock().claim(index);
        match claim {
            Some(claim) => run_job(index, &shared, claim).await,
            None => {
                tokio::select! {
                    _ = shared.wakeup.notified() => {}
                    _ = shared.shutdown.cancelled() => break,
                }
            }
        }
    }
    log::debug!("Collection worker {index} stopped");
}

async fn run_job(index: usize, shared: &Arc<Shared>, claim: Claim) {
    let Claim {
        id,
        apn,
        kinds,
        cancel,
    } = claim;
    log::info!("Worker {index} collecting {apn} ({id}, {} kinds)", kinds.len());

    let orchestrator = shared.orchestrator.clone();
    let task_cancel = cancel.clone();
    let task_apn = apn.clone();
    let mut handle =
        tokio::spawn(async move { orchestrator.collect(&task_apn, &kinds, &task_cancel).await });

    let (status, summary) = match tokio::time::timeout(shared.job_timeout, &mut handle).await {
        Ok(Ok(Ok(result))) => {
            let summary = result.summary();
            match summary.outcome {
                CollectionOutcome::Partial => shared.stats.increment_warning(WarningType::PartialCollection),
                CollectionOutcome::NoData => shared.stats.increment_warning(WarningType::NoDataCollected),
                CollectionOutcome::Collected => {}
            }
            // NoData is reserved for parcels every source reported as absent
            let status = match result.failure() {
                Some(failure) => JobStatus::Failed {
                    error: failure.to_string(),
                },
                None => JobStatus::Completed {
                    outcome: summary.outcome,
                },
            };
            (status, Some(summary))
        }
        Ok(Ok(Err(CollectError::Cancelled))) => {
            shared.stats.increment_info(InfoType::JobCancelled);
            (JobStatus::Cancelled, None)
        }
        Ok(Ok(Err(e))) => (JobStatus::Failed { error: e.to_string() }, None),
        Ok(Err(join_error)) if join_error.is_panic() => {
            log::error!("Collection of {apn} ({id}) panicked");
            shared.stats.increment_error(ErrorType::JobPanicked);
            (
                JobStatus::Failed {
                    error: "worker panicked".to_string(),
                },
                None,
            )
        }
        Ok(Err(_)) => (JobStatus::Cancelled, None),
        Err(_) => {
            cancel.cancel();
            handle.abort();
            log::warn!("Collection of {apn} ({id}) timed out after {:?}", shared.job_timeout);
            shared.stats.increment_error(ErrorType::JobTimeout);
            (
                JobStatus::Failed {
                    error: CollectError::Timeout(shared.job_timeout).to_string(),
                },
                None,
            )
        }
    };

    log::info!("Worker {index} finished {apn} ({id}): {status:?}");
    shared.complete(id, status, summary);
}
