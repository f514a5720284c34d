//! Mutable scheduler bookkeeping, always accessed under one lock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::job::{CollectionJob, JobId, JobSnapshot, JobStatus};
use super::queue::JobQueue;
use crate::models::{Apn, DataKind, Priority};
use crate::orchestrator::CollectionSummary;

/// Job counts. `queued` and `running` are current; the rest are totals since
/// the scheduler started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub deduplicated: u64,
    pub cancelled: u64,
}

/// Result of admitting a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Queued(JobId),
    /// Recorded as a duplicate of the active job `into`
    Deduplicated { id: JobId, into: JobId },
}

/// Result of a cancellation request.
pub(crate) enum Cancellation {
    /// The job was still queued and is now finished as `Cancelled`
    Dequeued(JobSnapshot),
    /// The job is running; its worker records the outcome
    Signalled,
    /// Unknown or already finished
    NotActive,
}

/// A job handed to a worker.
pub(crate) struct Claim {
    pub id: JobId,
    pub apn: Apn,
    pub kinds: Vec<DataKind>,
    pub cancel: CancellationToken,
}

pub(crate) struct SchedulerState {
    jobs: HashMap<JobId, CollectionJob>,
    queue: JobQueue,
    /// Queued or running job per APN
    active: HashMap<Apn, JobId>,
    next_id: u64,
    next_sequence: u64,
    totals: SchedulerStats,
    retention: Duration,
}

impl SchedulerState {
    pub fn new(retention: Duration) -> Self {
        SchedulerState {
            jobs: HashMap::new(),
            queue: JobQueue::default(),
            active: HashMap::new(),
            next_id: 1,
            next_sequence: 0,
            totals: SchedulerStats::default(),
            retention,
        }
    }

    fn allocate_id(&mut self) -> JobId {
        let id = JobId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Queues a collection, or folds it into the active job for the same APN.
    pub fn admit(
        &mut self,
        apn: Apn,
        kinds: Vec<DataKind>,
        priority: Priority,
        cancel: CancellationToken,
    ) -> Admission {
        self.purge_expired();
        let id = self.allocate_id();
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let existing = self
            .active
            .get(&apn)
            .copied()
            .filter(|into| self.jobs.get(into).is_some_and(|j| j.status.is_active()));

        if let Some(into) = existing {
            let mut requeue = None;
            if let Some(target) = self.jobs.get_mut(&into) {
                if target.status == JobStatus::Queued {
                    for kind in &kinds {
                        if !target.kinds.contains(kind) {
                            target.kinds.push(*kind);
                        }
                    }
                    target.kinds.sort();
                    if priority > target.priority {
                        target.priority = priority;
                        requeue = Some((priority, target.sequence));
                    }
                } else if priority > target.priority {
                    target.priority = priority;
                }
            }
            if let Some((priority, sequence)) = requeue {
                self.queue.push(into, priority, sequence);
            }

            let mut duplicate = CollectionJob::new(id, apn, kinds, priority, sequence, cancel);
            duplicate.finish(JobStatus::Deduplicated { into });
            self.jobs.insert(id, duplicate);
            self.totals.deduplicated += 1;
            return Admission::Deduplicated { id, into };
        }

        let job = CollectionJob::new(id, apn.clone(), kinds, priority, sequence, cancel);
        self.queue.push(id, priority, sequence);
        self.jobs.insert(id, job);
        self.active.insert(apn, id);
        Admission::Queued(id)
    }

    /// Takes the best queued job and marks it running on `worker`.
    pub fn claim(&mut self, worker: usize) -> Option<Claim> {
        let jobs = &self.jobs;
        let id = self.queue.pop_live(|id| {
            jobs.get(&id)
                .filter(|j| j.status == JobStatus::Queued)
                .map(|j| j.priority)
        })?;
        let job = self.jobs.get_mut(&id)?;
        job.status = JobStatus::Running;
        job.worker = Some(worker);
        job.started_at = Some(Utc::now());
        Some(Claim {
            id,
            apn: job.apn.clone(),
            kinds: job.kinds.clone(),
            cancel: job.cancel.clone(),
        })
    }

    /// Moves a job to a terminal status. Returns its snapshot, or `None` when
    /// the job was unknown or already finished.
    pub fn finish(&mut self, id: JobId, status: JobStatus) -> Option<JobSnapshot> {
        let job = self.jobs.get_mut(&id)?;
        if job.status.is_finished() {
            return None;
        }
        match &status {
            JobStatus::Completed { .. } => self.totals.completed += 1,
            JobStatus::Failed { .. } => self.totals.failed += 1,
            JobStatus::Cancelled => self.totals.cancelled += 1,
            _ => {}
        }
        job.finish(status);
        let snapshot = job.snapshot();
        if self.active.get(&job.apn) == Some(&id) {
            self.active.remove(&job.apn);
        }
        self.purge_expired();
        Some(snapshot)
    }

    pub fn set_summary(&mut self, id: JobId, summary: CollectionSummary) {
        if let Some(job) = self.jobs.get_mut(&id) {
            job.summary = Some(summary);
        }
    }

    pub fn status(&mut self, id: JobId) -> Option<JobStatus> {
        self.purge_expired();
        self.jobs.get(&id).map(|j| j.status.clone())
    }

    pub fn job(&mut self, id: JobId) -> Option<JobSnapshot> {
        self.purge_expired();
        self.jobs.get(&id).map(CollectionJob::snapshot)
    }

    /// Signals the job's token. A queued job is finished on the spot, so no
    /// worker can claim it once this returns.
    pub fn cancel(&mut self, id: JobId) -> Cancellation {
        let Some(job) = self.jobs.get(&id) else {
            return Cancellation::NotActive;
        };
        let (status, token) = (job.status.clone(), job.cancel.clone());
        match status {
            JobStatus::Queued => {
                token.cancel();
                self.finish(id, JobStatus::Cancelled)
                    .map_or(Cancellation::NotActive, Cancellation::Dequeued)
            }
            JobStatus::Running => {
                token.cancel();
                Cancellation::Signalled
            }
            _ => Cancellation::NotActive,
        }
    }

    /// Ids of every queued job.
    pub fn queued_ids(&self) -> Vec<JobId> {
        self.jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .map(|j| j.id)
            .collect()
    }

    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = self.totals.clone();
        for job in self.jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                _ => {}
            }
        }
        stats
    }

    /// Drops finished jobs older than the retention period.
    fn purge_expired(&mut self) {
        let now = Instant::now();
        let retention = self.retention;
        self.jobs.retain(|_, job| match job.finished {
            Some(at) => now.duration_since(at) < retention,
            None => true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apn(raw: &str) -> Apn {
        Apn::parse(raw).unwrap()
    }

    fn state() -> SchedulerState {
        SchedulerState::new(Duration::from_secs(600))
    }

    #[test]
    fn test_duplicate_raises_priority_and_merges_kinds() {
        let mut state = state();
        let first = state.admit(apn("1"), vec![DataKind::Tax], Priority::Low, CancellationToken::new());
        let Admission::Queued(first) = first else {
            panic!("first submission should queue");
        };
        state.admit(apn("2"), vec![DataKind::Tax], Priority::Normal, CancellationToken::new());

        let second = state.admit(
            apn("1"),
            vec![DataKind::Sales],
            Priority::Critical,
            CancellationToken::new(),
        );
        let Admission::Deduplicated { id, into } = second else {
            panic!("second submission should be deduplicated");
        };
        assert_eq!(into, first);
        assert_eq!(state.status(id), Some(JobStatus::Deduplicated { into: first }));

        let claim = state.claim(0).unwrap();
        assert_eq!(claim.id, first);
        assert_eq!(claim.kinds, vec![DataKind::Tax, DataKind::Sales]);
        assert_eq!(state.stats().deduplicated, 1);
    }

    #[test]
    fn test_finished_job_frees_the_apn() {
        let mut state = state();
        let Admission::Queued(first) =
            state.admit(apn("1"), DataKind::ALL.to_vec(), Priority::Normal, CancellationToken::new())
        else {
            panic!("should queue");
        };
        state.claim(0).unwrap();
        assert!(state.finish(first, JobStatus::Failed { error: "x".into() }).is_some());
        // a second finish is ignored
        assert!(state.finish(first, JobStatus::Cancelled).is_none());

        let again = state.admit(apn("1"), DataKind::ALL.to_vec(), Priority::Normal, CancellationToken::new());
        assert!(matches!(again, Admission::Queued(_)));
        let stats = state.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cancelled, 0);
        assert_eq!(stats.queued, 1);
    }

    #[test]
    fn test_cancel_queued_job_is_never_claimed() {
        let mut state = state();
        let token = CancellationToken::new();
        let Admission::Queued(id) =
            state.admit(apn("1"), vec![DataKind::Tax], Priority::Normal, token.clone())
        else {
            panic!("should queue");
        };

        let Cancellation::Dequeued(snapshot) = state.cancel(id) else {
            panic!("queued job should be dequeued");
        };
        assert_eq!(snapshot.id, id);
        assert_eq!(snapshot.status, JobStatus::Cancelled);
        assert!(token.is_cancelled());
        assert!(state.claim(0).is_none());
        assert!(matches!(state.cancel(id), Cancellation::NotActive));

        let again = state.admit(apn("1"), vec![DataKind::Tax], Priority::Normal, CancellationToken::new());
        assert!(matches!(again, Admission::Queued(_)));
    }

    #[test]
    fn test_cancel_running_job_keeps_the_apn_busy() {
        let mut state = state();
        let token = CancellationToken::new();
        let Admission::Queued(id) =
            state.admit(apn("1"), vec![DataKind::Tax], Priority::Normal, token.clone())
        else {
            panic!("should queue");
        };
        state.claim(0).unwrap();

        assert!(matches!(state.cancel(id), Cancellation::Signalled));
        assert!(token.is_cancelled());
        assert_eq!(state.status(id), Some(JobStatus::Running));

        // until the worker finishes it, the APN still belongs to the job
        let duplicate = state.admit(apn("1"), vec![DataKind::Tax], Priority::High, CancellationToken::new());
        assert!(matches!(duplicate, Admission::Deduplicated { into, .. } if into == id));
        assert_eq!(state.stats().cancelled, 0);
    }

    #[test]
    fn test_retention_purges_finished_jobs() {
        let mut state = SchedulerState::new(Duration::ZERO);
        let Admission::Queued(id) =
            state.admit(apn("1"), vec![DataKind::Tax], Priority::Normal, CancellationToken::new())
        else {
            panic!("should queue");
        };
        state.finish(id, JobStatus::Cancelled);
        assert_eq!(state.status(id), None);
        assert_eq!(state.stats().cancelled, 1);
    }
}
