//! Job records and their public snapshots.

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::models::{Apn, DataKind, Priority};
use crate::orchestrator::{CollectionOutcome, CollectionSummary};

/// Identifier of a submitted collection. Never reused within one scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a job: `Queued -> Running -> Completed | Failed`, or one of
/// the terminal shortcuts `Deduplicated` / `Cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed { outcome: CollectionOutcome },
    Failed { error: String },
    /// Merged into an earlier job for the same APN
    Deduplicated { into: JobId },
    Cancelled,
}

impl JobStatus {
    /// Queued or running.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn is_finished(&self) -> bool {
        !self.is_active()
    }
}

/// Internal job record, owned by the scheduler state.
#[derive(Debug)]
pub(crate) struct CollectionJob {
    pub id: JobId,
    pub apn: Apn,
    pub kinds: Vec<DataKind>,
    pub priority: Priority,
    /// FIFO tie-breaker within a priority
    pub sequence: u64,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Monotonic finish time, for retention
    pub finished: Option<Instant>,
    pub status: JobStatus,
    pub worker: Option<usize>,
    pub cancel: CancellationToken,
    pub summary: Option<CollectionSummary>,
}

impl CollectionJob {
    pub fn new(
        id: JobId,
        apn: Apn,
        kinds: Vec<DataKind>,
        priority: Priority,
        sequence: u64,
        cancel: CancellationToken,
    ) -> Self {
        CollectionJob {
            id,
            apn,
            kinds,
            priority,
            sequence,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            finished: None,
            status: JobStatus::Queued,
            worker: None,
            cancel,
            summary: None,
        }
    }

    pub fn finish(&mut self, status: JobStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.finished = Some(Instant::now());
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let stamp = |t: &DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Millis, true);
        JobSnapshot {
            id: self.id,
            apn: self.apn.clone(),
            kinds: self.kinds.clone(),
            priority: self.priority,
            status: self.status.clone(),
            worker: self.worker,
            submitted_at: stamp(&self.submitted_at),
            started_at: self.started_at.as_ref().map(stamp),
            finished_at: self.finished_at.as_ref().map(stamp),
            summary: self.summary.clone(),
        }
    }
}

/// Read-only view of a job, safe to hand to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub apn: Apn,
    pub kinds: Vec<DataKind>,
    pub priority: Priority,
    pub status: JobStatus,
    /// Index of the worker that ran the job
    pub worker: Option<usize>,
    pub submitted_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub summary: Option<CollectionSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        let status = JobStatus::Deduplicated { into: JobId(4) };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["state"], "deduplicated");
        assert_eq!(value["into"], 4);

        let value = serde_json::to_value(JobStatus::Completed {
            outcome: CollectionOutcome::NoData,
        })
        .unwrap();
        assert_eq!(value["outcome"], "no_data");
    }

    #[test]
    fn test_finish_stamps_times() {
        let mut job = CollectionJob::new(
            JobId(1),
            Apn::parse("1").unwrap(),
            DataKind::ALL.to_vec(),
            Priority::Normal,
            0,
            CancellationToken::new(),
        );
        assert!(job.status.is_active());
        job.finish(JobStatus::Cancelled);
        assert!(job.status.is_finished());
        let snapshot = job.snapshot();
        assert!(snapshot.finished_at.is_some());
        assert!(snapshot.started_at.is_none());
    }
}
