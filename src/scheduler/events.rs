use serde::Serialize;

use super::job::JobId;
use crate::models::Apn;
use crate::orchestrator::CollectionSummary;

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed { summary: CollectionSummary },
    Failed { error: String },
    Cancelled,
}

/// Broadcast when a job reaches a terminal state. Deduplicated jobs do not
/// produce an event; their target job does.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionEvent {
    pub job_id: JobId,
    pub apn: Apn,
    pub outcome: JobOutcome,
}
