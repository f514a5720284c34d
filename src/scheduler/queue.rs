//! Priority queue of job ids.
//!
//! Ordered by priority, then submission order. Raising a queued job's
//! priority pushes a second entry; the old one is skipped when popped
//! because its priority no longer matches the job.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use super::job::JobId;
use crate::models::Priority;

#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    priority: Priority,
    sequence: Reverse<u64>,
    id: JobId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub(crate) struct JobQueue {
    heap: BinaryHeap<QueueEntry>,
}

impl JobQueue {
    pub fn push(&mut self, id: JobId, priority: Priority, sequence: u64) {
        self.heap.push(QueueEntry {
            priority,
            sequence: Reverse(sequence),
            id,
        });
    }

    /// Pops the best entry for which `current` reports a still-queued job at
    /// the same priority. Stale entries are discarded along the way.
    pub fn pop_live<F>(&mut self, mut current: F) -> Option<JobId>
    where
        F: FnMut(JobId) -> Option<Priority>,
    {
        while let Some(entry) = self.heap.pop() {
            if current(entry.id) == Some(entry.priority) {
                return Some(entry.id);
            }
        }
        None
    }

    /// Number of entries, stale ones included.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}
