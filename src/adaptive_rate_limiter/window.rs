//! Sliding window of remote call outcomes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// How a single remote call ended, as far as throttling is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallOutcome {
    Accepted,
    /// HTTP 429 from the provider
    Throttled,
    /// Timeout or 5xx
    Degraded,
}

impl CallOutcome {
    fn is_pressure(self) -> bool {
        !matches!(self, CallOutcome::Accepted)
    }
}

/// Bounded, time-limited record of recent outcomes.
pub(crate) struct OutcomeWindow {
    entries: Mutex<VecDeque<(Instant, CallOutcome)>>,
    capacity: usize,
    span: Duration,
}

impl OutcomeWindow {
    pub(crate) fn new(capacity: usize, span: Duration) -> Self {
        OutcomeWindow {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            span,
        }
    }

    pub(crate) fn record(&self, outcome: CallOutcome) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Self::evict_stale(&mut entries, now, self.span);
        entries.push_back((now, outcome));
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Returns `(samples, pressure_ratio)` over the live part of the window.
    pub(crate) fn summary(&self) -> (usize, f64) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Self::evict_stale(&mut entries, now, self.span);

        let samples = entries.len();
        if samples == 0 {
            return (0, 0.0);
        }
        let pressured = entries.iter().filter(|(_, o)| o.is_pressure()).count();
        (samples, pressured as f64 / samples as f64)
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    fn evict_stale(entries: &mut VecDeque<(Instant, CallOutcome)>, now: Instant, span: Duration) {
        while let Some((at, _)) = entries.front() {
            if now.duration_since(*at) > span {
                entries.pop_front();
            } else {
                break;
            }
        }
    }
}
