use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use super::window::{CallOutcome, OutcomeWindow};
use crate::initialization::RateLimiter;

/// Tuning for `AdaptiveRateLimiter`.
#[derive(Debug, Clone)]
pub struct AdaptiveSettings {
    pub min_rps: u32,
    pub max_rps: u32,
    /// Pressure ratio above which the rate is halved
    pub error_threshold: f64,
    pub window_capacity: usize,
    pub window_span: Duration,
    /// Samples required before any adjustment
    pub min_samples: usize,
}

impl AdaptiveSettings {
    /// Settings that never push above the configured provider rate.
    pub fn capped_at(rps: u32, error_threshold: f64) -> Self {
        AdaptiveSettings {
            min_rps: 1,
            max_rps: rps.max(1),
            error_threshold,
            window_capacity: 100,
            window_span: Duration::from_secs(60),
            min_samples: 10,
        }
    }
}

/// Throttle controller for the remote provider.
///
/// Halves the request rate when throttling and timeouts exceed the threshold
/// and creeps back up once they fall below half of it, never exceeding the
/// configured provider rate.
pub struct AdaptiveRateLimiter {
    current_rps: AtomicU32,
    settings: AdaptiveSettings,
    window: OutcomeWindow,
}

impl AdaptiveRateLimiter {
    pub fn new(initial_rps: u32, settings: AdaptiveSettings) -> Self {
        let initial = initial_rps.clamp(settings.min_rps, settings.max_rps);
        AdaptiveRateLimiter {
            current_rps: AtomicU32::new(initial),
            window: OutcomeWindow::new(settings.window_capacity, settings.window_span),
            settings,
        }
    }

    pub fn record_success(&self) {
        self.window.record(CallOutcome::Accepted);
    }

    pub fn record_throttled(&self) {
        self.window.record(CallOutcome::Throttled);
    }

    pub fn record_degraded(&self) {
        self.window.record(CallOutcome::Degraded);
    }

    pub fn current_rps(&self) -> u32 {
        self.current_rps.load(Ordering::SeqCst)
    }

    /// Rate the limiter should move to given the current window, if any.
    fn next_rps(&self) -> Option<u32> {
        let (samples, ratio) = self.window.summary();
        if samples < self.settings.min_samples {
            return None;
        }
        let current = self.current_rps();
        let threshold = self.settings.error_threshold;

        let next = if ratio > threshold {
            (current / 2).max(self.settings.min_rps)
        } else if ratio < threshold / 2.0 {
            ((current as f64 * 1.15) as u32)
                .max(current.saturating_add(1))
                .min(self.settings.max_rps)
        } else {
            current
        };
        (next != current).then_some(next)
    }

    /// Applies one adjustment step. Returns the new rate when it changed.
    pub fn adjust(&self, limiter: &RateLimiter) -> Option<u32> {
        let next = self.next_rps()?;
        let previous = self.current_rps.swap(next, Ordering::SeqCst);
        let (_, ratio) = self.window.summary();
        if next < previous {
            log::warn!(
                "Remote provider under pressure ({:.0}% throttled or degraded), lowering rate {} -> {} rps",
                ratio * 100.0,
                previous,
                next
            );
            // Decisions after a decrease should only see the new rate's outcomes
            self.window.clear();
        } else {
            log::info!("Remote provider healthy, raising rate {} -> {} rps", previous, next);
        }
        limiter.update_rps(next);
        Some(next)
    }

    /// Spawns the periodic adjuster driving `limiter`.
    pub fn spawn_adjuster(
        self: &Arc<Self>,
        limiter: Arc<RateLimiter>,
        every: Duration,
        shutdown: CancellationToken,
    ) {
        let this = Arc::clone(self);
        let mut ticker = interval(every);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.adjust(&limiter);
                    }
                    _ = shutdown.cancelled() => {
                        log::debug!("Adaptive rate adjuster shutting down");
                        break;
                    }
                }
            }
        });
    }
}
