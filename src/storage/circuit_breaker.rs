//! Circuit breaker for store writes.
//!
//! After `threshold` consecutive write failures the breaker opens and writes
//! fail fast with `StorageError::CircuitOpen`. Once the cooldown passes, one
//! write is let through; its result closes or re-opens the circuit.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{CIRCUIT_BREAKER_COOLDOWN, CIRCUIT_BREAKER_THRESHOLD};
use crate::error_handling::StorageError;

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

pub struct WriteCircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl WriteCircuitBreaker {
    pub fn new() -> Self {
        Self::with_threshold(CIRCUIT_BREAKER_THRESHOLD, CIRCUIT_BREAKER_COOLDOWN)
    }

    pub fn with_threshold(threshold: u32, cooldown: Duration) -> Self {
        WriteCircuitBreaker {
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Fails fast while the circuit is open and cooling down.
    pub fn check(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        match state.opened_at {
            Some(opened) if opened.elapsed() < self.cooldown => Err(StorageError::CircuitOpen),
            Some(_) => {
                log::info!("Store write circuit half-open, allowing a trial write");
                state.opened_at = None;
                // one more failure re-opens immediately
                state.consecutive_failures = self.threshold.saturating_sub(1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.consecutive_failures > 0 || state.opened_at.is_some() {
            log::debug!("Store write succeeded, circuit reset");
        }
        *state = BreakerState::default();
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold && state.opened_at.is_none() {
            state.opened_at = Some(Instant::now());
            log::error!(
                "Store write circuit opened after {} consecutive failures (cooldown {:?})",
                state.consecutive_failures,
                self.cooldown
            );
        }
    }

    pub fn is_open(&self) -> bool {
        self.state
            .lock()
            .opened_at
            .is_some_and(|opened| opened.elapsed() < self.cooldown)
    }
}

impl Default for WriteCircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}
