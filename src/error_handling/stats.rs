//! Processing statistics tracking.
//!
//! Thread-safe counters for errors, warnings, and informational events seen
//! while collecting, exposed through the engine health report.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use strum::IntoEnumIterator;

use super::types::{ErrorType, InfoType, WarningType};

/// One atomic counter per variant of `K`, all created up front.
struct CounterSet<K> {
    counters: HashMap<K, AtomicUsize>,
}

impl<K> CounterSet<K>
where
    K: IntoEnumIterator + Copy + Eq + Hash + Display + std::fmt::Debug,
{
    fn new() -> Self {
        CounterSet {
            counters: K::iter().map(|k| (k, AtomicUsize::new(0))).collect(),
        }
    }

    fn increment(&self, key: K) {
        match self.counters.get(&key) {
            Some(counter) => {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            None => log::error!("No counter registered for {key:?}"),
        }
    }

    fn get(&self, key: K) -> usize {
        self.counters
            .get(&key)
            .map_or(0, |c| c.load(Ordering::SeqCst))
    }

    fn total(&self) -> usize {
        self.counters.values().map(|c| c.load(Ordering::SeqCst)).sum()
    }

    /// Non-zero counters keyed by display name.
    fn non_zero(&self) -> BTreeMap<String, usize> {
        K::iter()
            .map(|k| (k.to_string(), self.get(k)))
            .filter(|(_, n)| *n > 0)
            .collect()
    }
}

/// Thread-safe processing statistics tracker.
///
/// Increments never allocate, so one instance is shared across workers
/// behind an `Arc`.
pub struct ProcessingStats {
    errors: CounterSet<ErrorType>,
    warnings: CounterSet<WarningType>,
    info: CounterSet<InfoType>,
}

/// Point-in-time copy of the non-zero counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessingStatsSnapshot {
    pub total_errors: usize,
    pub errors: BTreeMap<String, usize>,
    pub warnings: BTreeMap<String, usize>,
    pub info: BTreeMap<String, usize>,
}

impl ProcessingStats {
    pub fn new() -> Self {
        ProcessingStats {
            errors: CounterSet::new(),
            warnings: CounterSet::new(),
            info: CounterSet::new(),
        }
    }

    pub fn increment_error(&self, error: ErrorType) {
        self.errors.increment(error);
    }

    pub fn increment_warning(&self, warning: WarningType) {
        self.warnings.increment(warning);
    }

    pub fn increment_info(&self, info_type: InfoType) {
        self.info.increment(info_type);
    }

    pub fn get_error_count(&self, error: ErrorType) -> usize {
        self.errors.get(error)
    }

    pub fn get_warning_count(&self, warning: WarningType) -> usize {
        self.warnings.get(warning)
    }

    pub fn get_info_count(&self, info_type: InfoType) -> usize {
        self.info.get(info_type)
    }

    pub fn total_errors(&self) -> usize {
        self.errors.total()
    }

    pub fn total_warnings(&self) -> usize {
        self.warnings.total()
    }

    pub fn total_info(&self) -> usize {
        self.info.total()
    }

    pub fn snapshot(&self) -> ProcessingStatsSnapshot {
        ProcessingStatsSnapshot {
            total_errors: self.total_errors(),
            errors: self.errors.non_zero(),
            warnings: self.warnings.non_zero(),
            info: self.info.non_zero(),
        }
    }
}

impl Default for ProcessingStats {
    fn default() -> Self {
        Self::new()
    }
}
