//! Storage operation counters.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use strum::IntoEnumIterator;
use strum_macros::EnumIter as EnumIterMacro;

use crate::error_handling::StorageError;

/// Failure categories tracked by the Storage Manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIterMacro)]
pub enum StorageFailureKind {
    InvalidRecord,
    PoolExhausted,
    CircuitOpen,
    Constraint,
    Sql,
}

impl StorageFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageFailureKind::InvalidRecord => "invalid_record",
            StorageFailureKind::PoolExhausted => "pool_exhausted",
            StorageFailureKind::CircuitOpen => "circuit_open",
            StorageFailureKind::Constraint => "constraint",
            StorageFailureKind::Sql => "sql",
        }
    }

    /// Category of `error`, or `None` for outcomes that are not failures.
    pub fn of(error: &StorageError) -> Option<Self> {
        match error {
            StorageError::NotFound(_) | StorageError::InvalidConfig(_) => None,
            StorageError::InvalidRecord(_) => Some(StorageFailureKind::InvalidRecord),
            StorageError::PoolExhausted(_) => Some(StorageFailureKind::PoolExhausted),
            StorageError::CircuitOpen => Some(StorageFailureKind::CircuitOpen),
            StorageError::SqlError(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
                Some(StorageFailureKind::Constraint)
            }
            StorageError::SqlError(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Some(StorageFailureKind::Constraint)
            }
            _ => Some(StorageFailureKind::Sql),
        }
    }
}

/// Live counters, updated by every Storage Manager call.
pub(crate) struct StorageCounters {
    operations: AtomicU64,
    latency_micros: AtomicU64,
    failures: HashMap<StorageFailureKind, AtomicU64>,
}

impl StorageCounters {
    pub(crate) fn new() -> Self {
        let failures = StorageFailureKind::iter()
            .map(|kind| (kind, AtomicU64::new(0)))
            .collect();
        StorageCounters {
            operations: AtomicU64::new(0),
            latency_micros: AtomicU64::new(0),
            failures,
        }
    }

    pub(crate) fn record<T>(&self, elapsed: Duration, result: &Result<T, StorageError>) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        self.latency_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if let Err(error) = result {
            if let Some(kind) = StorageFailureKind::of(error) {
                if let Some(counter) = self.failures.get(&kind) {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    pub(crate) fn failure_count(&self, kind: StorageFailureKind) -> u64 {
        self.failures
            .get(&kind)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub(crate) fn snapshot(&self, pool_size: u32, pool_idle: usize, circuit_open: bool) -> StorageStats {
        let operations = self.operations.load(Ordering::SeqCst);
        let latency_micros = self.latency_micros.load(Ordering::SeqCst);
        let failures: BTreeMap<String, u64> = StorageFailureKind::iter()
            .map(|kind| (kind.as_str().to_string(), self.failure_count(kind)))
            .filter(|(_, n)| *n > 0)
            .collect();
        StorageStats {
            operations,
            total_failures: failures.values().sum(),
            failures,
            total_latency_ms: latency_micros as f64 / 1000.0,
            avg_latency_ms: if operations == 0 {
                0.0
            } else {
                latency_micros as f64 / 1000.0 / operations as f64
            },
            pool_size,
            pool_idle,
            circuit_open,
        }
    }
}

/// Point-in-time storage statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
    pub operations: u64,
    pub total_failures: u64,
    pub failures: BTreeMap<String, u64>,
    pub total_latency_ms: f64,
    pub avg_latency_ms: f64,
    pub pool_size: u32,
    pub pool_idle: usize,
    pub circuit_open: bool,
}
