//! Storage Manager: pooled, thread-safe access to the relational store.
//!
//! Every operation leases a `ConnectionSlot` under the pool's acquire timeout.
//! Dependent (tax and sales) writes create a stub parent property in the same
//! transaction, so the parent-before-child rule never fails a caller.

mod circuit_breaker;
mod manager;
mod migrations;
mod pool;
mod stats;

pub use circuit_breaker::WriteCircuitBreaker;
pub use manager::{BulkOutcome, StorageManager};
pub use migrations::run_migrations;
pub use pool::{init_db_pool_with_path, ConnectionSlot};
pub use stats::{StorageFailureKind, StorageStats};
