//! Shared resource setup.
//!
//! This module provides functions to initialize the pieces the source adapters
//! share:
//! - Logger
//! - HTTP client for the remote provider
//! - Token-bucket rate limiter

mod client;
mod logger;
mod rate_limiter;

// Re-export public API
pub use client::init_client;
pub use logger::init_logger_with;
pub use rate_limiter::{init_rate_limiter, RateLimiter};
