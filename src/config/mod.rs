//! Engine configuration and constants.
//!
//! This module provides:
//! - Configuration constants (timeouts, limits, defaults)
//! - The `EngineConfig` struct handed to the engine at construction
//! - Logging option types shared with the CLI

mod constants;
mod types;

// Re-export all constants
pub use constants::*;
pub use types::{
    EngineConfig, ExtractionRules, LogFormat, LogLevel, RemoteConfig, ScrapeConfig,
};
