//! Adaptive throttling for the remote provider.
//!
//! Tracks recent call outcomes (accepted, throttled, degraded) and steers the
//! shared token bucket:
//! - halves the rate when the pressure ratio exceeds the threshold
//! - raises it by ~15% when the ratio falls below half the threshold
//! - never leaves `[min_rps, max_rps]`, where `max_rps` is the provider limit
//!
//! Adjustments require a minimum number of samples in the window.

mod limiter;
mod window;

pub use limiter::{AdaptiveRateLimiter, AdaptiveSettings};
