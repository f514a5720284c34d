//! Token-bucket rate limiter for the remote provider.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::time::{interval, Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Refill granularity of the bucket.
const REFILL_TICK: Duration = Duration::from_millis(100);

/// Token bucket shared by every call to one provider.
///
/// Tokens are consumed (not returned) on `acquire`, and a background task
/// refills them at `current_rps`, never holding more than `capacity`. The
/// bucket therefore never admits more than `capacity` calls at once nor
/// sustains more than `current_rps` over time.
pub struct RateLimiter {
    tokens: Arc<Semaphore>,
    capacity: usize,
    current_rps: Arc<AtomicU32>,
}

impl RateLimiter {
    /// Waits for and consumes one token.
    pub async fn acquire(&self) {
        match self.tokens.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => log::warn!("Rate limiter bucket closed; request proceeds unthrottled"),
        }
    }

    /// Changes the refill rate. Used by the adaptive adjuster.
    pub fn update_rps(&self, rps: u32) {
        self.current_rps.store(rps, Ordering::SeqCst);
    }

    pub fn current_rps(&self) -> u32 {
        self.current_rps.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tokens currently available.
    pub fn available(&self) -> usize {
        self.tokens.available_permits()
    }
}

/// Starts a token bucket with `burst` initial tokens refilled at `rps`.
///
/// Returns `None` when `rps` is 0, meaning the provider is not throttled. The
/// returned token stops the refill task.
pub fn init_rate_limiter(rps: u32, burst: usize) -> Option<(Arc<RateLimiter>, CancellationToken)> {
    if rps == 0 {
        return None;
    }
    let capacity = burst.max(1);
    let shutdown = CancellationToken::new();

    let limiter = Arc::new(RateLimiter {
        tokens: Arc::new(Semaphore::new(capacity)),
        capacity,
        current_rps: Arc::new(AtomicU32::new(rps)),
    });

    let tokens = Arc::clone(&limiter.tokens);
    let rate = Arc::clone(&limiter.current_rps);
    let stop = shutdown.clone();
    tokio::spawn(async move {
        let mut ticker = interval(REFILL_TICK);
        let mut last = Instant::now();
        let mut carry = 0.0f64;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let earned = rate.load(Ordering::SeqCst) as f64
                        * now.duration_since(last).as_secs_f64()
                        + carry;
                    last = now;

                    let whole = earned.floor();
                    carry = earned - whole;

                    let room = capacity.saturating_sub(tokens.available_permits());
                    let add = (whole as usize).min(room);
                    if add > 0 {
                        tokens.add_permits(add);
                    }
                    if room == 0 {
                        // a full bucket does not bank partial tokens
                        carry = 0.0;
                    }
                }
                _ = stop.cancelled() => {
                    log::debug!("Rate limiter refill task shutting down");
                    break;
                }
            }
        }
    });

    Some((limiter, shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[test]
    fn test_zero_rps_disables_limiter() {
        assert!(init_rate_limiter(0, 10).is_none());
    }

    #[tokio::test]
    async fn test_burst_is_available_immediately() {
        let (limiter, shutdown) = init_rate_limiter(1, 3).unwrap();
        for _ in 0..3 {
            let acquired = timeout(Duration::from_millis(20), limiter.acquire()).await;
            assert!(acquired.is_ok(), "burst tokens should be immediate");
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_tokens_are_consumed() {
        let (limiter, shutdown) = init_rate_limiter(1, 1).unwrap();
        limiter.acquire().await;
        let second = timeout(Duration::from_millis(50), limiter.acquire()).await;
        assert!(second.is_err(), "a 1 rps bucket must not admit a second call at once");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_refill_after_wait() {
        let (limiter, shutdown) = init_rate_limiter(10, 1).unwrap();
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        let again = timeout(Duration::from_millis(100), limiter.acquire()).await;
        assert!(again.is_ok());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_refill_never_exceeds_capacity() {
        let (limiter, shutdown) = init_rate_limiter(50, 2).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(limiter.available(), 2);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_update_rps() {
        let (limiter, shutdown) = init_rate_limiter(4, 1).unwrap();
        assert_eq!(limiter.current_rps(), 4);
        limiter.update_rps(2);
        assert_eq!(limiter.current_rps(), 2);
        assert_eq!(limiter.capacity(), 1);
        shutdown.cancel();
    }
}
