//! Global request-rate limiting shared by every outbound HTTP call.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Spaces requests at least `1 / per_second` apart across all callers.
///
/// No burst is allowed: idle time is never saved up for later.
#[derive(Debug)]
pub struct RateLimiter {
    inner: DirectLimiter,
    per_second: NonZeroU32,
}

impl RateLimiter {
    /// Create a limiter allowing `per_second` requests per second (minimum 1).
    #[must_use]
    pub fn new(per_second: u32) -> Self {
        let per_second = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(per_second).allow_burst(NonZeroU32::MIN);
        Self {
            inner: governor::RateLimiter::direct(quota),
            per_second,
        }
    }

    /// Wait until this caller may issue one request.
    pub async fn acquire(&self) {
        self.inner.until_ready().await;
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(1) / self.per_second.get()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;

    #[tokio::test]
    async fn test_first_acquire_is_immediate() {
        let limiter = RateLimiter::new(1);
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_sequential_requests_are_spaced() {
        let limiter = RateLimiter::new(50);
        let start = Instant::now();
        for _ in 0..6 {
            limiter.acquire().await;
        }
        // Slots at 0, 20, 40, 60, 80, 100 ms.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(95), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(1), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_the_budget() {
        let limiter = Arc::new(RateLimiter::new(100));
        let start = Instant::now();

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    limiter.acquire().await;
                    Instant::now()
                })
            })
            .collect();

        let mut finished = Vec::new();
        for handle in handles {
            finished.push(handle.await.unwrap());
        }

        // 20 requests at 100/s need at least 190ms; every caller got through.
        let last = finished.iter().max().copied().unwrap();
        assert_eq!(finished.len(), 20);
        assert!(last - start >= Duration::from_millis(185));
        assert!(last - start < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_idle_time_is_not_banked() {
        let limiter = RateLimiter::new(20);
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        // After idling, only one request is free; the next waits a full interval.
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_zero_rate_is_clamped() {
        assert_eq!(RateLimiter::new(0).interval(), Duration::from_secs(1));
    }
}
