//! Bounded exponential backoff for outbound HTTP calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::constants::HTTP_MAX_ATTEMPTS;

/// Errors that can tell whether another attempt might succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(base_delay: Duration) -> Self {
        Self {
            max_attempts: HTTP_MAX_ATTEMPTS,
            base_delay,
        }
    }

    /// Delay before the attempt following `attempt` (1-based): `base * 2^(attempt-1)`
    /// plus up to 50% jitter.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let jitter_cap = u64::try_from(exp.as_millis() / 2).unwrap_or(u64::MAX);
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        exp + Duration::from_millis(jitter)
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// The last error is returned unchanged.
///
/// # Errors
///
/// Returns the error of the final attempt.
pub async fn with_backoff<T, E, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    what,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Retrying after error: {e}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
