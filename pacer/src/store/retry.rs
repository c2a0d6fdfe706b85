//! Read-modify-write helpers for optimistic concurrency.
//!
//! Every update carries the `resource_version` it was based on, and the store rejects it with
//! [`StoreError::Conflict`] if somebody else wrote in between. Callers wrap the whole read-modify-write cycle in
//! [`retry_on_conflict`] so that the losing writer re-reads the record and re-evaluates its decision against the
//! fresh copy.

use super::StoreError;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,

    /// Delay before the first retry. Doubles on every attempt.
    pub initial_delay: Duration,

    /// Cap for the exponential growth.
    pub max_delay: Duration,
}

impl RetryConfig {
    pub const DEFAULT: Self = Self {
        max_retries: 5,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_secs(1),
    };

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt);
        self.initial_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Runs `operation` until it returns something other than a conflict or the retries run out. Only
/// [`StoreError::Conflict`] is retried; every other error is returned as is.
pub async fn retry_on_conflict<T, F, Fut>(
    config: RetryConfig,
    mut operation: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Err(StoreError::Conflict) if attempt < config.max_retries => {
                let delay = config.delay_for_attempt(attempt);
                debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "write conflicted with a concurrent update; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
