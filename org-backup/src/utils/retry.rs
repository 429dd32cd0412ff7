//! Retry policy shared by the API client and the uploader.
//!
//! One policy, applied the same way at both boundaries:
//! - transient failures back off exponentially (with jitter) up to a cap
//! - throttling waits for the announced window and is retried a bounded
//!   number of times
//! - anything else fails immediately
//!
//! No wait is ever allowed to run past the usable time of the run.

use crate::budget::TimeBudget;
use crate::config::RetryConfig;
use crate::utils::errors::{BackupError, Result, RetryDecision};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts for transient failures (first try included)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// How many throttled responses are waited out before giving up
    pub throttle_retries: u32,
    /// Upper bound of the random delay added after a throttling window
    pub throttle_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            throttle_retries: 1,
            throttle_jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_secs(config.max_delay_secs),
            throttle_retries: 1,
            throttle_jitter: Duration::from_millis(config.throttle_jitter_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1)
    /// plus up to 25% jitter, never above `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(1u64 << exp).min(max_ms);

        let jitter_ms = if delay_ms >= 4 {
            rand::random::<u64>() % (delay_ms / 4 + 1)
        } else {
            0
        };
        Duration::from_millis((delay_ms + jitter_ms).min(max_ms.max(delay_ms)))
    }

    fn throttle_wait(&self, announced: Option<Duration>) -> Duration {
        let jitter_ms = self.throttle_jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::random::<u64>() % (jitter_ms + 1))
        } else {
            Duration::ZERO
        };
        announced.unwrap_or(self.max_delay) + jitter
    }

    /// Run `op` until it succeeds, fails permanently, or retries are used up.
    pub async fn run<T, F, Fut>(&self, operation: &str, budget: &TimeBudget, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        let mut throttles: u32 = 0;

        loop {
            attempt += 1;

            let err = match op().await {
                Ok(value) => {
                    if attempt > 1 || throttles > 0 {
                        info!(operation, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let wait = match err.retry_decision() {
                RetryDecision::NoRetry => return Err(err),
                RetryDecision::Throttled(announced) => {
                    if throttles >= self.throttle_retries {
                        warn!(operation, error = %err, "Still throttled after waiting, giving up");
                        return Err(err);
                    }
                    throttles += 1;
                    // throttling does not consume transient attempts
                    attempt -= 1;
                    let wait = self.throttle_wait(announced);
                    warn!(operation, wait_ms = wait.as_millis() as u64, "Throttled, waiting for rate window");
                    wait
                }
                RetryDecision::Retry => {
                    if attempt >= self.max_attempts {
                        warn!(operation, attempt, error = %err, "Retries exhausted");
                        return Err(err);
                    }
                    let wait = self.backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = wait.as_millis() as u64,
                        error = %err,
                        "Operation failed, will retry"
                    );
                    wait
                }
            };

            if budget.sleep_within(wait).await.is_err() {
                debug!(operation, "No time left to wait for a retry");
                return Err(err);
            }
        }
    }
}
