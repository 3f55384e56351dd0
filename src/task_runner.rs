//! Bounded retry with backoff
//!
//! Wraps fallible async operations (history loads, feed reconnects) with a
//! capped number of attempts. Exhausting the budget hands the last error back
//! to the caller instead of retrying forever.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Delay growth factor per failure; 1 keeps the delay fixed
    pub multiplier: u32,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1,
        }
    }

    pub fn exponential(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            multiplier: 2,
        }
    }

    /// Delay applied after the `failures`-th consecutive failure (1-based).
    pub fn delay_after(&self, failures: u32) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..failures {
            delay = std::cmp::min(delay.saturating_mul(self.multiplier), self.max_delay);
        }
        std::cmp::min(delay, self.max_delay)
    }
}

/// Runs `op` until it succeeds or `policy.max_attempts` attempts have failed.
pub async fn retry_with_backoff<T, E, F, Fut>(task_name: &str, policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    warn!("Task '{}' succeeded after {} attempts", task_name, attempt);
                }
                return Ok(value);
            }
            Err(e) if attempt >= max_attempts => {
                error!(
                    "Task '{}' failed after {} attempts, giving up: {}",
                    task_name, attempt, e
                );
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    "Task '{}' failed (attempt {}/{}): {}. Retrying in {:?}",
                    task_name, attempt, max_attempts, e, delay
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
