//! Retry strategy with exponential backoff for transient remote errors.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use tapedeck_common::{Error, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap for exponential growth.
    pub max_delay: Duration,
    /// Whether to add +/- 25% jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate the backoff delay after the given zero-based attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64 * 2f64.powi(attempt.min(31) as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped * jitter_factor
        } else {
            capped
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Runs remote operations with retry logic.
///
/// Only rate-limit and service-unavailable errors are retried. A rate-limit
/// response carrying a server-provided wait replaces the computed backoff.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before the next attempt, or `None` when `err` must be surfaced.
    ///
    /// `attempt` is the one-based number of the attempt that just failed.
    pub fn next_delay(&self, attempt: u32, err: &Error) -> Option<Duration> {
        if !err.is_retryable() || attempt >= self.config.max_attempts {
            return None;
        }
        Some(
            err.retry_after()
                .unwrap_or_else(|| self.config.delay_for_attempt(attempt - 1)),
        )
    }

    /// Execute an operation, retrying transient failures.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!("Operation succeeded after {} attempts", attempt);
                    }
                    return Ok(result);
                }
                Err(err) => match self.next_delay(attempt, &err) {
                    Some(delay) => {
                        warn!(
                            "Attempt {} failed: {}. Retrying in {:?}...",
                            attempt, err, delay
                        );
                        sleep(delay).await;
                    }
                    None => {
                        if err.is_retryable() {
                            warn!("Operation failed after {} attempts: {}", attempt, err);
                        }
                        return Err(err);
                    }
                },
            }
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

/// Convenience function for a one-off retried operation.
pub async fn with_retry<F, Fut, T>(max_attempts: u32, base_delay: Duration, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryExecutor::new(RetryConfig::new(max_attempts).with_base_delay(base_delay))
        .execute(operation)
        .await
}
