//! Bounded retry with exponential backoff for environment-provider calls.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::domain::errors::EnvironmentError;
use crate::domain::models::RetryConfig;

/// Result of a retried operation together with how many tries it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, EnvironmentError>,
    pub attempts: u32,
}

/// Retry policy for transient provider errors.
///
/// Only errors whose [`EnvironmentError::is_transient`] is true are retried,
/// at most `max_retries` times. Delays double from `initial_backoff` up to
/// `max_backoff`, with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    jitter: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::from_millis(initial_backoff_ms),
            max_backoff: Duration::from_millis(max_backoff_ms.max(initial_backoff_ms)),
            jitter: 0.2,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            config.initial_backoff_ms,
            config.max_backoff_ms,
        )
    }

    /// Randomization factor applied to each delay (0.0 = deterministic).
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn schedule(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_multiplier(2.0)
            .with_randomization_factor(self.jitter)
            .with_max_elapsed_time(None)
            .build()
    }

    /// The first `n` delays this policy would wait.
    pub fn delays(&self, n: usize) -> Vec<Duration> {
        let mut schedule = self.schedule();
        (0..n).filter_map(|_| schedule.next_backoff()).collect()
    }

    /// Run `operation`, retrying transient failures.
    pub async fn execute<F, Fut, T>(&self, what: &str, mut operation: F) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EnvironmentError>>,
    {
        let mut schedule = self.schedule();
        let mut attempts = 0;

        loop {
            attempts += 1;
            match operation().await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(operation = what, attempts, "succeeded after retries");
                    }
                    return Attempted {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(err) if err.is_transient() && attempts <= self.max_retries => {
                    let delay = schedule.next_backoff().unwrap_or(self.max_backoff);
                    warn!(
                        operation = what,
                        attempt = attempts,
                        max_retries = self.max_retries,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "transient environment error, retrying"
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!(operation = what, attempts, error = %err, "retries exhausted");
                    }
                    return Attempted {
                        result: Err(err),
                        attempts,
                    };
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
