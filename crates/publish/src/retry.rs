//! Explicit retry policy handed to the fan-out.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::SinkError;

/// Bounded exponential backoff with a retryable-error predicate.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Values below 1 are treated as 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
    pub retryable: fn(&SinkError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            multiplier: 2,
            retryable: SinkError::is_transient,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn once() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    #[must_use]
    pub fn with_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    /// Returns the final result and the number of attempts made.
    pub async fn run<F, Fut>(&self, mut op: F) -> (Result<(), SinkError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), SinkError>>,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(()) => return (Ok(()), attempt),
                Err(e) if attempt < max && (self.retryable)(&e) => {
                    let delay = self.backoff_for(attempt);
                    debug!(attempt, delay_ms = %delay.as_millis(), error = %e, "sink attempt failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }
}
