//! Bounded exponential-backoff retry for transient fetches.

use crate::error::BatchError;
use idenhide_abstraction::ProcessingError;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry policy for transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Backoff multiplier (e.g., 2.0 for exponential backoff).
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self { max_attempts, initial_delay, max_delay, multiplier }
    }

    /// Calculate the delay for a given retry.
    ///
    /// Uses exponential backoff: initial_delay * multiplier^retry_count, capped at max_delay.
    pub fn calculate_delay(&self, retry_count: u32) -> Duration {
        let delay_ms = (self.initial_delay.as_millis() as f64
            * self.multiplier.powi(retry_count as i32))
        .min(self.max_delay.as_millis() as f64) as u64;
        Duration::from_millis(delay_ms)
    }

    /// Delay before `attempt` (1-based). The first attempt is immediate.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 { Duration::ZERO } else { self.calculate_delay(attempt - 2) }
    }
}

/// Errors that can declare themselves worth retrying.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for ProcessingError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

impl Retryable for BatchError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::FetchFailed(_) | Self::NotFound(_) | Self::Timeout(_) | Self::Io(_) => true,
            Self::ProcessingFailed(inner) => inner.is_transient(),
            _ => false,
        }
    }
}

/// Failure of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Cancellation was requested during a backoff sleep.
    #[error("Cancelled during retry backoff")]
    Cancelled,

    /// The last observed failure, returned untouched.
    #[error("{last} (after {attempts} attempt(s))")]
    Failed { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    /// Attempts made before giving up; zero for a cancellation.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Cancelled => 0,
            Self::Failed { attempts, .. } => *attempts,
        }
    }
}

/// Runs an operation under a [`RetryPolicy`].
///
/// Holds no shared mutable state; one fetcher may serve every worker.
#[derive(Debug, Clone, Default)]
pub struct RetryFetcher {
    policy: RetryPolicy,
}

impl RetryFetcher {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Calls `op` (with the 1-based attempt number) until it succeeds, fails
    /// with a non-retryable error, or attempts run out.
    pub async fn fetch<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            if attempt > 1 {
                let delay = self.policy.delay_before(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry");
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(RetryError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() || attempt >= max_attempts => {
                    return Err(RetryError::Failed { attempts: attempt, last: err });
                }
                Err(err) => {
                    warn!(attempt, max_attempts, error = %err, "Transient fetch failure, will retry");
                }
            }
            attempt += 1;
        }
    }
}
