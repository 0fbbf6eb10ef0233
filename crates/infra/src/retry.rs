//! Retry policy with backoff, shared by the connection and publish paths.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Exponential backoff: the wait after failed attempt `n` is
/// `base_delay * 2^(n - 1)`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, the first one included
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    /// Five attempts, waiting 2s, 4s, 8s and 16s in between.
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let factor = 1u32 << (attempt - 1).min(30);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Whether another attempt may follow failed attempt number `attempt`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The last attempt failed with a non-retryable error or the budget ran out.
    Failed { attempts: u32, error: E },
    /// The cancellation token fired while waiting between attempts.
    Cancelled,
}

/// Run `operation` under `policy`.
///
/// Only errors for which `is_transient` returns `true` are retried; anything else
/// is returned immediately. Waits between attempts end early when `cancel`
/// fires.
pub async fn run<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    cancel: &CancellationToken,
    is_transient: fn(&E) -> bool,
    mut attempt_fn: F,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;

    loop {
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(error) if is_transient(&error) && policy.should_retry(attempt) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    error = %error,
                    "could not {} after attempt {}, retrying in {:.1}s",
                    operation,
                    attempt,
                    delay.as_secs_f64()
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }

                attempt += 1;
            }
            Err(error) => {
                return Err(RetryError::Failed {
                    attempts: attempt,
                    error,
                });
            }
        }
    }
}
