use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::remote::RemoteError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

pub trait Retryable {
    fn is_transient(&self) -> bool;

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for RemoteError {
    fn is_transient(&self) -> bool {
        RemoteError::is_transient(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        RemoteError::retry_after(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure<E> {
    pub error: E,
    pub attempts: u32,
}

impl RetryPolicy {
    /// `max_attempts` counts every call, the first one included.
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, runs out of
    /// attempts, or `cancel` fires. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<Retried<T>, RetryFailure<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let error = match op(attempt).await {
                Ok(value) => {
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                    });
                }
                Err(error) => error,
            };
            if !error.is_transient() || attempt >= self.max_attempts || cancel.is_cancelled() {
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                });
            }
            let delay = self.backoff.wait(attempt - 1, error.retry_after());
            tracing::warn!(
                op = label,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient failure, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryFailure { error, attempts: attempt });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, Backoff::default())
    }
}
