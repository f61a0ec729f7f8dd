//! Bounded retry with fixed backoff

use crate::error::{SwapError, SwapResult};

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// How often, and how far apart, a failing call is repeated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Single attempt, no waiting
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `operation` until it succeeds or the attempts are used up.
    /// The closure receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> SwapResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SwapResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts => return Err(e),
                Err(e) => {
                    warn!(
                        "{} failed (attempt {}/{}): {}",
                        what, attempt, self.max_attempts, e
                    );
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }

    /// Poll `check` until it yields a value. `Ok(None)` means "not yet".
    pub async fn poll<T, F, Fut>(&self, what: &str, mut check: F) -> SwapResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SwapResult<Option<T>>>,
    {
        for attempt in 1..=self.max_attempts {
            match check().await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {}
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => warn!("{} poll {} failed: {}", what, attempt, e),
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.backoff).await;
            }
        }

        Err(SwapError::Timeout {
            operation: what.to_string(),
        })
    }
}
