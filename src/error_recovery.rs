//! Retry policies for recoverable failures.
//
// Used where an operation is worth a second attempt after a pause, such as a
// shutdown that left a component behind while it was still draining.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::error::AppResult;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff_delay: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

/// Runs `operation` until it succeeds or the policy's attempts are used up, sleeping
/// `backoff_delay` between attempts. Returns the last error on exhaustion.
pub async fn retry_async<T, F, Fut>(policy: &RetryPolicy, what: &str, mut operation: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!(
                    operation = what,
                    attempt,
                    error = %e,
                    retry_in = ?policy.backoff_delay,
                    "Attempt failed, retrying"
                );
                sleep(policy.backoff_delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
