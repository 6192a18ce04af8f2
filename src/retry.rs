//! Bounded polling and backoff primitives.
//!
//! Two independent retry layers use this module:
//!
//! - [`poll_immediate`] drives the Patch Engine's fixed-interval retry and the
//!   readiness waits: attempt at once, then every `interval` until `timeout`.
//!   The calling task sleeps between attempts.
//! - [`ExponentialBackoff`] computes the per-key delay used by the work queue
//!   when a whole reconcile is requeued.
//!
//! # Example
//!
//! ```ignore
//! use backup_sidecar_operator::retry::{poll_immediate, Attempt, RetryPolicy};
//!
//! let policy = RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(60));
//! let value = poll_immediate(&policy, |attempt| async move {
//!     match api.get("default", "web").await {
//!         Ok(obj) => Attempt::Ready(obj),
//!         Err(e) if e.is_not_found() => Attempt::Abort(e),
//!         Err(e) => Attempt::Failed(e),
//!     }
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::Error;

/// Fixed-interval retry bounded by a deadline and, optionally, an attempt cap
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between attempts
    pub interval: Duration,
    /// Total time budget, measured from the first attempt
    pub timeout: Duration,
    /// Stop after this many attempts even if time remains
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Create a policy from an interval and a timeout
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            max_attempts: None,
        }
    }

    /// Cap the number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    fn exhausted(&self, attempts: u32, deadline: Instant) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max) || Instant::now() + self.interval > deadline
    }
}

/// Outcome of a single polling attempt
#[derive(Debug)]
pub enum Attempt<T> {
    /// Condition met, stop polling
    Ready(T),
    /// Condition not met yet, poll again
    Pending,
    /// Attempt failed in a way worth retrying
    Failed(Error),
    /// Attempt failed terminally, stop without consuming more budget
    Abort(Error),
}

/// Why [`poll_immediate`] stopped without a value
#[derive(Debug)]
pub enum PollError {
    /// An attempt returned [`Attempt::Abort`]
    Aborted {
        /// Attempts made, including the aborting one
        attempts: u32,
        /// The terminal error
        error: Error,
    },
    /// The deadline passed
    TimedOut {
        /// Attempts made
        attempts: u32,
        /// Last failure, if the final attempts failed rather than stayed pending
        last_error: Option<Error>,
    },
}

impl PollError {
    /// Number of attempts made before stopping
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Aborted { attempts, .. } | Self::TimedOut { attempts, .. } => *attempts,
        }
    }
}

/// Poll `attempt_fn` immediately and then every `policy.interval` until it is
/// ready, aborts, runs out of attempts, or the next attempt would start after
/// `policy.timeout`.
///
/// The closure receives the 1-based attempt number.
pub async fn poll_immediate<T, F, Fut>(policy: &RetryPolicy, mut attempt_fn: F) -> Result<T, PollError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut attempts = 0u32;
    let mut last_error;

    loop {
        attempts += 1;

        match attempt_fn(attempts).await {
            Attempt::Ready(value) => return Ok(value),
            Attempt::Abort(error) => return Err(PollError::Aborted { attempts, error }),
            Attempt::Failed(error) => {
                trace!(attempt = attempts, error = %error, "attempt failed, will retry");
                last_error = Some(error);
            }
            Attempt::Pending => {
                trace!(attempt = attempts, "condition not yet met");
                last_error = None;
            }
        }

        if policy.exhausted(attempts, deadline) {
            return Err(PollError::TimedOut {
                attempts,
                last_error,
            });
        }

        tokio::time::sleep(policy.interval).await;
    }
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Delay after the first failure
    pub base: Duration,
    /// Upper bound for any delay
    pub max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

impl ExponentialBackoff {
    /// Delay for a key that has already been requeued `requeues` times
    pub fn delay(&self, requeues: u32) -> Duration {
        let factor = 2u32.checked_pow(requeues).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map(|d| d.min(self.max))
            .unwrap_or(self.max)
    }
}
