//! Polling and retry primitives.
//!
//! The compute provider and freshly booted hosts are both eventually
//! consistent. This library turns their asynchronous state into synchronous
//! guarantees. Key concepts:
//!
//! - **Polling**: re-run a probe on a fixed interval until it reports a
//!   value, bounded by a timeout.
//! - **Retry**: re-run an operation after a transient failure with a fixed
//!   delay, bounded by an attempt count or unbounded.
//!
//! # Invariants
//!
//! - A probe is always run at least once, even with a zero timeout
//! - Non-transient failures are returned on the attempt they happen
//! - Sleeping is the only suspension point

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default interval between status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default upper bound on a status poll.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(600);

/// Polling errors.
#[derive(Debug, Error)]
pub enum PollError<E> {
    /// The resource did not reach the wanted state in time.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout { resource: String, elapsed: Duration },

    /// The probe itself failed.
    #[error("probe for {resource} failed: {error}")]
    Probe { resource: String, error: E },
}

impl<E> PollError<E> {
    /// Returns true if the poll ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Run `probe` every `interval` until it yields `Some`, or fail once
/// `timeout` has elapsed.
pub async fn poll_until<T, E, F, Fut>(
    resource: &str,
    interval: Duration,
    timeout: Duration,
    mut probe: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let start = Instant::now();

    loop {
        match probe().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(error) => {
                return Err(PollError::Probe {
                    resource: resource.to_string(),
                    error,
                })
            }
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(PollError::Timeout {
                resource: resource.to_string(),
                elapsed,
            });
        }

        debug!(
            resource,
            elapsed_secs = elapsed.as_secs(),
            "Not ready yet, polling again"
        );
        tokio::time::sleep(interval).await;
    }
}

/// Fixed-delay retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first. `None` retries forever.
    pub max_attempts: Option<u32>,

    /// Delay between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Retry up to `max_attempts` times in total.
    pub const fn bounded(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            delay,
        }
    }

    /// Retry until the operation succeeds or fails non-transiently.
    pub const fn unbounded(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            delay,
        }
    }

    /// Check whether another attempt is allowed after `attempts` tries.
    pub fn allows_another(&self, attempts: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts < max,
            None => true,
        }
    }
}

/// Retry errors.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every allowed attempt failed transiently.
    #[error("{operation} gave up after {attempts} attempts: {last}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last: E,
    },

    /// The operation failed with a non-transient error.
    #[error("{0}")]
    Fatal(E),
}

impl<E> RetryError<E> {
    /// Unwrap the underlying error, discarding the attempt count.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Fatal(error) => error,
        }
    }
}

/// Run `operation` under `policy`, retrying failures `is_transient` accepts.
///
/// The closure receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    operation: &str,
    mut attempt_fn: F,
    is_transient: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match attempt_fn(attempts).await {
            Ok(value) => return Ok(value),
            Err(error) if !is_transient(&error) => return Err(RetryError::Fatal(error)),
            Err(error) => {
                if !policy.allows_another(attempts) {
                    return Err(RetryError::Exhausted {
                        operation: operation.to_string(),
                        attempts,
                        last: error,
                    });
                }

                warn!(
                    operation,
                    attempt = attempts,
                    error = %error,
                    delay_ms = policy.delay.as_millis() as u64,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}
