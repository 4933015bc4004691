//! Bounded retry for transient provider errors.
//!
//! Only three conditions are ever retried: a freshly created security group
//! not yet visible, a role not yet attachable to its instance profile, and
//! a resource still referenced by something being torn down. Callers pass
//! the predicate that selects their condition; anything else propagates on
//! the first attempt.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

/// Timeout and backoff for one retried call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total time budget, measured from the first attempt.
    pub timeout: Duration,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound for the doubling delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }
}

/// Why [`retry_when`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The error did not match the predicate.
    Fatal(E),
    /// The error kept matching until the time budget ran out.
    Exhausted { last: E, attempts: u32, waited: Duration },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Run `op` until it succeeds, fails with an error `retryable` rejects, or
/// `policy.timeout` would be exceeded by the next delay.
pub async fn retry_when<T, E, Op, Fut, P>(
    policy: &RetryPolicy,
    what: &str,
    retryable: P,
    mut op: Op,
) -> Result<T, RetryError<E>>
where
    E: fmt::Display,
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let start = Instant::now();
    let mut delay = policy.initial_delay;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match op().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(what, attempts, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !retryable(&err) => return Err(RetryError::Fatal(err)),
            Err(err) => {
                let waited = start.elapsed();
                if waited + delay > policy.timeout {
                    warn!(what, attempts, ?waited, error = %err, "giving up");
                    return Err(RetryError::Exhausted {
                        last: err,
                        attempts,
                        waited,
                    });
                }
                debug!(what, attempts, ?delay, error = %err, "transient error, retrying");
                sleep(delay).await;
                delay = (delay * 2).min(policy.max_delay);
            }
        }
    }
}
