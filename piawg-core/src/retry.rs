//! Retry executor with exponential backoff
//!
//! Every network-facing component funnels its calls through [`retry`]
//! instead of hand-rolling attempt loops. Failures that implement
//! [`Retryable`] as `false` short-circuit immediately without consuming
//! the attempt budget; everything else is retried with a blocking
//! exponential backoff sleep between attempts.

use std::time::Duration;

use tracing::{debug, warn};

/// Classifies an error as worth retrying or not.
///
/// Transport hiccups and timeouts are retryable; rejections (bad
/// credentials, unknown region, malformed bodies) are not.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Policy for operations that may fail transiently
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Multiplier applied to the delay after each failure
    pub multiplier: u32,
    /// Cap for the backoff delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy with a custom attempt budget and default delays
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Backoff delay preceding the given attempt (2-indexed: the first
    /// attempt never sleeps).
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(2));
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// A successful result annotated with the number of attempts it took
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

impl<T> Retried<T> {
    pub fn into_inner(self) -> T {
        self.value
    }
}

/// The last failure after the attempt budget was exhausted, or a
/// non-retryable failure that short-circuited.
#[derive(Debug, thiserror::Error)]
#[error("{operation} failed after {attempts} attempt(s): {last}")]
pub struct RetryError<E: std::error::Error> {
    pub operation: String,
    pub attempts: u32,
    #[source]
    pub last: E,
}

impl<E: std::error::Error> RetryError<E> {
    pub fn into_last(self) -> E {
        self.last
    }
}

/// Invoke `operation` until it succeeds or the policy is exhausted.
///
/// This is the sole source of wall-clock pauses in the reconciler: the
/// thread sleeps between attempts according to the policy's backoff.
pub fn retry<T, E, F>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<Retried<T>, RetryError<E>>
where
    E: Retryable + std::error::Error,
    F: FnMut() -> Result<T, E>,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match op() {
            Ok(value) => {
                debug!(operation, attempt, "operation succeeded");
                return Ok(Retried { value, attempts: attempt });
            }
            Err(e) if !e.is_retryable() => {
                debug!(operation, attempt, error = %e, "non-retryable failure");
                return Err(RetryError {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last: e,
                });
            }
            Err(e) if attempt >= policy.max_attempts => {
                warn!(operation, attempt, error = %e, "retry budget exhausted");
                return Err(RetryError {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last: e,
                });
            }
            Err(e) => {
                let delay = policy.backoff(attempt + 1);
                warn!(
                    operation,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed, retrying"
                );
                std::thread::sleep(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("transient")]
        Transient,
        #[error("rejected")]
        Rejected,
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            multiplier: 2,
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn succeeds_immediately() {
        let result = retry(&fast_policy(3), "op", || Ok::<_, TestError>(42)).unwrap();
        assert_eq!(result.value, 42);
        assert_eq!(result.attempts, 1);
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let mut calls = 0u32;
        let result = retry(&fast_policy(5), "op", || {
            calls += 1;
            if calls < 3 {
                Err(TestError::Transient)
            } else {
                Ok(calls)
            }
        })
        .unwrap();
        assert_eq!(result.value, 3);
        assert_eq!(result.attempts, 3);
    }

    #[test]
    fn exhausts_attempt_budget() {
        let mut calls = 0u32;
        let err = retry(&fast_policy(3), "op", || {
            calls += 1;
            Err::<(), _>(TestError::Transient)
        })
        .unwrap_err();
        assert_eq!(calls, 3);
        assert_eq!(err.attempts, 3);
        assert!(matches!(err.last, TestError::Transient));
    }

    #[test]
    fn rejection_short_circuits() {
        let mut calls = 0u32;
        let err = retry(&fast_policy(5), "op", || {
            calls += 1;
            Err::<(), _>(TestError::Rejected)
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert_eq!(err.attempts, 1);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(policy.backoff(2), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(4));
        assert_eq!(policy.backoff(5), Duration::from_secs(5));
    }
}
