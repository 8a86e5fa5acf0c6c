//! Bounded retry with fixed backoff for flaky external calls.
//!
//! CNI plugins talk to daemons that may not be ready yet, so attach calls are
//! retried a few times. The whole retry loop is additionally bounded by a
//! deadline and by the caller's cancellation token.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failure of a retried operation.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// Every attempt failed.
    #[error("after {attempts} attempts, last error: {source}")]
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last failure.
        #[source]
        source: E,
    },

    /// The caller cancelled before an attempt succeeded.
    #[error("cancelled after {attempts} attempts")]
    Cancelled {
        /// Number of attempts started.
        attempts: u32,
    },

    /// The overall deadline elapsed before an attempt succeeded.
    #[error("deadline of {deadline:?} elapsed")]
    DeadlineElapsed {
        /// The deadline.
        deadline: Duration,
    },
}

/// Call `op` up to `attempts` times, sleeping `delay` between failures.
///
/// `attempts` below 1 is treated as 1. Cancellation is observed before each
/// attempt, during each attempt and during each sleep; the in-flight attempt
/// future is dropped as soon as the token fires.
///
/// # Errors
///
/// Returns [`RetryError::Exhausted`] with the last failure if no attempt
/// succeeds, or [`RetryError::Cancelled`] if `cancel` fires first.
pub async fn retry<T, E, F, Fut>(
    attempts: u32,
    delay: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { attempts: attempt });
        }
        attempt += 1;

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
            result = op() => result,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        tracing::warn!(attempt, attempts, error = %err, "got error, waiting to retry");

        if attempt >= attempts {
            return Err(RetryError::Exhausted {
                attempts,
                source: err,
            });
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Attempt count, backoff and overall deadline for one retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts.
    pub attempts: u32,
    /// Fixed delay between attempts.
    pub backoff: Duration,
    /// Ceiling for the whole operation, retries included.
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(2),
            deadline: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Set the attempt count.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Set the backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Run `op` under this policy.
    ///
    /// The deadline is a hard ceiling: when it elapses the in-flight attempt
    /// is dropped even if attempts remain.
    ///
    /// # Errors
    ///
    /// As [`retry`], plus [`RetryError::DeadlineElapsed`].
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        tokio::time::timeout(self.deadline, retry(self.attempts, self.backoff, cancel, op))
            .await
            .unwrap_or(Err(RetryError::DeadlineElapsed {
                deadline: self.deadline,
            }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn failing_until(succeed_on: u32) -> (Arc<AtomicU32>, impl FnMut() -> std::future::Ready<Result<u32, String>>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n >= succeed_on {
                Ok(n)
            } else {
                Err(format!("failure {n}"))
            })
        };
        (calls, op)
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt() {
        let (calls, op) = failing_until(3);
        let result = retry(3, Duration::from_secs(2), &CancellationToken::new(), op).await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_names_attempts_and_last_error() {
        let (calls, op) = failing_until(u32::MAX);
        let err = retry(3, Duration::from_secs(2), &CancellationToken::new(), op)
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
        assert_eq!(err.to_string(), "after 3 attempts, last error: failure 3");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_tries_once() {
        let (calls, op) = failing_until(u32::MAX);
        let err = retry(0, Duration::from_secs(1), &CancellationToken::new(), op)
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, RetryError::Exhausted { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_makes_no_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (calls, op) = failing_until(1);
        let err = retry(3, Duration::from_secs(1), &cancel, op).await.unwrap_err();
        assert!(matches!(err, RetryError::Cancelled { attempts: 0 }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_aborts_remaining_attempts() {
        let cancel = CancellationToken::new();
        let (calls, op) = failing_until(u32::MAX);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = retry(5, Duration::from_secs(10), &cancel, op)
            .await
            .unwrap_err();
        assert!(matches!(err, RetryError::Cancelled { attempts: 1 }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_a_hard_ceiling() {
        let policy = RetryPolicy::default().with_deadline(Duration::from_secs(3));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let err = policy
            .run(&CancellationToken::new(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<(), String>(())
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::DeadlineElapsed { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.backoff, Duration::from_secs(2));
        assert_eq!(policy.deadline, Duration::from_secs(30));
    }
}
