//! Automatic error recovery strategies.
//
// Retry policies used where a transient instrument failure must not end the
// operation: ramp-down steps (the safety net must keep trying to reach 0 V)
// and relay switching during cleanup.

use crate::error::{DaqError, DaqResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Delay strategy between two attempts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Backoff {
    /// Constant delay between attempts.
    Fixed(Duration),
    /// Delay starts at `initial` and is multiplied by `factor` after every
    /// failed attempt, never exceeding `max`.
    Exponential {
        initial: Duration,
        factor: f64,
        max: Duration,
    },
}

impl Backoff {
    /// Delay to wait after the given (zero based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential {
                initial,
                factor,
                max,
            } => {
                let scaled = initial.as_secs_f64() * factor.powi(attempt as i32);
                if scaled >= max.as_secs_f64() {
                    max
                } else {
                    Duration::from_secs_f64(scaled)
                }
            }
        }
    }
}

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Fixed(Duration::from_millis(100)),
        }
    }
}

impl RetryPolicy {
    /// Policy with a constant delay.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(delay),
        }
    }

    /// Run `operation` until it succeeds, the attempts are exhausted or it
    /// fails with an error that `retryable` rejects.
    ///
    /// The last error is returned unchanged.
    pub async fn run<T, F, Fut, P>(&self, mut retryable: P, mut operation: F) -> DaqResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DaqResult<T>>,
        P: FnMut(&DaqError) -> bool,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= attempts || !retryable(&err) {
                        return Err(err);
                    }
                    let delay = self.backoff.delay(attempt - 1);
                    warn!(attempt, max_attempts = attempts, error = %err, "retrying in {:?}", delay);
                    sleep(delay).await;
                }
            }
        }
    }
}

/// Retry predicate that accepts every error except a user abort.
pub fn unless_aborted(err: &DaqError) -> bool {
    !err.is_abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_logic_succeeds() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));
        let result = policy
            .run(unless_aborted, move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= 2 {
                    Ok(n)
                } else {
                    Err(DaqError::connection("smu", "timeout"))
                }
            })
            .await;
        assert_eq!(result.ok(), Some(2));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_logic_fails() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));
        let result: DaqResult<()> = policy
            .run(unless_aborted, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(DaqError::connection("smu", "timeout"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_abort_is_not_retried() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let policy = RetryPolicy::fixed(5, Duration::from_millis(10));
        let result: DaqResult<()> = policy
            .run(unless_aborted, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(DaqError::AbortRequested)
            })
            .await;
        assert!(matches!(result, Err(DaqError::AbortRequested)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_millis(350),
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(350));
    }
}
