//! Bounded retry combinators.
//!
//! Every wait in ovm (port search, proxy socket, API ping) goes through a
//! [`RetryPolicy`] so its attempt count, backoff and deadline are explicit.

use std::future::Future;
use std::time::{Duration, Instant};

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// Same delay every time.
    Fixed(Duration),
    /// Doubling delay starting at `initial`, capped at `max`.
    Exponential {
        /// First delay.
        initial: Duration,
        /// Upper bound.
        max: Duration,
    },
}

impl Backoff {
    /// Delay before attempt `attempt + 1` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(d) => d,
            Backoff::Exponential { initial, max } => {
                let exponent = attempt.min(16);
                initial.saturating_mul(1u32 << exponent).min(max)
            }
        }
    }
}

/// Attempt budget for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (at least one is always made).
    pub max_attempts: u32,
    /// Delay between attempts.
    pub backoff: Backoff,
    /// Absolute budget measured from the first attempt.
    pub deadline: Option<Duration>,
}

impl RetryPolicy {
    /// `max_attempts` tries with no delay.
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::None,
            deadline: None,
        }
    }

    /// `max_attempts` tries with a doubling delay.
    pub const fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential { initial, max },
            deadline: None,
        }
    }

    /// Fixed `interval` between tries until `deadline` elapses.
    pub const fn until(deadline: Duration, interval: Duration) -> Self {
        Self {
            max_attempts: u32::MAX,
            backoff: Backoff::Fixed(interval),
            deadline: Some(deadline),
        }
    }

    fn out_of_budget(&self, attempt: u32, started: Instant, next_delay: Duration) -> bool {
        if attempt + 1 >= self.max_attempts.max(1) {
            return true;
        }
        match self.deadline {
            Some(deadline) => started.elapsed() + next_delay >= deadline,
            None => false,
        }
    }
}

/// Outcome of a retry loop that ran out of budget.
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Attempts made.
    pub attempts: u32,
    /// Error from the last attempt.
    pub last_error: E,
}

/// Run `op` until it succeeds or the policy is exhausted.
///
/// `op` receives the 0-based attempt number.
pub fn retry<T, E, F>(policy: RetryPolicy, mut op: F) -> Result<T, Exhausted<E>>
where
    F: FnMut(u32) -> Result<T, E>,
{
    let started = Instant::now();
    let mut attempt = 0;
    loop {
        match op(attempt) {
            Ok(v) => return Ok(v),
            Err(e) => {
                let delay = policy.backoff.delay(attempt);
                if policy.out_of_budget(attempt, started, delay) {
                    return Err(Exhausted {
                        attempts: attempt + 1,
                        last_error: e,
                    });
                }
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                attempt += 1;
            }
        }
    }
}

/// Async form of [`retry`]; sleeps on the tokio timer.
pub async fn retry_async<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, Exhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                let delay = policy.backoff.delay(attempt);
                if policy.out_of_budget(attempt, started, delay) {
                    return Err(Exhausted {
                        attempts: attempt + 1,
                        last_error: e,
                    });
                }
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
        assert_eq!(backoff.delay(100), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_succeeds_after_failures() {
        let result = retry(RetryPolicy::immediate(5), |attempt| {
            if attempt < 3 {
                Err("not yet")
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_retry_respects_attempt_budget() {
        let mut calls = 0;
        let err = retry(RetryPolicy::immediate(4), |_| {
            calls += 1;
            Err::<(), _>("always")
        })
        .unwrap_err();
        assert_eq!(calls, 4);
        assert_eq!(err.attempts, 4);
        assert_eq!(err.last_error, "always");
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let mut calls = 0;
        let _ = retry(RetryPolicy::immediate(0), |_| {
            calls += 1;
            Err::<(), _>(())
        });
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_retry_async_deadline() {
        let started = Instant::now();
        let err = retry_async(
            RetryPolicy::until(Duration::from_millis(200), Duration::from_millis(20)),
            |_| async { Err::<(), _>("down") },
        )
        .await
        .unwrap_err();
        assert!(err.attempts > 1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
