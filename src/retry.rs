//! Bounded retry with delay.
//!
//! One utility for every retried operation, parameterized by attempt count and
//! backoff. Callers decide per error whether another attempt makes sense.

use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed,
    /// Delay doubles each retry, capped at 16x the base delay.
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero behaves like one.
    pub attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(5),
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay,
            backoff: Backoff::Fixed,
        }
    }

    /// Policy for tests: retries without sleeping.
    pub fn immediate(attempts: u32) -> Self {
        Self::fixed(attempts, Duration::ZERO)
    }

    /// Delay before attempt number `attempt` (1-based; attempt 1 has none).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => self.delay * (1u32 << (attempt - 2).min(4)),
        }
    }
}

/// Why a retried operation stopped.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The operation reported a non-retryable error.
    Permanent(E),
    /// Every attempt failed; holds the last error.
    Exhausted { attempts: u32, last: E },
}

/// Outcome of a single attempt.
pub enum Attempt<T, E> {
    Done(T),
    Retry(E),
    Fail(E),
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// `op` receives the 1-based attempt number.
pub fn with_retry<T, E, F>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Attempt<T, E>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        match op(attempt) {
            Attempt::Done(value) => return Ok(value),
            Attempt::Fail(err) => return Err(RetryError::Permanent(err)),
            Attempt::Retry(err) => {
                if attempt >= attempts {
                    return Err(RetryError::Exhausted { attempts, last: err });
                }
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what,
                    attempt,
                    attempts,
                    err,
                    policy.delay_before(attempt + 1)
                );
                attempt += 1;
            }
        }
    }
}
