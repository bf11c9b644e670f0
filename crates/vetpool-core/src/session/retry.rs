use std::future::Future;
use std::time::Duration;

use crate::models::{CoreError, CoreErrorKind, CoreResult};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backoff {
    None,
    Fixed(Duration),
    Exponential { initial: Duration, max: Duration },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::Exponential {
                initial: DEFAULT_BACKOFF_INITIAL,
                max: DEFAULT_BACKOFF_MAX,
            },
        }
    }
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: CoreResult<T>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    pub fn no_retry() -> Self {
        Self::new(1, Backoff::None)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.max_attempts == 0 {
            return Err(CoreError::new(
                CoreErrorKind::InvalidConfig,
                "retry policy needs at least one attempt",
            ));
        }
        Ok(())
    }

    /// Pause before the attempt following `failed_attempt` (1-based).
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        match self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let factor = 1u32
                    .checked_shl(failed_attempt.saturating_sub(1))
                    .unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max)
            }
        }
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or `max_attempts` is used up. The closure receives the 1-based attempt
    /// number.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(error) if attempt < max_attempts && error.is_retryable() => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        kind = ?error.kind,
                        message = %error.message,
                        "attempt failed; retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(error) => {
                    return RetryOutcome {
                        result: Err(error),
                        attempts: attempt,
                    };
                }
            }
        }
    }
}
