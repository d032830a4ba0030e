//! Bounded retry for external calls.
//!
//! | attempt | outcome on transient failure |
//! |---------|------------------------------|
//! | 1       | wait 250 ms                  |
//! | 2       | wait 500 ms                  |
//! | 3       | give up, surface the error   |
//!
//! Transient: network, timeout, 5xx, 429. Client (other 4xx) and protocol
//! errors fail immediately.

use anyhow::Result;
use std::time::Duration;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::error::{domain_error, MemoryError};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_millis(250),
            factor: 2,
            cap: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// No waiting between attempts (tests).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base: Duration::ZERO,
            factor: 1,
            cap: Duration::ZERO,
        }
    }

    /// Delay after the `failed_attempt`-th failure (1-based).
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let exp = self.factor.saturating_pow(failed_attempt.saturating_sub(1));
        self.base.saturating_mul(exp).min(self.cap)
    }

    pub fn is_retryable(err: &anyhow::Error) -> bool {
        matches!(
            domain_error(err),
            Some(MemoryError::External { class, .. }) if class.is_transient()
        )
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    /// Cancellation is checked before every attempt and during backoff.
    pub fn run<T>(&self, cancel: &CancelToken, label: &str, mut op: impl FnMut(u32) -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            cancel.check()?;
            match op(attempt) {
                Ok(v) => return Ok(v),
                Err(err) if attempt < self.max_attempts && Self::is_retryable(&err) => {
                    let delay = self.delay_after(attempt);
                    warn!(label, attempt, delay_ms = delay.as_millis() as u64, error = %err, "transient failure, retrying");
                    cancel.sleep(delay)?;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{is_cancelled, ExternalClass};

    fn fail(class: ExternalClass) -> anyhow::Error {
        MemoryError::external("llm", class, "nope").into()
    }

    #[test]
    fn schedule_is_250_then_500() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_after(1), Duration::from_millis(250));
        assert_eq!(p.delay_after(2), Duration::from_millis(500));
        assert_eq!(p.delay_after(9), Duration::from_secs(4));
    }

    #[test]
    fn transient_errors_retry_up_to_max() {
        let mut calls = 0;
        let res: Result<()> = RetryPolicy::immediate(3).run(&CancelToken::new(), "t", |_| {
            calls += 1;
            Err(fail(ExternalClass::Server))
        });
        assert!(res.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn client_errors_do_not_retry() {
        let mut calls = 0;
        let res: Result<()> = RetryPolicy::immediate(3).run(&CancelToken::new(), "t", |_| {
            calls += 1;
            Err(fail(ExternalClass::Client))
        });
        assert!(res.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn recovers_after_rate_limit() {
        let out = RetryPolicy::immediate(3)
            .run(&CancelToken::new(), "t", |attempt| {
                if attempt == 1 {
                    Err(fail(ExternalClass::RateLimited))
                } else {
                    Ok(attempt)
                }
            })
            .unwrap();
        assert_eq!(out, 2);
    }

    #[test]
    fn cancelled_before_first_attempt() {
        let token = CancelToken::new();
        token.cancel();
        let err = RetryPolicy::default().run(&token, "t", |_| Ok(())).unwrap_err();
        assert!(is_cancelled(&err));
    }
}
