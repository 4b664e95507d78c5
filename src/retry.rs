//! Bounded retry with capped exponential backoff for transient failures

use crate::error::{ReleaseError, Result};
use std::future::Future;
use std::time::Duration;

pub const MAX_RETRY_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_DELAY_MS: u64 = 1000;
pub const RETRY_MAX_DELAY_SECS: u64 = 60;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Back off and retry transient failures; when false only the
    /// re-authentication retry applies
    pub retry_transient: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRY_ATTEMPTS,
            base_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_secs(RETRY_MAX_DELAY_SECS),
            retry_transient: true,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// For non-idempotent calls: a rejected token is refreshed once, but
    /// transient failures are surfaced rather than replayed.
    #[must_use]
    pub fn auth_only() -> Self {
        Self {
            max_attempts: 2,
            retry_transient: false,
            ..Self::default()
        }
    }

    /// Delay before attempt `failed_attempt + 1`: base, 2×base, 4×base, …
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(failed_attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `attempt` until it succeeds, fails permanently, or the attempt
    /// ceiling is reached.
    ///
    /// Transient errors back off and retry. The first authentication failure
    /// calls `reauthenticate` and retries without delay; a second one is
    /// surfaced.
    pub async fn run<T, F, Fut, A>(
        &self,
        operation: &str,
        mut attempt: F,
        mut reauthenticate: A,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        A: FnMut(),
    {
        let mut reauthenticated = false;
        let mut number = 1;

        loop {
            let error: ReleaseError = match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if number >= self.max_attempts {
                return Err(error);
            }

            if error.is_authentication_failure() && !reauthenticated {
                tracing::warn!(operation, attempt = number, "authentication failed, re-authenticating");
                reauthenticate();
                reauthenticated = true;
            } else if self.retry_transient && error.is_transient() {
                let delay = self.delay_after(number);
                tracing::warn!(
                    operation,
                    attempt = number,
                    max_attempts = self.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            } else {
                return Err(error);
            }

            number += 1;
        }
    }
}
