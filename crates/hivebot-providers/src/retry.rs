//! Retry with exponential backoff.
//!
//! Only classified-retryable errors are re-attempted; the backoff sleep is
//! preempted by cancellation, surfacing the last error.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use hivebot_core::config::schema::RotationConfig;

use crate::error::ProviderError;

/// Exponential backoff policy.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl From<&RotationConfig> for RetryPolicy {
    fn from(config: &RotationConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_factor: config.backoff_factor,
        }
    }
}

impl RetryPolicy {
    /// The delay before retry `attempt` (0-based):
    /// `min(max_delay, initial_delay × backoff_factor^attempt)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }

    /// Run `op` with retries. `op` receives the attempt number (0-based).
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.run_where(cancel, |e| e.is_retryable(), op).await
    }

    /// `run` with a custom retry predicate. Callers that handle some
    /// retryable kinds themselves (rate-limit waits, context repair)
    /// narrow the predicate so those errors bubble up immediately.
    pub async fn run_where<T, F, Fut, P>(
        &self,
        cancel: &CancellationToken,
        should_retry: P,
        mut op: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
        P: Fn(&ProviderError) -> bool,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if should_retry(&e) && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    debug!(
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after backoff"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
