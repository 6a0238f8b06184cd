//! Retry classification and caller-side retry policy.
//!
//! [`classify`] is the single place that decides whether a store failure is
//! worth retrying. Adapter components never retry on their own: they surface
//! [`StoreError::Retryable`](crate::error::StoreError::Retryable) and leave
//! backoff to the orchestration layer, which can use [`RetryPolicy`].

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::cancel::CancellationSignal;
use crate::client::DocumentClientError;
use crate::config::RetryOptions;
use crate::error::StoreResult;

/// Delay guidance attached to a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffHint {
    /// The store asked for this delay before the next attempt.
    After(Duration),
    /// No guidance; the caller applies its own backoff curve.
    Unspecified,
}

/// Outcome of classifying a store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// The same request may succeed later.
    Retryable(BackoffHint),
    /// Retrying will not help.
    Fatal,
}

/// Maps a store failure to a retry decision.
pub fn classify(err: &DocumentClientError) -> RetryDecision {
    match err {
        DocumentClientError::Throttled {
            retry_after: Some(delay),
        } => RetryDecision::Retryable(BackoffHint::After(*delay)),
        DocumentClientError::Throttled { retry_after: None } => {
            RetryDecision::Retryable(BackoffHint::Unspecified)
        }
        DocumentClientError::Unavailable(_) => RetryDecision::Retryable(BackoffHint::Unspecified),
        DocumentClientError::Timeout
        | DocumentClientError::NotFound
        | DocumentClientError::Conflict
        | DocumentClientError::PreconditionFailed
        | DocumentClientError::InvalidInput(_)
        | DocumentClientError::Internal(_) => RetryDecision::Fatal,
    }
}

/// Exponential backoff with full jitter, bounded by attempts and total wait.
///
/// Store-suggested delays take precedence over the computed curve.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    options: RetryOptions,
}

impl RetryPolicy {
    /// Creates a policy from retry options.
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }

    /// Returns the policy options.
    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Runs `operation`, retrying retryable failures.
    ///
    /// The last error is returned once attempts or the wait budget run out.
    /// Non-retryable errors are returned immediately.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationSignal,
        mut operation: F,
    ) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt: u32 = 1;
        let mut waited = Duration::ZERO;

        loop {
            let err = match cancel.run(operation()).await {
                Err(err) if err.is_retryable() => err,
                other => return other,
            };

            if attempt >= self.options.max_attempts {
                return Err(err);
            }

            let delay = self.delay_for(attempt, err.retry_after());
            if waited + delay > self.options.max_wait {
                tracing::debug!(
                    attempt,
                    waited_ms = waited.as_millis() as u64,
                    "retry wait budget exhausted"
                );
                return Err(err);
            }

            tracing::debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying document store operation"
            );

            cancel.sleep(delay).await?;
            waited += delay;
            attempt += 1;
        }
    }

    /// Computes the delay before attempt `attempt + 1`.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint;
        }

        let exponent = attempt.saturating_sub(1).min(16);
        let ceiling = self
            .options
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.options.max_wait);
        let ceiling_ms = ceiling.as_millis() as u64;
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }

        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
    }
}
