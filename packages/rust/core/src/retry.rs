//! Bounded exponential-backoff retry for fetch and LLM calls.
//!
//! Each attempt is classified by the caller into an [`Attempt`]; the policy
//! branches on that value instead of inspecting errors itself.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use markwise_shared::{MarkwiseError, Result, RetryConfig};

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// How an error should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; back off and try again.
    Retryable,
    /// Provider asked us to slow down; back off for longer.
    RateLimited,
    /// Give up immediately.
    Terminal,
}

/// Result of a single attempt, after classification.
#[derive(Debug)]
pub enum Attempt<T> {
    Success(T),
    Retryable {
        error: MarkwiseError,
        /// Backoff before the next attempt.
        delay: Duration,
    },
    Terminal(MarkwiseError),
}

/// Classifier for render-engine errors.
///
/// Network failures, timeouts and 5xx are retried on the same engine; 429
/// backs off longer; any other status is terminal so the next engine runs.
pub fn classify_fetch_error(err: &MarkwiseError) -> ErrorClass {
    match err {
        MarkwiseError::Network(_) | MarkwiseError::Timeout(_) => ErrorClass::Retryable,
        MarkwiseError::RateLimited { .. } => ErrorClass::RateLimited,
        MarkwiseError::Http { status: 429, .. } => ErrorClass::RateLimited,
        MarkwiseError::Http { status: 408, .. } => ErrorClass::Retryable,
        MarkwiseError::Http { status, .. } if *status >= 500 => ErrorClass::Retryable,
        _ => ErrorClass::Terminal,
    }
}

/// Classifier for LLM provider errors. Schema problems are never retried
/// here; they get a single repair re-prompt instead.
pub fn classify_llm_error(err: &MarkwiseError) -> ErrorClass {
    match err {
        MarkwiseError::RateLimited { .. } | MarkwiseError::Http { status: 429, .. } => {
            ErrorClass::RateLimited
        }
        MarkwiseError::Timeout(_) | MarkwiseError::Network(_) => ErrorClass::Retryable,
        MarkwiseError::Http { status, .. } if *status >= 500 => ErrorClass::Retryable,
        _ => ErrorClass::Terminal,
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Retry settings shared by every wrapped call in a run.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    rate_limit_min: Duration,
    rate_limit_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.base_delay_ms))
            .with_rate_limit_window(
                Duration::from_millis(config.rate_limit_min_ms),
                Duration::from_millis(config.rate_limit_max_ms),
            )
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            rate_limit_min: Duration::from_secs(5),
            rate_limit_max: Duration::from_secs(15),
        }
    }

    /// Minimum wait after a rate-limit response, drawn uniformly from `[min, max]`.
    pub fn with_rate_limit_window(mut self, min: Duration, max: Duration) -> Self {
        self.rate_limit_min = min.min(max);
        self.rate_limit_max = max.max(min);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Un-jittered delay before retry number `attempt` (1-based):
    /// `base * 2^(attempt-1)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent)
    }

    /// Backoff plus uniform jitter in `[0, 50%]` of it.
    fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt);
        let max_jitter = (delay.as_millis() / 2) as u64;
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::rng().random_range(0..=max_jitter)
        };
        delay + Duration::from_millis(jitter)
    }

    /// Delay after a rate-limit error: the longest of the jittered backoff,
    /// a random draw from the rate-limit window and any `retry-after`.
    fn rate_limited_delay(&self, attempt: u32, err: &MarkwiseError) -> Duration {
        let min = self.rate_limit_min.as_millis() as u64;
        let max = self.rate_limit_max.as_millis() as u64;
        let window = Duration::from_millis(if max > min {
            rand::rng().random_range(min..=max)
        } else {
            min
        });

        let retry_after = match err {
            MarkwiseError::RateLimited { retry_after, .. } => retry_after.unwrap_or_default(),
            _ => Duration::ZERO,
        };

        self.jittered_delay(attempt).max(window).max(retry_after)
    }

    /// Classify the outcome of attempt number `attempt`.
    pub fn classify<T>(
        &self,
        attempt: u32,
        result: Result<T>,
        classify: impl Fn(&MarkwiseError) -> ErrorClass,
    ) -> Attempt<T> {
        match result {
            Ok(value) => Attempt::Success(value),
            Err(error) => match classify(&error) {
                ErrorClass::Terminal => Attempt::Terminal(error),
                ErrorClass::Retryable => Attempt::Retryable {
                    delay: self.jittered_delay(attempt),
                    error,
                },
                ErrorClass::RateLimited => Attempt::Retryable {
                    delay: self.rate_limited_delay(attempt, &error),
                    error,
                },
            },
        }
    }

    /// Run `operation` until it succeeds, fails terminally, or runs out of
    /// attempts. The last error is returned on failure.
    ///
    /// `cancel` is checked before every attempt and interrupts backoff sleeps;
    /// either case yields [`MarkwiseError::Cancelled`].
    pub async fn execute<T, F, Fut, C>(
        &self,
        mut operation: F,
        classify: C,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&MarkwiseError) -> ErrorClass,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(MarkwiseError::Cancelled);
            }

            match self.classify(attempt, operation().await, &classify) {
                Attempt::Success(value) => return Ok(value),
                Attempt::Terminal(error) => {
                    debug!(attempt, error = %error, "terminal error, not retrying");
                    return Err(error);
                }
                Attempt::Retryable { error, .. } if attempt >= self.max_attempts => {
                    warn!(attempt, error = %error, "retries exhausted");
                    return Err(error);
                }
                Attempt::Retryable { error, delay } => {
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retryable error, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(MarkwiseError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}
