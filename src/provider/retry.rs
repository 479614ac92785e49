//! Rate-limit retry with exponential backoff and jitter.
//!
//! [`RetryPolicy`] controls how rate-limit errors are retried with
//! increasing delays. Only [`PipelineError::RateLimited`] is retried —
//! authentication and malformed-request failures fail fast, and other
//! transport errors surface to the caller.

use crate::error::Result;
use crate::PipelineError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Configuration for rate-limit retry with exponential backoff and jitter.
///
/// # Example
///
/// ```
/// use broadlisten::provider::RetryPolicy;
///
/// let policy = RetryPolicy::standard();
/// assert_eq!(policy.max_attempts, 3);
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts (first try included). Default: 3.
    pub max_attempts: u32,

    /// Smallest delay before a retry. Default: 3 seconds.
    pub base: Duration,

    /// Largest delay before a retry. Default: 20 seconds.
    pub max: Duration,

    /// Multiplier applied per attempt: the raw delay for attempt N is
    /// `base * multiplier^N`, capped at `max`. Default: 3.0.
    pub multiplier: f64,

    /// Whether to jitter the delay into `[base, capped]`. The lower bound
    /// stays at `base` so the configured minimum wait always holds.
    pub jitter: bool,
}

impl RetryPolicy {
    /// The pipeline default: 3 attempts, 3s..20s, multiplier 3, jittered.
    pub fn standard() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(3),
            max: Duration::from_secs(20),
            multiplier: 3.0,
            jitter: true,
        }
    }

    /// Single attempt, no waiting. For tests and local providers.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::standard()
        }
    }

    /// Delay before the retry following attempt N (0-indexed).
    ///
    /// A provider delay hint (`Retry-After`, Gemini `retry_delay`) is a hard
    /// lower bound on the result.
    pub fn delay_for_attempt(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let raw = self.base.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = raw.min(self.max.as_secs_f64());
        let base = self.base.as_secs_f64().min(capped);

        let delay = if self.jitter {
            base + fastrand::f64() * (capped - base)
        } else {
            capped
        };
        let delay = Duration::from_secs_f64(delay);

        match hint {
            Some(floor) if floor > delay => floor,
            _ => delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Run `f` under the retry policy.
///
/// Retries only [`PipelineError::RateLimited`]; after `max_attempts` the
/// last error surfaces. The cancellation flag is checked before every
/// attempt and after every sleep.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: Option<&AtomicBool>,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error: Option<PipelineError> = None;

    for attempt in 0..policy.max_attempts {
        if let Some(flag) = cancel {
            if flag.load(Ordering::Relaxed) {
                return Err(PipelineError::Cancelled);
            }
        }

        if attempt > 0 {
            let hint = last_error.as_ref().and_then(|e| e.retry_after());
            let delay = policy.delay_for_attempt(attempt - 1, hint);
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "rate limited, backing off"
            );
            tokio::time::sleep(delay).await;

            if let Some(flag) = cancel {
                if flag.load(Ordering::Relaxed) {
                    return Err(PipelineError::Cancelled);
                }
            }
        }

        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error
        .unwrap_or_else(|| PipelineError::Other("retry loop exited unexpectedly".into())))
}
