//! Retry policy, delay calculation, and the retry executor.
//!
//! [`RetryPolicy`] controls how many times an operation is retried, which
//! [`ErrorKind`]s are worth retrying, and how long to wait between
//! attempts. [`RetryExecutor`] applies a policy to any async operation;
//! the free function [`with_retry`] does the same without an executor
//! value.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{JitterSource, RandomJitter};
use crate::config::serde_ms;
use crate::error::{ErrorKind, HuginnError, Result, RetryFailure};
use crate::telemetry;

/// Jitter amplitude as a fraction of the exponential delay.
pub const JITTER_FRACTION: f64 = 0.2;

/// Configuration for retry behaviour on transient errors.
///
/// ```rust
/// # use huginn::RetryPolicy;
/// # use huginn::error::ErrorKind;
/// # use std::time::Duration;
/// let policy = RetryPolicy::new()
///     .max_retries(2)
///     .base_delay(Duration::from_millis(10))
///     .retryable_kinds([ErrorKind::Connection]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt. 0 = no retry. Default: 3.
    pub max_retries: u32,
    /// Delay before the first retry. Default: 1s.
    #[serde(rename = "base_delay_ms", with = "serde_ms")]
    pub base_delay: Duration,
    /// Upper bound on any single delay. Default: 30s.
    #[serde(rename = "max_delay_ms", with = "serde_ms")]
    pub max_delay: Duration,
    /// Kinds that are retried; everything else fails on first sight.
    pub retryable_kinds: BTreeSet<ErrorKind>,
    /// `base * 2^attempt` when true, `base * (attempt + 1)` otherwise. Default: true.
    pub use_exponential_backoff: bool,
    /// Apply ±20% jitter to exponential delays. Default: true.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            retryable_kinds: ErrorKind::ALL
                .into_iter()
                .filter(ErrorKind::is_transient)
                .collect(),
            use_exponential_backoff: true,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy used for background cache refreshes (500ms base delay).
    pub fn for_revalidation() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            ..Self::default()
        }
    }

    /// Create a policy that never retries.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Replace the retryable kinds.
    pub fn retryable_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_kinds = kinds.into_iter().collect();
        self
    }

    pub fn exponential_backoff(mut self, enabled: bool) -> Self {
        self.use_exponential_backoff = enabled;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable_kinds.contains(&kind)
    }

    /// Delay before retry number `attempt + 1` (0-indexed), without jitter.
    ///
    /// Exponential: `base_delay * 2^attempt`. Linear: `base_delay * (attempt + 1)`.
    /// Both are capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = if self.use_exponential_backoff {
            self.base_delay
                .saturating_mul(2u32.saturating_pow(attempt))
        } else {
            self.base_delay.saturating_mul(attempt.saturating_add(1))
        };
        delay.min(self.max_delay)
    }

    /// Delay including jitter, respecting a server `retry_after` hint.
    /// The hint replaces the computed delay but is still capped at `max_delay`.
    ///
    /// Jitter is `sample * 20%` of the exponential delay, added to it and
    /// clamped at zero. Linear backoff is never jittered.
    pub fn effective_delay(
        &self,
        attempt: u32,
        retry_after: Option<Duration>,
        jitter: &dyn JitterSource,
    ) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max_delay);
        }
        let delay = self.delay_for_attempt(attempt);
        if !(self.use_exponential_backoff && self.jitter) {
            return delay;
        }
        let secs = delay.as_secs_f64();
        let offset = secs * JITTER_FRACTION * jitter.sample().clamp(-1.0, 1.0);
        Duration::from_secs_f64((secs + offset).max(0.0))
    }
}

/// Per-invocation bookkeeping.
#[derive(Debug, Default)]
struct RetryState {
    attempt: u32,
    last_error: Option<ErrorKind>,
    next_delay: Duration,
}

/// Applies a [`RetryPolicy`] to async operations.
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    jitter: Arc<dyn JitterSource>,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .field("jitter", &"<jitter>")
            .finish()
    }
}

impl RetryExecutor {
    /// Executor with random jitter.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            jitter: Arc::new(RandomJitter),
        }
    }

    /// Replace the jitter source.
    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `f` under this executor's policy.
    ///
    /// `operation` names the call in logs and metrics.
    pub async fn execute<F, Fut, T>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        with_retry(&self.policy, self.jitter.as_ref(), operation, f).await
    }
}

/// Execute an async operation with retry logic.
///
/// Failures are classified with [`HuginnError::kind()`]. Kinds outside the
/// policy's retryable set are returned immediately; retryable kinds are
/// retried up to `max_retries` times, so `f` runs at most
/// `max_retries + 1` times. Every error returned is a
/// [`HuginnError::Retry`] carrying the kind, the attempt count, and
/// whether retries were exhausted.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    jitter: &dyn JitterSource,
    operation: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut state = RetryState::default();
    loop {
        let err = match f().await {
            Ok(value) => {
                if state.attempt > 0 {
                    debug!(
                        operation,
                        attempts = state.attempt + 1,
                        last_error = ?state.last_error,
                        "operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        let kind = err.kind();
        let retriable = policy.is_retryable(kind);
        if !retriable || state.attempt >= policy.max_retries {
            return Err(HuginnError::Retry(Box::new(RetryFailure {
                source: err,
                kind,
                attempts: state.attempt + 1,
                retriable,
                retries_exhausted: retriable,
            })));
        }

        state.next_delay = policy.effective_delay(state.attempt, err.retry_after(), jitter);
        state.last_error = Some(kind);
        metrics::counter!(telemetry::RETRIES_TOTAL,
            "operation" => operation.to_owned(),
            "kind" => kind.as_str(),
        )
        .increment(1);
        warn!(
            operation,
            attempt = state.attempt + 1,
            max_retries = policy.max_retries,
            delay_ms = state.next_delay.as_millis() as u64,
            kind = %kind,
            error = %err,
            "retrying after transient error"
        );
        tokio::time::sleep(state.next_delay).await;
        state.attempt += 1;
    }
}
