use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use huginn::clock::{FixedJitter, NoJitter};
use huginn::error::ErrorKind;
use huginn::{HuginnError, Result, RetryExecutor, RetryPolicy, with_retry};

/// Operation that fails N times then succeeds.
struct FailThenSucceed {
    fail_count: AtomicU32,
    fail_with: fn() -> HuginnError,
    total_calls: AtomicU32,
}

impl FailThenSucceed {
    fn new(failures: u32, fail_with: fn() -> HuginnError) -> Arc<Self> {
        Arc::new(Self {
            fail_count: AtomicU32::new(failures),
            fail_with,
            total_calls: AtomicU32::new(0),
        })
    }

    fn always(fail_with: fn() -> HuginnError) -> Arc<Self> {
        Self::new(u32::MAX, fail_with)
    }

    async fn call(&self) -> Result<&'static str> {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_count.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_count.store(remaining - 1, Ordering::SeqCst);
            return Err((self.fail_with)());
        }
        Ok("ok")
    }

    fn call_count(&self) -> u32 {
        self.total_calls.load(Ordering::SeqCst)
    }
}

fn connection() -> HuginnError {
    HuginnError::Connection("connection reset by peer".into())
}

fn validation() -> HuginnError {
    HuginnError::Validation("email is malformed".into())
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy::new()
        .base_delay(Duration::from_millis(10))
        .jitter(false)
}

#[tokio::test(start_paused = true)]
async fn succeeds_after_transient_failures() {
    let op = FailThenSucceed::new(2, connection);
    let executor = RetryExecutor::new(fast_policy());

    let result = executor.execute("load", || op.call()).await;
    assert_eq!(result.unwrap(), "ok");
    assert_eq!(op.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_retries() {
    let op = FailThenSucceed::always(connection);
    let executor = RetryExecutor::new(fast_policy().max_retries(3));

    let err = executor.execute("load", || op.call()).await.unwrap_err();
    assert_eq!(op.call_count(), 4, "max_retries + 1 calls");
    assert!(err.retries_exhausted());
    assert!(err.is_retriable());
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(err.attempts(), Some(4));
    assert!(matches!(err.root(), HuginnError::Connection(_)));
}

#[tokio::test(start_paused = true)]
async fn non_retryable_kind_fails_immediately() {
    let op = FailThenSucceed::always(validation);
    let policy = RetryPolicy::new()
        .max_retries(2)
        .base_delay(Duration::from_millis(10))
        .retryable_kinds([ErrorKind::Connection]);
    let executor = RetryExecutor::new(policy);

    let start = Instant::now();
    let err = executor.execute("save", || op.call()).await.unwrap_err();
    assert_eq!(op.call_count(), 1);
    assert_eq!(start.elapsed(), Duration::ZERO, "no backoff sleep");
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(!err.is_retriable());
    assert!(!err.retries_exhausted());
    assert_eq!(err.attempts(), Some(1));
}

#[tokio::test(start_paused = true)]
async fn zero_retries_calls_once() {
    let op = FailThenSucceed::always(connection);
    let executor = RetryExecutor::new(RetryPolicy::disabled());

    let err = executor.execute("load", || op.call()).await.unwrap_err();
    assert_eq!(op.call_count(), 1);
    assert!(err.retries_exhausted());
}

#[tokio::test(start_paused = true)]
async fn sleeps_follow_exponential_schedule() {
    let op = FailThenSucceed::new(3, connection);
    let policy = fast_policy().max_retries(3);

    let start = Instant::now();
    let result = with_retry(&policy, &NoJitter, "load", || op.call()).await;
    assert!(result.is_ok());
    // 10 + 20 + 40
    assert_eq!(start.elapsed(), Duration::from_millis(70));
}

#[tokio::test(start_paused = true)]
async fn sleeps_follow_linear_schedule() {
    let op = FailThenSucceed::new(3, connection);
    let policy = fast_policy().max_retries(3).exponential_backoff(false);

    let start = Instant::now();
    with_retry(&policy, &NoJitter, "load", || op.call())
        .await
        .unwrap();
    // 10 + 20 + 30
    assert_eq!(start.elapsed(), Duration::from_millis(60));
}

#[tokio::test(start_paused = true)]
async fn retry_after_hint_overrides_backoff() {
    let op = FailThenSucceed::new(1, || HuginnError::RateLimited {
        retry_after: Some(Duration::from_secs(2)),
    });
    let executor = RetryExecutor::new(fast_policy());

    let start = Instant::now();
    executor.execute("load", || op.call()).await.unwrap();
    assert_eq!(start.elapsed(), Duration::from_secs(2));
    assert_eq!(op.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn retry_after_hint_is_capped_at_max_delay() {
    let op = FailThenSucceed::new(1, || HuginnError::RateLimited {
        retry_after: Some(Duration::from_secs(3600)),
    });
    let executor = RetryExecutor::new(fast_policy().max_delay(Duration::from_secs(5)));

    let start = Instant::now();
    executor.execute("load", || op.call()).await.unwrap();
    assert_eq!(start.elapsed(), Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn jitter_shifts_the_delay() {
    let op = FailThenSucceed::new(1, connection);
    let policy = RetryPolicy::new().base_delay(Duration::from_millis(100));
    let executor = RetryExecutor::new(policy).with_jitter(Arc::new(FixedJitter(-1.0)));

    let start = Instant::now();
    executor.execute("load", || op.call()).await.unwrap();
    // 100ms - 20%
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(79) && elapsed <= Duration::from_millis(81),
        "elapsed was {elapsed:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn backend_errors_are_classified_before_retrying() {
    let op = FailThenSucceed::always(|| HuginnError::Backend {
        code: Some("23505".into()),
        status: Some(409),
        message: "duplicate key value violates unique constraint".into(),
    });
    let executor = RetryExecutor::new(fast_policy());

    let err = executor.execute("insert", || op.call()).await.unwrap_err();
    assert_eq!(op.call_count(), 1);
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let op = FailThenSucceed::new(1, || HuginnError::Backend {
        code: None,
        status: Some(503),
        message: "service unavailable".into(),
    });
    executor.execute("select", || op.call()).await.unwrap();
    assert_eq!(op.call_count(), 2);
}

#[test]
fn exponential_delay_doubles_without_jitter() {
    let policy = RetryPolicy::new()
        .base_delay(Duration::from_millis(100))
        .max_delay(Duration::from_secs(3600))
        .jitter(false);
    for attempt in 0..8 {
        assert_eq!(
            policy.effective_delay(attempt + 1, None, &NoJitter),
            policy.effective_delay(attempt, None, &NoJitter) * 2
        );
    }
}

#[test]
fn delay_is_capped_at_max_delay() {
    let policy = RetryPolicy::new()
        .base_delay(Duration::from_secs(1))
        .max_delay(Duration::from_secs(5));
    assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
    assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
    assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(5));
}

#[test]
fn linear_delays_are_never_jittered() {
    let policy = RetryPolicy::new()
        .base_delay(Duration::from_millis(100))
        .exponential_backoff(false);
    assert_eq!(
        policy.effective_delay(1, None, &FixedJitter(1.0)),
        Duration::from_millis(200)
    );
}

#[test]
fn default_policy_retries_transient_kinds_only() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.max_retries, 3);
    assert_eq!(policy.base_delay, Duration::from_secs(1));
    for kind in ErrorKind::ALL {
        assert_eq!(policy.is_retryable(kind), kind.is_transient(), "{kind}");
    }
}
