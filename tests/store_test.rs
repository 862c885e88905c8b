//! Tests for [`ResilientStore`]: the cache, executor and monitor wired together.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use huginn::clock::{ManualClock, NoJitter};
use huginn::error::ErrorKind;
use huginn::{
    CacheConfig, CacheEvent, CacheKey, DataSource, EventType, Huginn, HuginnError, MonitorConfig,
    ResilientStore, Result, RetryPolicy, RevalidationOutcome,
};

// ============================================================================
// Mock data source
// ============================================================================

#[derive(Default)]
struct Profiles {
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl Profiles {
    fn failing() -> Self {
        let source = Self::default();
        source.failing.store(true, Ordering::SeqCst);
        source
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSource<String> for Profiles {
    fn name(&self) -> &str {
        "profiles"
    }

    async fn fetch(&self, key: &CacheKey) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.load(Ordering::SeqCst) {
            return Err(HuginnError::Timeout(Duration::from_secs(5)));
        }
        Ok(format!("{}#{n}", key.owner_segment()))
    }
}

type ProfileStore = ResilientStore<String, Profiles>;

fn quiet_monitor() -> MonitorConfig {
    MonitorConfig::new().error_rate_threshold(1_000.0)
}

fn profile(owner: &str) -> CacheKey {
    CacheKey::new("profile").owner(owner)
}

// ============================================================================
// Read path
// ============================================================================

#[tokio::test]
async fn miss_fetches_then_serves_from_cache() {
    let store: ProfileStore = Huginn::builder().build(Profiles::default()).unwrap();
    let key = profile("u1");

    let first = store.load(&key).await.unwrap();
    assert_eq!(first.value, "u1#1");
    assert!(!first.is_stale);

    let second = store.load(&key).await.unwrap();
    assert_eq!(second.value, "u1#1");
    assert_eq!(store.source().call_count(), 1);
}

#[tokio::test]
async fn stale_load_refreshes_through_the_source() {
    let clock = ManualClock::shared();
    let store: ProfileStore = Huginn::builder()
        .cache(CacheConfig::new().default_ttl(Duration::from_millis(100)))
        .clock(clock.clone())
        .build(Profiles::default())
        .unwrap();
    let key = profile("u1");
    store.load(&key).await.unwrap();

    clock.advance(Duration::from_millis(150));
    let stale = store.load(&key).await.unwrap();
    assert_eq!(stale.value, "u1#1");
    assert!(stale.is_stale);

    let outcome = stale.revalidation.unwrap().wait().await;
    assert_eq!(outcome, RevalidationOutcome::Refreshed);

    let fresh = store.load(&key).await.unwrap();
    assert_eq!(fresh.value, "u1#2");
    assert!(!fresh.is_stale);
    assert_eq!(store.source().call_count(), 2);
}

#[tokio::test]
async fn disabled_cache_always_hits_the_source() {
    let store: ProfileStore = Huginn::builder()
        .cache(CacheConfig::new().enabled(false))
        .build(Profiles::default())
        .unwrap();
    let key = profile("u1");
    assert_eq!(store.load(&key).await.unwrap().value, "u1#1");
    assert_eq!(store.load(&key).await.unwrap().value, "u1#2");
    assert_eq!(store.stats().size, 0);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn failed_fetch_is_retried_tracked_and_returned() {
    let store: ProfileStore = Huginn::builder()
        .retry(
            RetryPolicy::new()
                .max_retries(2)
                .base_delay(Duration::from_millis(10)),
        )
        .jitter(Arc::new(NoJitter))
        .monitor(quiet_monitor())
        .build(Profiles::failing())
        .unwrap();

    let err = store.load(&profile("u1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.retries_exhausted());
    assert_eq!(store.source().call_count(), 3);

    let correlations = store.monitor().correlations();
    assert_eq!(correlations.len(), 1);
    assert_eq!(correlations[0].component.as_deref(), Some("profiles"));
    assert_eq!(correlations[0].occurrence_count, 1);
    assert!(!store.cache().contains(&profile("u1")));
}

#[tokio::test]
async fn shared_correlation_id_groups_failures() {
    let store: ProfileStore = Huginn::builder()
        .retry(RetryPolicy::disabled())
        .monitor(quiet_monitor())
        .build(Profiles::failing())
        .unwrap();

    for _ in 0..2 {
        let result = store.load_correlated(&profile("u1"), "checkout-7").await;
        assert!(result.is_err());
    }
    let record = store.monitor().correlation("checkout-7").unwrap();
    assert_eq!(record.occurrence_count, 2);
    assert_eq!(store.monitor().correlation_count(), 1);
}

#[tokio::test]
async fn failed_background_refresh_is_invisible_but_tracked() {
    let clock = ManualClock::shared();
    let store: ProfileStore = Huginn::builder()
        .cache(CacheConfig::new().default_ttl(Duration::from_millis(100)))
        .revalidation(RetryPolicy::disabled())
        .monitor(quiet_monitor())
        .clock(clock.clone())
        .build(Profiles::default())
        .unwrap();
    let key = profile("u1");
    store.load(&key).await.unwrap();

    store.source().failing.store(true, Ordering::SeqCst);
    clock.advance(Duration::from_millis(150));
    let stale = store.load(&key).await.unwrap();
    assert_eq!(stale.value, "u1#1");
    assert_eq!(
        stale.revalidation.unwrap().wait().await,
        RevalidationOutcome::Failed {
            kind: ErrorKind::Timeout
        }
    );

    // stale value is still served
    let again = store.load(&key).await.unwrap();
    assert_eq!(again.value, "u1#1");
    assert!(again.is_stale);

    let record = store
        .monitor()
        .correlation("revalidate:profile:u1:all")
        .unwrap();
    assert_eq!(record.component.as_deref(), Some("cache"));
}

// ============================================================================
// Writes and events
// ============================================================================

#[tokio::test]
async fn store_and_invalidate_emit_events() {
    let store: ProfileStore = Huginn::builder().build(Profiles::default()).unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let subscription = store.subscribe(EventType::All, move |e| sink.lock().push(e.clone()));

    store.store(profile("u1"), "written".to_string());
    assert_eq!(store.load(&profile("u1")).await.unwrap().value, "written");
    assert_eq!(store.source().call_count(), 0);

    store.store(CacheKey::new("settings").owner("u1"), "dark".to_string());
    assert_eq!(store.invalidate_by_owner("u1"), 2);
    assert!(subscription.unsubscribe());
    store.clear();

    let events = events.lock();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0], CacheEvent::Set { key: profile("u1") });
    assert_eq!(
        events[2],
        CacheEvent::OwnerInvalidated {
            owner_id: "u1".into(),
            count: 2
        }
    );
}

#[tokio::test]
async fn invalidate_forces_a_refetch() {
    let store: ProfileStore = Huginn::builder().build(Profiles::default()).unwrap();
    let key = profile("u1");
    store.load(&key).await.unwrap();
    assert!(store.invalidate(&key));
    assert_eq!(store.load(&key).await.unwrap().value, "u1#2");

    assert_eq!(store.invalidate_by_kind("profile"), 1);
    assert!(store.stats().size == 0);
}

// ============================================================================
// Builder
// ============================================================================

#[test]
fn builder_rejects_invalid_config() {
    let result: Result<ProfileStore> = Huginn::builder()
        .monitor(MonitorConfig::new().sampling_rate(2.0))
        .build(Profiles::default());
    assert!(matches!(result, Err(HuginnError::Configuration(_))));
}

#[test]
fn builder_shares_one_bus_between_cache_and_store() {
    let store: ProfileStore = Huginn::builder().build(Profiles::default()).unwrap();
    let _ = store.events().subscribe(EventType::All, |_| {});
    assert_eq!(store.cache().events().listener_count(), 1);
    assert_eq!(store.executor().policy(), &RetryPolicy::default());
}

#[tokio::test(start_paused = true)]
async fn correlation_sweeper_runs_with_the_store() {
    let store: ProfileStore = Huginn::builder()
        .retry(RetryPolicy::disabled())
        .monitor(
            quiet_monitor()
                .max_correlation_age(Duration::from_secs(60))
                .sweep_interval(Duration::from_secs(30)),
        )
        .sweep_correlations(true)
        .build(Profiles::failing())
        .unwrap();

    let _ = store.load(&profile("u1")).await;
    assert_eq!(store.monitor().correlation_count(), 1);

    tokio::time::sleep(Duration::from_secs(100)).await;
    assert_eq!(store.monitor().correlation_count(), 0);
}
