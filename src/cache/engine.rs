//! The cache engine.
//!
//! # Locking
//!
//! One `parking_lot::Mutex` guards the entry map. The freshness decision,
//! eviction, and claiming an entry for revalidation all happen under that
//! lock, so two readers can never both start a refresh for the same entry.
//! Events are emitted and logs written only after the lock is released.
//!
//! # Background revalidation
//!
//! A stale read with a refresh function claims the entry (`revalidating =
//! true`) and spawns a tokio task that runs the refresh through the
//! engine's [`RetryExecutor`]. The task re-acquires the lock only to swap
//! in the new value. Each write gets a fresh generation number; a refresh
//! lands only on the generation it was started for, so a refresh never
//! overwrites a newer `set` or resurrects an invalidated key.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::entry::{CacheEntry, Freshness};
use super::{CacheConfig, CacheKey};
use crate::clock::{Clock, Instant, JitterSource, TokioClock};
use crate::error::{ErrorKind, HuginnError, Result};
use crate::events::{CacheEvent, EventBus, EventType, Subscription, panic_message};
use crate::monitor::{CorrelationMonitor, ErrorContext};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::telemetry;

/// Hit/miss logs go to info when `CacheConfig::debug` is set.
macro_rules! access_log {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            info!($($arg)+)
        } else {
            debug!($($arg)+)
        }
    };
}

/// Result of a cache read.
#[derive(Debug)]
pub struct Lookup<V> {
    /// The cached value, fresh or stale. `None` on a miss.
    pub value: Option<V>,
    /// True when `value` is past its TTL but inside the stale window.
    pub is_stale: bool,
    /// Present when this read started a background refresh.
    pub revalidation: Option<RevalidationHandle>,
}

impl<V> Lookup<V> {
    fn miss() -> Self {
        Self {
            value: None,
            is_stale: false,
            revalidation: None,
        }
    }

    pub fn is_hit(&self) -> bool {
        self.value.is_some()
    }

    pub fn into_value(self) -> Option<V> {
        self.value
    }
}

/// How a background refresh ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevalidationOutcome {
    /// The entry now holds the new value.
    Refreshed,
    /// The refresh failed; the stale value was kept.
    Failed { kind: ErrorKind },
    /// The refresh succeeded but the entry had been replaced or removed
    /// in the meantime, so the result was dropped.
    Discarded,
}

impl RevalidationOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RevalidationOutcome::Refreshed => "refreshed",
            RevalidationOutcome::Failed { .. } => "failed",
            RevalidationOutcome::Discarded => "discarded",
        }
    }
}

/// Completion signal for a background refresh.
///
/// Dropping the handle does not cancel the refresh.
#[derive(Debug)]
pub struct RevalidationHandle {
    join: JoinHandle<RevalidationOutcome>,
}

impl RevalidationHandle {
    /// Wait for the refresh to finish.
    ///
    /// A task that was cancelled before finishing reports
    /// `Failed { kind: Unknown }`; its claim on the entry has already been
    /// released.
    pub async fn wait(self) -> RevalidationOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(_) => RevalidationOutcome::Failed {
                kind: ErrorKind::Unknown,
            },
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Point-in-time view of the cache contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub fresh_count: usize,
    pub stale_count: usize,
    /// Entries past their stale window that no read has removed yet.
    pub expired_count: usize,
    pub revalidating_count: usize,
    pub max_items: usize,
    /// `size / max_items`.
    pub utilization: f64,
}

struct Store<V> {
    map: HashMap<CacheKey, CacheEntry<V>>,
    next_generation: u64,
}

impl<V> Store<V> {
    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

struct Inner<V> {
    store: Mutex<Store<V>>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    revalidator: RetryExecutor,
    monitor: Option<Arc<CorrelationMonitor>>,
}

/// Builder for [`CacheEngine`].
pub struct CacheEngineBuilder<V> {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    revalidation_policy: RetryPolicy,
    jitter: Option<Arc<dyn JitterSource>>,
    monitor: Option<Arc<CorrelationMonitor>>,
    _value: std::marker::PhantomData<fn() -> V>,
}

impl<V> CacheEngineBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            clock: Arc::new(TokioClock),
            bus: EventBus::new(),
            revalidation_policy: RetryPolicy::for_revalidation(),
            jitter: None,
            monitor: None,
            _value: std::marker::PhantomData,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Emit events on an existing bus instead of a private one.
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    /// Retry policy for background refreshes. Default: [`RetryPolicy::for_revalidation()`].
    pub fn revalidation_policy(mut self, policy: RetryPolicy) -> Self {
        self.revalidation_policy = policy;
        self
    }

    pub fn jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Report failed background refreshes to `monitor`.
    pub fn monitor(mut self, monitor: Arc<CorrelationMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn build(self) -> CacheEngine<V> {
        let mut revalidator = RetryExecutor::new(self.revalidation_policy);
        if let Some(jitter) = self.jitter {
            revalidator = revalidator.with_jitter(jitter);
        }
        let mut config = self.config;
        config.max_items = config.max_items.max(1);
        CacheEngine {
            inner: Arc::new(Inner {
                store: Mutex::new(Store {
                    map: HashMap::new(),
                    next_generation: 0,
                }),
                config,
                clock: self.clock,
                bus: self.bus,
                revalidator,
                monitor: self.monitor,
            }),
        }
    }
}

/// Bounded stale-while-revalidate cache.
///
/// Cloning is cheap and clones share the same store.
///
/// ```rust
/// # use huginn::{CacheConfig, CacheEngine, CacheKey};
/// # use std::time::Duration;
/// let cache: CacheEngine<String> = CacheEngine::new(CacheConfig::default());
/// let key = CacheKey::new("profile").owner("u1");
/// cache.set(key.clone(), "Acme".to_string(), Duration::from_secs(60));
///
/// let lookup = cache.get(&key);
/// assert_eq!(lookup.value.as_deref(), Some("Acme"));
/// assert!(!lookup.is_stale);
/// ```
pub struct CacheEngine<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for CacheEngine<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> CacheEngine<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create an engine with the default clock, a private event bus, and
    /// no monitor.
    pub fn new(config: CacheConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: CacheConfig) -> CacheEngineBuilder<V> {
        CacheEngineBuilder::new(config)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// The bus this engine emits on.
    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Shorthand for `self.events().subscribe(..)`.
    pub fn subscribe<F>(&self, filter: EventType, listener: F) -> Subscription
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(filter, listener)
    }

    /// Insert or replace `key`.
    ///
    /// When the key is new and the store is full, the entry with the
    /// oldest `created_at` is evicted first.
    pub fn set(&self, key: CacheKey, value: V, ttl: Duration) {
        if !self.inner.config.enabled {
            return;
        }
        let now = self.inner.clock.now();
        let max_items = self.inner.config.max_items;

        let mut store = self.inner.store.lock();
        let evicted = if !store.map.contains_key(&key) && store.map.len() >= max_items {
            let oldest = store
                .map
                .iter()
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(k, _)| k.clone());
            if let Some(ref victim) = oldest {
                store.map.remove(victim);
            }
            oldest
        } else {
            None
        };
        let generation = store.bump();
        let components = key.components();
        store.map.insert(
            key.clone(),
            CacheEntry::new(value, now, ttl, components, generation),
        );
        let size = store.map.len();
        drop(store);

        if let Some(victim) = evicted {
            metrics::counter!(telemetry::CACHE_EVICTIONS_TOTAL).increment(1);
            info!(key = %victim, max_items, "evicted oldest cache entry");
            self.inner.bus.emit(CacheEvent::Evicted { key: victim });
        }
        debug!(key = %key, ttl_ms = ttl.as_millis() as u64, size, "cache set");
        self.inner.bus.emit(CacheEvent::Set { key });
    }

    /// Insert using the configured default TTL.
    pub fn set_default(&self, key: CacheKey, value: V) {
        let ttl = self.inner.config.default_ttl;
        self.set(key, value, ttl);
    }

    /// Read `key` without starting a refresh.
    pub fn get(&self, key: &CacheKey) -> Lookup<V> {
        self.read(key, false).0
    }

    /// Read `key`; if the entry is stale and no refresh is in flight,
    /// start one in the background using `revalidate`.
    ///
    /// The stale value is returned immediately either way. A refresh needs
    /// a tokio runtime; outside one the read behaves like [`get()`](Self::get).
    pub fn get_with<F, Fut>(&self, key: &CacheKey, revalidate: F) -> Lookup<V>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let Ok(runtime) = Handle::try_current() else {
            let lookup = self.get(key);
            if lookup.is_stale {
                warn!(key = %key, "stale cache hit outside a tokio runtime; not revalidating");
            }
            return lookup;
        };
        let (mut lookup, claimed) = self.read(key, true);
        if let Some(generation) = claimed {
            lookup.revalidation =
                Some(self.spawn_revalidation(&runtime, key.clone(), generation, revalidate));
        }
        lookup
    }

    /// The freshness decision. When `claim` is set and the entry is stale
    /// and idle, marks it revalidating and returns its generation.
    fn read(&self, key: &CacheKey, claim: bool) -> (Lookup<V>, Option<u64>) {
        let verbose = self.inner.config.debug;
        if !self.inner.config.enabled {
            return (Lookup::miss(), None);
        }
        let now = self.inner.clock.now();
        let window = self.inner.config.stale_while_revalidate;

        let mut store = self.inner.store.lock();
        let freshness = store.map.get(key).map(|entry| entry.freshness(now, window));
        match freshness {
            None => {
                drop(store);
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
                access_log!(verbose, key = %key, "cache miss");
                (Lookup::miss(), None)
            }
            Some(Freshness::Expired) => {
                store.map.remove(key);
                drop(store);
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
                access_log!(verbose, key = %key, "cache entry expired");
                self.inner.bus.emit(CacheEvent::Expired { key: key.clone() });
                (Lookup::miss(), None)
            }
            Some(Freshness::Fresh) => {
                let value = store.map.get(key).map(|entry| entry.value.clone());
                drop(store);
                metrics::counter!(telemetry::CACHE_HITS_TOTAL).increment(1);
                access_log!(verbose, key = %key, "cache hit");
                let lookup = Lookup {
                    value,
                    is_stale: false,
                    revalidation: None,
                };
                (lookup, None)
            }
            Some(Freshness::Stale) => {
                let mut claimed = None;
                let mut value = None;
                if let Some(entry) = store.map.get_mut(key) {
                    if claim && !entry.revalidating {
                        entry.revalidating = true;
                        entry.last_revalidation_at = Some(now);
                        claimed = Some(entry.generation);
                    }
                    value = Some(entry.value.clone());
                }
                drop(store);
                metrics::counter!(telemetry::CACHE_STALE_HITS_TOTAL).increment(1);
                access_log!(
                    verbose,
                    key = %key,
                    revalidating = claimed.is_some(),
                    "stale cache hit"
                );
                let lookup = Lookup {
                    value,
                    is_stale: true,
                    revalidation: None,
                };
                (lookup, claimed)
            }
        }
    }

    fn spawn_revalidation<F, Fut>(
        &self,
        runtime: &Handle,
        key: CacheKey,
        generation: u64,
        revalidate: F,
    ) -> RevalidationHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let claim = RevalidationClaim {
            inner: Arc::clone(&self.inner),
            key,
            generation,
            armed: true,
        };
        debug!(key = %claim.key, "starting background revalidation");
        let join = runtime.spawn(async move {
            let mut claim = claim;
            let attempt = claim.inner.revalidator.execute("revalidate", || revalidate());
            let result = match AssertUnwindSafe(attempt).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(HuginnError::Panicked(panic_message(payload.as_ref()))),
            };
            claim.armed = false;
            claim
                .inner
                .finish_revalidation(&claim.key, claim.generation, result)
        });
        RevalidationHandle { join }
    }

    /// Remove `key`. Returns whether an entry was present.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = self.inner.store.lock().map.remove(key).is_some();
        if removed {
            info!(key = %key, "cache entry invalidated");
            self.inner
                .bus
                .emit(CacheEvent::Invalidated { key: key.clone() });
        }
        removed
    }

    /// Remove every entry owned by `owner_id`.
    pub fn invalidate_by_owner(&self, owner_id: &str) -> usize {
        let count = self.remove_where(|entry| entry.components.matches_owner(owner_id));
        if count > 0 {
            info!(owner_id, count, "cache entries invalidated by owner");
            self.inner.bus.emit(CacheEvent::OwnerInvalidated {
                owner_id: owner_id.to_string(),
                count,
            });
        }
        count
    }

    /// Remove every entry of `kind`.
    pub fn invalidate_by_kind(&self, kind: &str) -> usize {
        let count = self.remove_where(|entry| entry.components.matches_kind(kind));
        if count > 0 {
            info!(kind, count, "cache entries invalidated by kind");
            self.inner.bus.emit(CacheEvent::KindInvalidated {
                kind: kind.to_string(),
                count,
            });
        }
        count
    }

    /// Remove everything. Returns the number of entries dropped.
    pub fn clear(&self) -> usize {
        let count = {
            let mut store = self.inner.store.lock();
            let count = store.map.len();
            store.map.clear();
            count
        };
        info!(count, "cache cleared");
        self.inner.bus.emit(CacheEvent::Cleared { count });
        count
    }

    /// Drop every entry past its stale window.
    pub fn purge_expired(&self) -> usize {
        let now = self.inner.clock.now();
        let window = self.inner.config.stale_while_revalidate;
        let expired: Vec<CacheKey> = {
            let mut store = self.inner.store.lock();
            let keys: Vec<CacheKey> = store
                .map
                .iter()
                .filter(|(_, entry)| entry.freshness(now, window) == Freshness::Expired)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                store.map.remove(key);
            }
            keys
        };
        let count = expired.len();
        for key in expired {
            self.inner.bus.emit(CacheEvent::Expired { key });
        }
        if count > 0 {
            debug!(count, "purged expired cache entries");
        }
        count
    }

    fn remove_where(&self, predicate: impl Fn(&CacheEntry<V>) -> bool) -> usize {
        let mut store = self.inner.store.lock();
        let before = store.map.len();
        store.map.retain(|_, entry| !predicate(entry));
        before - store.map.len()
    }

    /// Whether `key` holds a fresh or stale value.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = self.inner.clock.now();
        let window = self.inner.config.stale_while_revalidate;
        self.inner
            .store
            .lock()
            .map
            .get(key)
            .is_some_and(|entry| entry.freshness(now, window) != Freshness::Expired)
    }

    /// Snapshot of an entry's metadata and value, without touching its state.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        self.inner.store.lock().map.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.store.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let now = self.inner.clock.now();
        let window = self.inner.config.stale_while_revalidate;
        let max_items = self.inner.config.max_items;
        let store = self.inner.store.lock();
        let mut stats = CacheStats {
            size: store.map.len(),
            max_items,
            ..CacheStats::default()
        };
        for entry in store.map.values() {
            match entry.freshness(now, window) {
                Freshness::Fresh => stats.fresh_count += 1,
                Freshness::Stale => stats.stale_count += 1,
                Freshness::Expired => stats.expired_count += 1,
            }
            if entry.revalidating {
                stats.revalidating_count += 1;
            }
        }
        stats.utilization = stats.size as f64 / max_items as f64;
        stats
    }
}

/// Owned by a refresh task. If the task is dropped before it finishes
/// (runtime shutdown, abort), the entry's `revalidating` flag is released so a
/// later stale read can claim it again.
struct RevalidationClaim<V> {
    inner: Arc<Inner<V>>,
    key: CacheKey,
    generation: u64,
    armed: bool,
}

impl<V> Drop for RevalidationClaim<V> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut store = self.inner.store.lock();
        if let Some(entry) = store.map.get_mut(&self.key) {
            if entry.generation == self.generation {
                entry.revalidating = false;
            }
        }
        drop(store);
        debug!(key = %self.key, "background revalidation cancelled; claim released");
    }
}

impl<V> Inner<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn finish_revalidation(
        &self,
        key: &CacheKey,
        generation: u64,
        result: Result<V>,
    ) -> RevalidationOutcome {
        let now: Instant = self.clock.now();
        let outcome = match result {
            Ok(value) => {
                let mut store = self.store.lock();
                let next = store.next_generation + 1;
                let replaced = match store.map.get_mut(key) {
                    Some(entry) if entry.generation == generation => {
                        entry.value = value;
                        entry.created_at = now;
                        entry.revalidating = false;
                        entry.generation = next;
                        true
                    }
                    _ => false,
                };
                if replaced {
                    store.next_generation = next;
                }
                drop(store);

                if replaced {
                    debug!(key = %key, "background revalidation refreshed entry");
                    self.bus.emit(CacheEvent::Updated { key: key.clone() });
                    RevalidationOutcome::Refreshed
                } else {
                    debug!(key = %key, "entry changed during revalidation; result dropped");
                    RevalidationOutcome::Discarded
                }
            }
            Err(err) => {
                {
                    let mut store = self.store.lock();
                    if let Some(entry) = store.map.get_mut(key) {
                        if entry.generation == generation {
                            entry.revalidating = false;
                        }
                    }
                }
                let kind = err.kind();
                warn!(key = %key, kind = %kind, error = %err, "background revalidation failed; keeping stale value");
                if let Some(monitor) = &self.monitor {
                    monitor.track_error(
                        &err,
                        &ErrorContext::new()
                            .correlation_id(format!("revalidate:{key}"))
                            .component("cache")
                            .operation("revalidate"),
                    );
                }
                RevalidationOutcome::Failed { kind }
            }
        };
        metrics::counter!(telemetry::REVALIDATIONS_TOTAL, "outcome" => outcome.as_str())
            .increment(1);
        outcome
    }
}
