//! A data source fronted by the cache, the retry executor, and the monitor.
//!
//! [`ResilientStore::load()`] is the read path the rest of an application
//! uses: fresh and stale hits are served from the cache (stale hits start
//! a background refresh), misses go to the [`DataSource`] through the
//! retry executor, and failures that reach the caller are tracked by the
//! correlation monitor first.

mod builder;

pub use builder::{Huginn, HuginnBuilder};

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::Result;
use crate::cache::{CacheEngine, CacheKey, CacheStats, RevalidationHandle};
use crate::events::{CacheEvent, EventBus, EventType, Subscription};
use crate::monitor::{CorrelationMonitor, ErrorContext, SweeperHandle, generate_correlation_id};
use crate::retry::RetryExecutor;

/// The backend behind the cache.
///
/// Implementations report failures as [`HuginnError`](crate::HuginnError)
/// values; [`HuginnError::Backend`](crate::HuginnError::Backend) carries a
/// raw status or error code and is classified automatically.
#[async_trait]
pub trait DataSource<V>: Send + Sync + 'static {
    /// Used as the component name when failures are tracked.
    fn name(&self) -> &str;

    /// Fetch the current value for `key`.
    async fn fetch(&self, key: &CacheKey) -> Result<V>;
}

/// A value returned by [`ResilientStore::load()`].
#[derive(Debug)]
pub struct Loaded<V> {
    pub value: V,
    /// True when `value` came from a stale cache entry.
    pub is_stale: bool,
    /// Present when this load started a background refresh.
    pub revalidation: Option<RevalidationHandle>,
}

impl<V> Loaded<V> {
    pub fn into_value(self) -> V {
        self.value
    }
}

/// Cache, retry executor, correlation monitor and event bus around one
/// [`DataSource`]. Built with [`Huginn::builder()`].
pub struct ResilientStore<V, S> {
    cache: CacheEngine<V>,
    executor: RetryExecutor,
    monitor: Arc<CorrelationMonitor>,
    source: Arc<S>,
    _sweeper: Option<SweeperHandle>,
}

impl<V, S> ResilientStore<V, S>
where
    V: Clone + Send + Sync + 'static,
    S: DataSource<V>,
{
    /// Read `key` through the cache.
    ///
    /// A failure is tracked under a freshly generated correlation id.
    pub async fn load(&self, key: &CacheKey) -> Result<Loaded<V>> {
        self.load_correlated(key, &generate_correlation_id()).await
    }

    /// Like [`load()`](Self::load), grouping a failure under `correlation_id`.
    pub async fn load_correlated(&self, key: &CacheKey, correlation_id: &str) -> Result<Loaded<V>> {
        let source = Arc::clone(&self.source);
        let refresh_key = key.clone();
        let lookup = self.cache.get_with(key, move || {
            let source = Arc::clone(&source);
            let key = refresh_key.clone();
            async move { source.fetch(&key).await }
        });
        if let Some(value) = lookup.value {
            return Ok(Loaded {
                value,
                is_stale: lookup.is_stale,
                revalidation: lookup.revalidation,
            });
        }

        match self.executor.execute("fetch", || self.source.fetch(key)).await {
            Ok(value) => {
                self.cache.set_default(key.clone(), value.clone());
                Ok(Loaded {
                    value,
                    is_stale: false,
                    revalidation: None,
                })
            }
            Err(err) => {
                warn!(
                    key = %key,
                    source = self.source.name(),
                    correlation_id,
                    error = %err,
                    "fetch failed"
                );
                self.monitor.track_error(
                    &err,
                    &ErrorContext::new()
                        .correlation_id(correlation_id)
                        .component(self.source.name())
                        .operation("fetch"),
                );
                Err(err)
            }
        }
    }

    /// Write `value` with the configured default TTL.
    pub fn store(&self, key: CacheKey, value: V) {
        self.cache.set_default(key, value);
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.cache.invalidate(key)
    }

    pub fn invalidate_by_owner(&self, owner_id: &str) -> usize {
        self.cache.invalidate_by_owner(owner_id)
    }

    pub fn invalidate_by_kind(&self, kind: &str) -> usize {
        self.cache.invalidate_by_kind(kind)
    }

    pub fn clear(&self) -> usize {
        self.cache.clear()
    }

    pub fn subscribe<F>(&self, filter: EventType, listener: F) -> Subscription
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.cache.subscribe(filter, listener)
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn cache(&self) -> &CacheEngine<V> {
        &self.cache
    }

    pub fn executor(&self) -> &RetryExecutor {
        &self.executor
    }

    pub fn monitor(&self) -> &Arc<CorrelationMonitor> {
        &self.monitor
    }

    pub fn events(&self) -> &EventBus {
        self.cache.events()
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}
