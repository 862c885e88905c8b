//! Builder for configuring store instances

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::{DataSource, ResilientStore};
use crate::Result;
use crate::cache::{CacheConfig, CacheEngine};
use crate::clock::{Clock, JitterSource, TokioClock};
use crate::config::HuginnConfig;
use crate::events::EventBus;
use crate::monitor::{CorrelationMonitor, MonitorConfig, ReportSink, TracingSink};
use crate::retry::{RetryExecutor, RetryPolicy};

/// Main entry point for creating store instances.
pub struct Huginn;

impl Huginn {
    /// Create a new builder for configuring a store.
    pub fn builder() -> HuginnBuilder {
        HuginnBuilder::new()
    }
}

/// Builder for configuring store instances.
pub struct HuginnBuilder {
    config: HuginnConfig,
    clock: Arc<dyn Clock>,
    jitter: Option<Arc<dyn JitterSource>>,
    sink: Arc<dyn ReportSink>,
    sweep_correlations: bool,
}

impl Default for HuginnBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HuginnBuilder {
    pub fn new() -> Self {
        Self {
            config: HuginnConfig::default(),
            clock: Arc::new(TokioClock),
            jitter: None,
            sink: Arc::new(TracingSink),
            sweep_correlations: false,
        }
    }

    /// Replace the whole configuration, e.g. one from [`HuginnConfig::load()`].
    pub fn config(mut self, config: HuginnConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    /// Retry policy for fetches after a cache miss.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Retry policy for background refreshes.
    pub fn revalidation(mut self, policy: RetryPolicy) -> Self {
        self.config.revalidation = policy;
        self
    }

    pub fn monitor(mut self, monitor: MonitorConfig) -> Self {
        self.config.monitor = monitor;
        self
    }

    /// Time source shared by the cache and the monitor.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Jitter source shared by both retry executors.
    pub fn jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Destination for escalated errors (default: [`TracingSink`]).
    pub fn report_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Periodically sweep old correlation records.
    ///
    /// The sweeper runs on the tokio runtime current at `build()` and
    /// stops when the store is dropped.
    pub fn sweep_correlations(mut self, enabled: bool) -> Self {
        self.sweep_correlations = enabled;
        self
    }

    /// Validate the configuration and wire the components around `source`.
    pub fn build<V, S>(self, source: S) -> Result<ResilientStore<V, S>>
    where
        V: Clone + Send + Sync + 'static,
        S: DataSource<V>,
    {
        self.config.validate()?;
        let HuginnConfig {
            cache,
            retry,
            revalidation,
            monitor,
        } = self.config;

        let monitor = Arc::new(
            CorrelationMonitor::new(monitor)
                .with_clock(Arc::clone(&self.clock))
                .with_sink(self.sink),
        );
        let bus = EventBus::new().with_monitor(Arc::clone(&monitor));

        let mut cache = CacheEngine::builder(cache)
            .clock(Arc::clone(&self.clock))
            .event_bus(bus)
            .revalidation_policy(revalidation)
            .monitor(Arc::clone(&monitor));
        let mut executor = RetryExecutor::new(retry);
        if let Some(jitter) = self.jitter {
            cache = cache.jitter(Arc::clone(&jitter));
            executor = executor.with_jitter(jitter);
        }

        let sweeper = if self.sweep_correlations {
            match Handle::try_current() {
                Ok(_) => Some(monitor.spawn_sweeper()),
                Err(_) => {
                    warn!("no tokio runtime at build time; correlation sweeper not started");
                    None
                }
            }
        } else {
            None
        };

        debug!(source = source.name(), "store built");
        Ok(ResilientStore {
            cache: cache.build(),
            executor,
            monitor,
            source: Arc::new(source),
            _sweeper: sweeper,
        })
    }
}
