//! Stale-while-revalidate cache.
//!
//! - [`CacheEngine`]: the bounded, time-aware key/value store. Reads past
//!   an entry's TTL but inside the stale window return the old value
//!   immediately and start at most one background refresh per entry.
//! - [`CacheKey`]: the `(kind, owner, subject)` composite key.
//! - [`CacheEntry`]: a value plus the metadata used to age it.
//!
//! Every mutation is announced on the engine's [`EventBus`](crate::events::EventBus).

mod engine;
mod entry;
mod key;

pub use engine::{
    CacheEngine, CacheEngineBuilder, CacheStats, Lookup, RevalidationHandle, RevalidationOutcome,
};
pub use entry::{CacheEntry, Freshness};
pub use key::{ALL_SUBJECTS, ANONYMOUS_OWNER, CacheKey, KeyComponents};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::serde_ms;

/// Configuration for the cache engine.
///
/// ```rust
/// # use huginn::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .max_items(500)
///     .default_ttl(Duration::from_secs(60))
///     .stale_while_revalidate(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When false, every read misses and every write is dropped. Default: true.
    pub enabled: bool,
    /// TTL used by [`CacheEngine::set_default()`]. Default: 5 minutes.
    #[serde(rename = "default_ttl_ms", with = "serde_ms")]
    pub default_ttl: Duration,
    /// Maximum number of entries. Default: 100.
    pub max_items: usize,
    /// How long past its TTL an entry may still be served. Default: 30s.
    #[serde(rename = "stale_while_revalidate_ms", with = "serde_ms")]
    pub stale_while_revalidate: Duration,
    /// Log hits and misses at info level instead of debug. Default: false.
    pub debug: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(5 * 60),
            max_items: 100,
            stale_while_revalidate: Duration::from_secs(30),
            debug: false,
        }
    }
}

impl CacheConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn max_items(mut self, n: usize) -> Self {
        self.max_items = n;
        self
    }

    pub fn stale_while_revalidate(mut self, window: Duration) -> Self {
        self.stale_while_revalidate = window;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}
