//! Huginn - cache and resilience core for profile-data clients
//!
//! This crate sits between an application and a slow or unreliable data
//! backend. It provides:
//!
//! - a bounded stale-while-revalidate [`CacheEngine`] that serves stale
//!   values immediately and refreshes them in the background, at most once
//!   per entry at a time
//! - a [`RetryExecutor`] with exponential or linear backoff and jitter,
//!   driven by a classified [`ErrorKind`]
//! - a [`CorrelationMonitor`] that counts errors per minute, groups them by
//!   correlation id and escalates bursts or critical failures
//! - an [`EventBus`] announcing every cache mutation
//!
//! [`Huginn::builder()`] wires all four around a [`DataSource`].
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use huginn::{CacheKey, DataSource, Huginn, HuginnError, ResilientStore};
//!
//! struct Profiles;
//!
//! #[async_trait]
//! impl DataSource<String> for Profiles {
//!     fn name(&self) -> &str {
//!         "profiles"
//!     }
//!
//!     async fn fetch(&self, key: &CacheKey) -> huginn::Result<String> {
//!         match key.owner_segment() {
//!             "u1" => Ok("Acme".to_string()),
//!             other => Err(HuginnError::NotFound(other.to_string())),
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> huginn::Result<()> {
//!     let store: ResilientStore<String, Profiles> = Huginn::builder().build(Profiles)?;
//!
//!     let key = CacheKey::new("profile").owner("u1");
//!     let first = store.load(&key).await?;
//!     assert_eq!(first.value, "Acme");
//!
//!     // served from the cache this time
//!     assert!(store.cache().contains(&key));
//!     store.invalidate_by_owner("u1");
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod monitor;
pub mod retry;
pub mod store;
pub mod telemetry;

pub use cache::{
    CacheConfig, CacheEngine, CacheEntry, CacheKey, CacheStats, Freshness, Lookup,
    RevalidationHandle, RevalidationOutcome,
};
pub use config::{ConfigOverrides, Environment, HuginnConfig};
pub use error::{ErrorKind, HuginnError, Result, RetryFailure, Severity};
pub use events::{CacheEvent, EventBus, EventType, Subscription};
pub use monitor::{
    CorrelationMonitor, ErrorContext, ErrorReport, MonitorConfig, ReportSink, TrackOutcome,
    generate_correlation_id,
};
pub use retry::{RetryExecutor, RetryPolicy, with_retry};
pub use store::{DataSource, Huginn, HuginnBuilder, Loaded, ResilientStore};

/// Package version from Cargo.toml.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
