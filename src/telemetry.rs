//! Telemetry metric name constants.
//!
//! Centralised metric names for huginn operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `huginn_`. Counters end in `_total`.
//!
//! # Common labels
//!
//! - `kind`: classified error kind (e.g. "connection", "timeout")
//! - `operation`: operation name passed to the retry executor
//! - `outcome`: revalidation result: "refreshed", "failed" or "discarded"

/// Fresh cache hits.
pub const CACHE_HITS_TOTAL: &str = "huginn_cache_hits_total";

/// Stale cache hits (value served while past its TTL).
pub const CACHE_STALE_HITS_TOTAL: &str = "huginn_cache_stale_hits_total";

/// Cache misses, including entries that aged past the stale window.
pub const CACHE_MISSES_TOTAL: &str = "huginn_cache_misses_total";

/// Entries evicted to respect `max_items`.
pub const CACHE_EVICTIONS_TOTAL: &str = "huginn_cache_evictions_total";

/// Completed background revalidations.
///
/// Labels: `outcome`.
pub const REVALIDATIONS_TOTAL: &str = "huginn_revalidations_total";

/// Retry attempts (not counting the initial call).
///
/// Labels: `operation`, `kind`.
pub const RETRIES_TOTAL: &str = "huginn_retries_total";

/// Errors seen by the correlation monitor, sampled or not.
///
/// Labels: `kind`.
pub const ERRORS_TRACKED_TOTAL: &str = "huginn_errors_tracked_total";

/// Errors escalated to the report sink.
///
/// Labels: `kind`, `reason`.
pub const ERRORS_ESCALATED_TOTAL: &str = "huginn_errors_escalated_total";
