//! Error-rate and correlation monitor.
//!
//! [`CorrelationMonitor::track_error()`] is the terminal sink for every
//! failure in the crate. It counts errors in a fixed one-minute window,
//! groups failures that share a correlation id, and escalates to a
//! [`ReportSink`] when the error rate crosses a threshold, the kind is
//! critical, or the severity meets the configured report level.
//!
//! The monitor never panics into its caller and never returns an error.
//! Correlation records are garbage collected by [`CorrelationMonitor::sweep()`],
//! which [`CorrelationMonitor::spawn_sweeper()`] runs on a fixed interval.

mod correlation;
mod window;

pub use correlation::{CorrelationRecord, CorrelationSummary, generate_correlation_id};
pub use window::{ErrorRateWindow, WINDOW_LENGTH, WindowSnapshot};

use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::clock::{Clock, TokioClock};
use crate::config::serde_ms;
use crate::error::{ErrorKind, HuginnError, Severity};
use crate::events::panic_message;
use crate::telemetry;
use correlation::CorrelationStore;

/// Configuration for the correlation monitor.
///
/// ```rust
/// # use huginn::MonitorConfig;
/// # use huginn::error::Severity;
/// let config = MonitorConfig::new()
///     .sampling_rate(0.1)
///     .error_rate_threshold(10.0)
///     .min_report_level(Severity::Critical);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// When false, `track_error` does nothing. Default: true.
    pub enabled: bool,
    /// Probability that an error gets detailed tracking, in `[0, 1]`.
    /// Sampled-out errors still count toward the error rate. Default: 1.0.
    pub sampling_rate: f64,
    /// Errors per minute at which every error is escalated. Default: 5.
    pub error_rate_threshold: f64,
    /// Errors at or above this severity are escalated. Default: critical.
    pub min_report_level: Severity,
    /// Kinds ignored entirely (unless also critical).
    pub disabled_kinds: BTreeSet<ErrorKind>,
    /// Kinds always tracked and always escalated. Default: server_internal.
    pub critical_kinds: BTreeSet<ErrorKind>,
    /// Maximum correlation records kept. Default: 1,000.
    pub max_correlations: usize,
    /// Records not seen for this long are swept. Default: 30 minutes.
    #[serde(rename = "max_correlation_age_ms", with = "serde_ms")]
    pub max_correlation_age: Duration,
    /// Sweep period for [`CorrelationMonitor::spawn_sweeper()`]. Default: 5 minutes.
    #[serde(rename = "sweep_interval_ms", with = "serde_ms")]
    pub sweep_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sampling_rate: 1.0,
            error_rate_threshold: 5.0,
            min_report_level: Severity::Critical,
            disabled_kinds: BTreeSet::new(),
            critical_kinds: BTreeSet::from([ErrorKind::ServerInternal]),
            max_correlations: 1_000,
            max_correlation_age: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl MonitorConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn sampling_rate(mut self, rate: f64) -> Self {
        self.sampling_rate = rate;
        self
    }

    pub fn error_rate_threshold(mut self, per_minute: f64) -> Self {
        self.error_rate_threshold = per_minute;
        self
    }

    pub fn min_report_level(mut self, level: Severity) -> Self {
        self.min_report_level = level;
        self
    }

    pub fn disabled_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.disabled_kinds = kinds.into_iter().collect();
        self
    }

    pub fn critical_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.critical_kinds = kinds.into_iter().collect();
        self
    }

    pub fn max_correlations(mut self, n: usize) -> Self {
        self.max_correlations = n;
        self
    }

    pub fn max_correlation_age(mut self, age: Duration) -> Self {
        self.max_correlation_age = age;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Where and why an error happened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub correlation_id: Option<String>,
    pub component: Option<String>,
    pub operation: Option<String>,
    /// Overrides the kind's default severity.
    pub severity: Option<Severity>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }
}

/// Why an error was escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    RateThreshold,
    CriticalKind,
    ReportLevel,
}

impl EscalationReason {
    fn as_str(&self) -> &'static str {
        match self {
            EscalationReason::RateThreshold => "rate_threshold",
            EscalationReason::CriticalKind => "critical_kind",
            EscalationReason::ReportLevel => "report_level",
        }
    }
}

/// An escalated error, as handed to a [`ReportSink`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    pub correlation_id: Option<String>,
    pub component: Option<String>,
    pub operation: Option<String>,
    pub errors_per_minute: f64,
    /// Occurrences so far under `correlation_id`.
    pub occurrence_count: Option<u64>,
    pub reasons: Vec<EscalationReason>,
}

/// Destination for escalated errors.
pub trait ReportSink: Send + Sync {
    fn report(&self, report: &ErrorReport);
}

/// Sink that writes escalations as `tracing` error events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn report(&self, report: &ErrorReport) {
        error!(
            kind = %report.kind,
            severity = %report.severity,
            correlation_id = report.correlation_id.as_deref().unwrap_or("-"),
            component = report.component.as_deref().unwrap_or("-"),
            operation = report.operation.as_deref().unwrap_or("-"),
            errors_per_minute = report.errors_per_minute,
            occurrences = report.occurrence_count.unwrap_or(0),
            reasons = ?report.reasons,
            message = %report.message,
            "error escalated"
        );
    }
}

/// What `track_error` did with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    /// The monitor is disabled.
    Disabled,
    /// Counted toward the rate only.
    SampledOut,
    /// The kind is disabled; nothing was recorded.
    Skipped,
    /// Recorded without escalation.
    Recorded,
    /// Recorded and sent to the sink.
    Escalated,
    /// The monitor failed internally and dropped the error.
    Dropped,
}

/// Error-rate window plus correlation store.
pub struct CorrelationMonitor {
    config: MonitorConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn ReportSink>,
    window: Mutex<ErrorRateWindow>,
    correlations: Mutex<CorrelationStore>,
}

impl std::fmt::Debug for CorrelationMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationMonitor")
            .field("config", &self.config)
            .field("correlations", &self.correlation_count())
            .finish()
    }
}

impl CorrelationMonitor {
    /// Monitor on tokio's clock, escalating through [`TracingSink`].
    pub fn new(config: MonitorConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        let now = clock.now();
        Self {
            correlations: Mutex::new(CorrelationStore::new(config.max_correlations)),
            window: Mutex::new(ErrorRateWindow::new(now)),
            config,
            clock,
            sink: Arc::new(TracingSink),
        }
    }

    /// Replace the clock. Restarts the rate window at the new clock's time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.window = Mutex::new(ErrorRateWindow::new(clock.now()));
        self.clock = clock;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Record a failure. Never panics and never fails.
    pub fn track_error(&self, error: &HuginnError, context: &ErrorContext) -> TrackOutcome {
        match panic::catch_unwind(AssertUnwindSafe(|| self.track(error, context))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                warn!(
                    panic = %panic_message(payload.as_ref()),
                    "correlation monitor failed; error dropped"
                );
                TrackOutcome::Dropped
            }
        }
    }

    fn track(&self, error: &HuginnError, context: &ErrorContext) -> TrackOutcome {
        if !self.config.enabled {
            return TrackOutcome::Disabled;
        }
        let kind = error.kind();
        let now = self.clock.now();
        let critical = self.config.critical_kinds.contains(&kind);
        metrics::counter!(telemetry::ERRORS_TRACKED_TOTAL, "kind" => kind.as_str()).increment(1);

        if !critical && self.config.disabled_kinds.contains(&kind) {
            return TrackOutcome::Skipped;
        }
        if !critical && !self.sampled() {
            self.window.lock().record(kind, now);
            return TrackOutcome::SampledOut;
        }

        let errors_per_minute = {
            let mut window = self.window.lock();
            window.record(kind, now);
            window.errors_per_minute(now)
        };
        let occurrence_count = context.correlation_id.as_deref().map(|id| {
            self.correlations
                .lock()
                .record(id, kind, context.component.as_deref(), now)
        });

        let severity = context.severity.unwrap_or_else(|| kind.severity());
        let mut reasons = Vec::new();
        if errors_per_minute >= self.config.error_rate_threshold {
            reasons.push(EscalationReason::RateThreshold);
        }
        if critical {
            reasons.push(EscalationReason::CriticalKind);
        }
        if severity >= self.config.min_report_level {
            reasons.push(EscalationReason::ReportLevel);
        }

        if reasons.is_empty() {
            debug!(
                kind = %kind,
                correlation_id = context.correlation_id.as_deref().unwrap_or("-"),
                errors_per_minute,
                "error recorded"
            );
            return TrackOutcome::Recorded;
        }

        let report = ErrorReport {
            kind,
            severity,
            message: error.to_string(),
            correlation_id: context.correlation_id.clone(),
            component: context.component.clone(),
            operation: context.operation.clone(),
            errors_per_minute,
            occurrence_count,
            reasons,
        };
        metrics::counter!(telemetry::ERRORS_ESCALATED_TOTAL,
            "kind" => kind.as_str(),
            "reason" => report.reasons[0].as_str(),
        )
        .increment(1);
        self.sink.report(&report);
        TrackOutcome::Escalated
    }

    fn sampled(&self) -> bool {
        let rate = self.config.sampling_rate;
        if rate >= 1.0 {
            true
        } else if rate <= 0.0 {
            false
        } else {
            fastrand::f64() < rate
        }
    }

    /// Errors per minute in the current window.
    pub fn error_rate(&self) -> f64 {
        let now = self.clock.now();
        let mut window = self.window.lock();
        window.roll(now);
        window.errors_per_minute(now)
    }

    pub fn window_snapshot(&self) -> WindowSnapshot {
        let now = self.clock.now();
        let mut window = self.window.lock();
        window.roll(now);
        window.snapshot(now)
    }

    pub fn correlation(&self, id: &str) -> Option<CorrelationRecord> {
        self.correlations.lock().get(id).cloned()
    }

    /// All live correlation records, most recently seen first.
    pub fn correlations(&self) -> Vec<CorrelationSummary> {
        let now = self.clock.now();
        let mut summaries: Vec<CorrelationSummary> = self
            .correlations
            .lock()
            .records()
            .map(|r| r.summary(now))
            .collect();
        summaries.sort_by_key(|s| s.last_seen_ms_ago);
        summaries
    }

    pub fn correlation_count(&self) -> usize {
        self.correlations.lock().len()
    }

    /// Drop correlation records older than `max_correlation_age` and trim
    /// the store to its bound. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let removed = self
            .correlations
            .lock()
            .sweep(now, self.config.max_correlation_age);
        if removed > 0 {
            debug!(removed, "swept correlation records");
        }
        removed
    }

    /// Run [`sweep()`](Self::sweep) every `sweep_interval` on the current
    /// tokio runtime.
    ///
    /// The task holds only a weak reference and ends once the monitor is
    /// dropped or the returned handle is dropped.
    ///
    /// # Panics
    ///
    /// Requires a tokio runtime context.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let monitor: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.sweep();
            }
        });
        SweeperHandle { task }
    }
}

/// Stops the periodic sweep when dropped.
#[derive(Debug)]
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn stop(self) {}

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
