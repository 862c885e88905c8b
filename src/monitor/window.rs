//! Fixed one-minute error-rate window.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::clock::Instant;
use crate::error::ErrorKind;

/// Length of a rate window.
pub const WINDOW_LENGTH: Duration = Duration::from_secs(60);

/// Below this much elapsed time the raw total is used as the rate.
const MIN_RATE_ELAPSED: Duration = Duration::from_secs(1);

/// Error counts since `window_start`.
///
/// The window is reset wholesale once it is older than [`WINDOW_LENGTH`];
/// it does not slide.
#[derive(Debug, Clone)]
pub struct ErrorRateWindow {
    pub window_start: Instant,
    pub counts_by_kind: BTreeMap<ErrorKind, u64>,
    pub total: u64,
}

/// Serializable copy of a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowSnapshot {
    pub elapsed_ms: u64,
    pub counts_by_kind: BTreeMap<ErrorKind, u64>,
    pub total: u64,
    pub errors_per_minute: f64,
}

impl ErrorRateWindow {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            counts_by_kind: BTreeMap::new(),
            total: 0,
        }
    }

    /// Start a new window if the current one is over a minute old.
    pub fn roll(&mut self, now: Instant) {
        if now.saturating_duration_since(self.window_start) > WINDOW_LENGTH {
            *self = Self::new(now);
        }
    }

    pub fn record(&mut self, kind: ErrorKind, now: Instant) {
        self.roll(now);
        *self.counts_by_kind.entry(kind).or_insert(0) += 1;
        self.total += 1;
    }

    /// `total / elapsed_minutes`, or the raw total when less than a second
    /// has elapsed.
    pub fn errors_per_minute(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < MIN_RATE_ELAPSED {
            return self.total as f64;
        }
        self.total as f64 / (elapsed.as_secs_f64() / 60.0)
    }

    pub fn snapshot(&self, now: Instant) -> WindowSnapshot {
        WindowSnapshot {
            elapsed_ms: now.saturating_duration_since(self.window_start).as_millis() as u64,
            counts_by_kind: self.counts_by_kind.clone(),
            total: self.total,
            errors_per_minute: self.errors_per_minute(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_total_under_one_second() {
        let t0 = Instant::now();
        let mut w = ErrorRateWindow::new(t0);
        w.record(ErrorKind::Timeout, t0);
        w.record(ErrorKind::Timeout, t0);
        w.record(ErrorKind::Connection, t0);
        assert_eq!(w.errors_per_minute(t0 + Duration::from_millis(500)), 3.0);
    }

    #[test]
    fn rate_scales_by_elapsed_minutes() {
        let t0 = Instant::now();
        let mut w = ErrorRateWindow::new(t0);
        for _ in 0..3 {
            w.record(ErrorKind::Timeout, t0);
        }
        // 3 errors in 30s = 6/min
        let rate = w.errors_per_minute(t0 + Duration::from_secs(30));
        assert!((rate - 6.0).abs() < 1e-9, "rate was {rate}");
    }

    #[test]
    fn resets_after_a_minute() {
        let t0 = Instant::now();
        let mut w = ErrorRateWindow::new(t0);
        w.record(ErrorKind::Timeout, t0);

        // exactly one minute is still the same window
        w.record(ErrorKind::Timeout, t0 + WINDOW_LENGTH);
        assert_eq!(w.total, 2);

        let later = t0 + WINDOW_LENGTH + Duration::from_millis(1);
        w.record(ErrorKind::Connection, later);
        assert_eq!(w.total, 1);
        assert_eq!(w.window_start, later);
        assert_eq!(w.counts_by_kind.get(&ErrorKind::Timeout), None);
        assert_eq!(w.counts_by_kind.get(&ErrorKind::Connection), Some(&1));
    }
}
