//! Correlation records: failures grouped by correlation id.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::clock::Instant;
use crate::error::ErrorKind;

/// Fraction of the store dropped when it grows past its bound.
const EVICTION_FRACTION: f64 = 0.2;

/// Failures that share one correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationRecord {
    pub correlation_id: String,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub occurrence_count: u64,
    pub error_kinds: BTreeSet<ErrorKind>,
    pub component: Option<String>,
}

/// Serializable view of a [`CorrelationRecord`], with ages instead of instants.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationSummary {
    pub correlation_id: String,
    pub occurrence_count: u64,
    pub error_kinds: BTreeSet<ErrorKind>,
    pub component: Option<String>,
    pub first_seen_ms_ago: u64,
    pub last_seen_ms_ago: u64,
}

impl CorrelationRecord {
    pub fn summary(&self, now: Instant) -> CorrelationSummary {
        CorrelationSummary {
            correlation_id: self.correlation_id.clone(),
            occurrence_count: self.occurrence_count,
            error_kinds: self.error_kinds.clone(),
            component: self.component.clone(),
            first_seen_ms_ago: now.saturating_duration_since(self.first_seen).as_millis() as u64,
            last_seen_ms_ago: now.saturating_duration_since(self.last_seen).as_millis() as u64,
        }
    }
}

/// Bounded map of correlation records.
#[derive(Debug)]
pub(crate) struct CorrelationStore {
    records: HashMap<String, CorrelationRecord>,
    max_entries: usize,
}

impl CorrelationStore {
    pub(crate) fn new(max_entries: usize) -> Self {
        Self {
            records: HashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Create or update the record for `id`. Returns its occurrence count.
    pub(crate) fn record(
        &mut self,
        id: &str,
        kind: ErrorKind,
        component: Option<&str>,
        now: Instant,
    ) -> u64 {
        let record = self
            .records
            .entry(id.to_string())
            .or_insert_with(|| CorrelationRecord {
                correlation_id: id.to_string(),
                first_seen: now,
                last_seen: now,
                occurrence_count: 0,
                error_kinds: BTreeSet::new(),
                component: None,
            });
        record.last_seen = now;
        record.occurrence_count += 1;
        record.error_kinds.insert(kind);
        if record.component.is_none() {
            record.component = component.map(str::to_string);
        }
        let count = record.occurrence_count;

        if self.records.len() > self.max_entries {
            self.evict_oldest(Some(id));
        }
        count
    }

    /// Drop the oldest 20% of records by `last_seen` (at least one).
    /// `keep` is never chosen, so the record just written survives even when
    /// its timestamp ties with the others.
    fn evict_oldest(&mut self, keep: Option<&str>) -> usize {
        let target = ((self.records.len() as f64 * EVICTION_FRACTION).ceil() as usize).max(1);
        let mut by_age: Vec<(Instant, String)> = self
            .records
            .values()
            .filter(|r| Some(r.correlation_id.as_str()) != keep)
            .map(|r| (r.last_seen, r.correlation_id.clone()))
            .collect();
        by_age.sort();
        by_age.truncate(target);
        for (_, id) in &by_age {
            self.records.remove(id);
        }
        by_age.len()
    }

    /// Remove records not seen for longer than `max_age`, then enforce the
    /// size bound. Returns how many records were removed.
    pub(crate) fn sweep(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, r| now.saturating_duration_since(r.last_seen) <= max_age);
        let mut removed = before - self.records.len();
        if self.records.len() > self.max_entries {
            removed += self.evict_oldest(None);
        }
        removed
    }

    pub(crate) fn get(&self, id: &str) -> Option<&CorrelationRecord> {
        self.records.get(id)
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = &CorrelationRecord> {
        self.records.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

/// Generate a correlation id for a new logical operation chain.
///
/// Format: `{unix_millis:x}-{random:08x}`.
pub fn generate_correlation_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("{millis:x}-{:08x}", fastrand::u32(..))
}
