//! Cache entries and their freshness lifecycle.

use std::time::Duration;

use crate::cache::KeyComponents;
use crate::clock::Instant;

/// Where an entry sits in its fresh → stale → expired lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// `age < ttl`
    Fresh,
    /// `ttl <= age < ttl + stale_window`
    Stale,
    /// `age >= ttl + stale_window`
    Expired,
}

/// A cached value with the metadata the engine needs to age it.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: Instant,
    pub ttl: Duration,
    pub components: KeyComponents,
    /// Set while a background refresh for this entry is in flight.
    pub revalidating: bool,
    pub last_revalidation_at: Option<Instant>,
    /// Identifies this exact write; a refresh only lands on the entry it
    /// was started for.
    pub(crate) generation: u64,
}

impl<V> CacheEntry<V> {
    pub(crate) fn new(
        value: V,
        created_at: Instant,
        ttl: Duration,
        components: KeyComponents,
        generation: u64,
    ) -> Self {
        Self {
            value,
            created_at,
            ttl,
            components,
            revalidating: false,
            last_revalidation_at: None,
            generation,
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn freshness(&self, now: Instant, stale_window: Duration) -> Freshness {
        let age = self.age(now);
        if age < self.ttl {
            Freshness::Fresh
        } else if age < self.ttl.saturating_add(stale_window) {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }
}
