use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::artifacts::Tier;

/// Lookup counters for the two artifact tiers. Cheap to update from any task.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    memory_hits: AtomicU64,
    durable_hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
    tier1_errors: AtomicU64,
    publishes: AtomicU64,
    published_bytes: AtomicU64,
    hit_micros: AtomicU64,
    miss_micros: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheMetricsSnapshot {
    pub memory_hits: u64,
    pub durable_hits: u64,
    pub misses: u64,
    pub stale: u64,
    pub tier1_errors: u64,
    pub publishes: u64,
    pub published_bytes: u64,
    pub hit_ratio: f64,
    pub mean_hit_micros: u64,
    pub mean_miss_micros: u64,
}

fn micros(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}

impl CacheMetrics {
    pub(crate) fn record_hit(&self, tier: Tier, elapsed: Duration) {
        match tier {
            Tier::Memory => self.memory_hits.fetch_add(1, Ordering::Relaxed),
            Tier::Durable => self.durable_hits.fetch_add(1, Ordering::Relaxed),
        };
        self.hit_micros.fetch_add(micros(elapsed), Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self, elapsed: Duration, stale: bool) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        if stale {
            self.stale.fetch_add(1, Ordering::Relaxed);
        }
        self.miss_micros.fetch_add(micros(elapsed), Ordering::Relaxed);
    }

    pub(crate) fn record_tier1_error(&self) {
        self.tier1_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_publish(&self, payload_bytes: usize) {
        self.publishes.fetch_add(1, Ordering::Relaxed);
        self.published_bytes
            .fetch_add(u64::try_from(payload_bytes).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        let memory_hits = self.memory_hits.load(Ordering::Relaxed);
        let durable_hits = self.durable_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let hits = memory_hits + durable_hits;
        let lookups = hits + misses;

        #[allow(clippy::cast_precision_loss)]
        let hit_ratio = if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 };

        CacheMetricsSnapshot {
            memory_hits,
            durable_hits,
            misses,
            stale: self.stale.load(Ordering::Relaxed),
            tier1_errors: self.tier1_errors.load(Ordering::Relaxed),
            publishes: self.publishes.load(Ordering::Relaxed),
            published_bytes: self.published_bytes.load(Ordering::Relaxed),
            hit_ratio,
            mean_hit_micros: self.hit_micros.load(Ordering::Relaxed).checked_div(hits).unwrap_or(0),
            mean_miss_micros: self
                .miss_micros
                .load(Ordering::Relaxed)
                .checked_div(misses)
                .unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_ratio_and_means() {
        let metrics = CacheMetrics::default();
        metrics.record_hit(Tier::Memory, Duration::from_micros(10));
        metrics.record_hit(Tier::Durable, Duration::from_micros(30));
        metrics.record_miss(Duration::from_micros(100), true);
        metrics.record_publish(512);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.memory_hits, 1);
        assert_eq!(snapshot.durable_hits, 1);
        assert_eq!(snapshot.stale, 1);
        assert!((snapshot.hit_ratio - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(snapshot.mean_hit_micros, 20);
        assert_eq!(snapshot.mean_miss_micros, 100);
        assert_eq!(snapshot.published_bytes, 512);
    }

    #[test]
    fn empty_snapshot_has_zero_ratio() {
        assert!(CacheMetrics::default().snapshot().hit_ratio.abs() < f64::EPSILON);
    }
}
