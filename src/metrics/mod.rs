//! Cache statistics.
//!
//! Counters only move when statistics are enabled in the configuration;
//! gauges describing the cluster are always kept current. `current_entries`
//! is read from the entry store when a snapshot is taken, and the
//! cluster-wide entry count is gathered on demand by the cache.
//!
//! # Example
//!
//! ```rust,ignore
//! let stats = CacheStats::new(true);
//! stats.record_hit();
//! stats.record_miss();
//!
//! let snapshot = stats.snapshot(0);
//! assert_eq!(snapshot.hit_ratio, 0.5);
//! ```

mod counters;
mod gauges;

pub use counters::Counter;
pub use gauges::Gauge;

use parking_lot::Mutex;
use serde::Serialize;

/// A write acknowledged by fewer owners than configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegradedReplication {
    /// Key of the write.
    pub key: String,
    /// Owners that acknowledged.
    pub acked: usize,
    /// Configured number of owners.
    pub expected: usize,
    /// When the write completed, in milliseconds since the UNIX epoch.
    pub at_ms: u64,
}

/// Counters kept by a cache node.
#[derive(Debug)]
pub struct CacheStats {
    enabled: bool,

    /// Reads served from a live entry.
    pub hits: Counter,
    /// Reads that found nothing.
    pub misses: Counter,
    /// Puts issued by this node.
    pub stores: Counter,
    /// Removes issued by this node.
    pub removes: Counter,
    /// Entries found expired, lazily or by the reaper.
    pub expirations: Counter,
    /// Entries dropped because this node stopped owning their segment.
    pub evictions: Counter,
    /// Successful loader invocations.
    pub loads: Counter,
    /// Failed or timed out loader invocations.
    pub load_failures: Counter,
    /// Puts acknowledged by fewer owners than configured.
    pub degraded_writes: Counter,

    /// Members of the current view.
    pub cluster_members: Gauge,
    /// Segments still migrating after the last view change.
    pub migrating_segments: Gauge,

    last_degraded: Mutex<Option<DegradedReplication>>,
}

impl CacheStats {
    /// Create statistics; with `enabled == false` counters stay at zero.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            hits: Counter::new("cache_hits", "Reads served from a live entry"),
            misses: Counter::new("cache_misses", "Reads that found no live entry"),
            stores: Counter::new("cache_stores", "Puts issued by this node"),
            removes: Counter::new("cache_removes", "Removes issued by this node"),
            expirations: Counter::new("cache_expirations", "Entries found expired"),
            evictions: Counter::new("cache_evictions", "Entries dropped after losing ownership"),
            loads: Counter::new("cache_loads", "Successful value loads"),
            load_failures: Counter::new("cache_load_failures", "Failed value loads"),
            degraded_writes: Counter::new("cache_degraded_writes", "Puts acknowledged by too few owners"),
            cluster_members: Gauge::new("cluster_members", "Members in the current view"),
            migrating_segments: Gauge::new("cluster_migrating_segments", "Segments being transferred"),
            last_degraded: Mutex::new(None),
        }
    }

    fn count(&self, counter: &Counter, n: u64) {
        if self.enabled && n > 0 {
            counter.inc_by(n);
        }
    }

    pub fn record_hit(&self) {
        self.count(&self.hits, 1);
    }

    pub fn record_miss(&self) {
        self.count(&self.misses, 1);
    }

    pub fn record_store(&self) {
        self.count(&self.stores, 1);
    }

    pub fn record_remove(&self) {
        self.count(&self.removes, 1);
    }

    pub fn record_expirations(&self, n: u64) {
        self.count(&self.expirations, n);
    }

    pub fn record_evictions(&self, n: u64) {
        self.count(&self.evictions, n);
    }

    /// Record the outcome of a loader invocation.
    pub fn record_load(&self, success: bool) {
        if success {
            self.count(&self.loads, 1);
        } else {
            self.count(&self.load_failures, 1);
        }
    }

    /// Record a write that reached fewer owners than configured.
    pub fn record_degraded(&self, degraded: DegradedReplication) {
        if !self.enabled {
            return;
        }
        self.degraded_writes.inc();
        *self.last_degraded.lock() = Some(degraded);
    }

    /// Update the cluster gauges after a view change.
    pub fn update_cluster(&self, members: usize, migrating_segments: usize) {
        self.cluster_members.set(members as i64);
        self.migrating_segments.set(migrating_segments as i64);
    }

    /// Take a snapshot; `current_entries` is the local entry count.
    pub fn snapshot(&self, current_entries: usize) -> StatsSnapshot {
        let hits = self.hits.get();
        let misses = self.misses.get();
        let reads = hits + misses;
        StatsSnapshot {
            hits,
            misses,
            hit_ratio: if reads == 0 {
                0.0
            } else {
                hits as f64 / reads as f64
            },
            stores: self.stores.get(),
            removes: self.removes.get(),
            expirations: self.expirations.get(),
            evictions: self.evictions.get(),
            loads: self.loads.get(),
            load_failures: self.load_failures.get(),
            degraded_writes: self.degraded_writes.get(),
            last_degraded: self.last_degraded.lock().clone(),
            current_entries: current_entries as u64,
            cluster_members: self.cluster_members.get().max(0) as usize,
            migrating_segments: self.migrating_segments.get().max(0) as usize,
        }
    }

    /// Format the counters and gauges in Prometheus exposition format.
    pub fn to_prometheus(&self, current_entries: usize) -> String {
        let mut output = String::new();

        macro_rules! add_metric {
            ($kind:literal, $metric:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $metric.name(),
                    $metric.help(),
                    $metric.name(),
                    $kind,
                    $metric.name(),
                    $metric.get()
                ));
            };
        }

        add_metric!("counter", self.hits);
        add_metric!("counter", self.misses);
        add_metric!("counter", self.stores);
        add_metric!("counter", self.removes);
        add_metric!("counter", self.expirations);
        add_metric!("counter", self.evictions);
        add_metric!("counter", self.loads);
        add_metric!("counter", self.load_failures);
        add_metric!("counter", self.degraded_writes);
        add_metric!("gauge", self.cluster_members);
        add_metric!("gauge", self.migrating_segments);

        output.push_str(&format!(
            "# HELP cache_entries Live entries held locally\n\
             # TYPE cache_entries gauge\n\
             cache_entries {}\n",
            current_entries
        ));

        output
    }
}

/// Point-in-time copy of a node's statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0.0 before the first read.
    pub hit_ratio: f64,
    pub stores: u64,
    pub removes: u64,
    pub expirations: u64,
    pub evictions: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub degraded_writes: u64,
    /// Most recent degraded write, if any.
    pub last_degraded: Option<DegradedReplication>,
    /// Entries held locally.
    pub current_entries: u64,
    pub cluster_members: usize,
    pub migrating_segments: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let stats = CacheStats::new(true);
        assert_eq!(stats.snapshot(0).hit_ratio, 0.0);

        stats.record_miss();
        stats.record_hit();
        let snapshot = stats.snapshot(1);
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.misses, 1);
        assert!((snapshot.hit_ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(snapshot.current_entries, 1);
    }

    #[test]
    fn test_disabled_stats_do_not_count() {
        let stats = CacheStats::new(false);
        stats.record_hit();
        stats.record_store();
        stats.record_expirations(3);
        stats.record_degraded(DegradedReplication {
            key: "x".into(),
            acked: 1,
            expected: 2,
            at_ms: 0,
        });

        let snapshot = stats.snapshot(7);
        assert_eq!(snapshot.hits, 0);
        assert_eq!(snapshot.stores, 0);
        assert_eq!(snapshot.expirations, 0);
        assert_eq!(snapshot.degraded_writes, 0);
        assert!(snapshot.last_degraded.is_none());
        assert_eq!(snapshot.current_entries, 7);
    }

    #[test]
    fn test_degraded_keeps_latest() {
        let stats = CacheStats::new(true);
        for acked in [1, 0] {
            stats.record_degraded(DegradedReplication {
                key: format!("k{}", acked),
                acked,
                expected: 2,
                at_ms: 10,
            });
        }
        let snapshot = stats.snapshot(0);
        assert_eq!(snapshot.degraded_writes, 2);
        assert_eq!(snapshot.last_degraded.unwrap().key, "k0");
    }

    #[test]
    fn test_cluster_gauges_ignore_enabled_flag() {
        let stats = CacheStats::new(false);
        stats.update_cluster(3, 12);
        let snapshot = stats.snapshot(0);
        assert_eq!(snapshot.cluster_members, 3);
        assert_eq!(snapshot.migrating_segments, 12);
    }

    #[test]
    fn test_prometheus_output() {
        let stats = CacheStats::new(true);
        stats.record_hit();

        let output = stats.to_prometheus(4);
        assert!(output.contains("# TYPE cache_hits counter\ncache_hits 1"));
        assert!(output.contains("# TYPE cluster_members gauge"));
        assert!(output.contains("cache_entries 4"));
    }
}
