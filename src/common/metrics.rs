//! Cluster metrics
//!
//! Prometheus-compatible counters and gauges for the coordination layer:
//! - Gossip merge and decode activity
//! - Peer evictions and directory size
//! - Replication fan-out results
//! - Tombstone pruning and peer sync volume

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counter for tracking event counts
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge for tracking current values
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Global metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    pub gossip_merges: Counter,
    pub gossip_decode_errors: Counter,
    pub peers_evicted: Counter,
    pub known_peers: Gauge,

    pub replication_pushes: Counter,
    pub replication_failures: Counter,

    pub tombstones_pruned: Counter,
    pub peer_syncs: Counter,
    pub entries_synced: Counter,

    /// Start time for uptime calculation
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            gossip_merges: Counter::new(),
            gossip_decode_errors: Counter::new(),
            peers_evicted: Counter::new(),
            known_peers: Gauge::new(),
            replication_pushes: Counter::new(),
            replication_failures: Counter::new(),
            tombstones_pruned: Counter::new(),
            peer_syncs: Counter::new(),
            entries_synced: Counter::new(),
            start_time: Instant::now(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 8] = [
            (
                "fleetkv_gossip_merges_total",
                "Remote gossip states merged",
                &self.gossip_merges,
            ),
            (
                "fleetkv_gossip_decode_errors_total",
                "Remote gossip states discarded as undecodable",
                &self.gossip_decode_errors,
            ),
            (
                "fleetkv_peers_evicted_total",
                "Peers evicted by reconciliation",
                &self.peers_evicted,
            ),
            (
                "fleetkv_replication_pushes_total",
                "Writes pushed to peers",
                &self.replication_pushes,
            ),
            (
                "fleetkv_replication_failures_total",
                "Failed replication pushes",
                &self.replication_failures,
            ),
            (
                "fleetkv_tombstones_pruned_total",
                "Tombstones removed by the prune sweep",
                &self.tombstones_pruned,
            ),
            (
                "fleetkv_peer_syncs_total",
                "Completed peer sync pulls",
                &self.peer_syncs,
            ),
            (
                "fleetkv_entries_synced_total",
                "Entries applied from peer sync pulls",
                &self.entries_synced,
            ),
        ];

        for (name, help, counter) in counters {
            out.push_str(&format!("# HELP {} {}\n", name, help));
            out.push_str(&format!("# TYPE {} counter\n", name));
            out.push_str(&format!("{} {}\n", name, counter.get()));
        }

        out.push_str("# HELP fleetkv_known_peers Peers currently in the directory\n");
        out.push_str("# TYPE fleetkv_known_peers gauge\n");
        out.push_str(&format!("fleetkv_known_peers {}\n", self.known_peers.get()));

        out.push_str("# HELP fleetkv_uptime_seconds Node uptime in seconds\n");
        out.push_str("# TYPE fleetkv_uptime_seconds gauge\n");
        out.push_str(&format!("fleetkv_uptime_seconds {}\n", self.uptime_seconds()));

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();

        assert_eq!(counter.get(), 0);
        counter.inc();
        assert_eq!(counter.get(), 1);
        counter.add(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new();
        gauge.set(10);
        assert_eq!(gauge.get(), 10);
    }

    #[test]
    fn test_prometheus_output() {
        let registry = MetricsRegistry::new();
        registry.replication_failures.inc();
        registry.known_peers.set(2);

        let text = registry.to_prometheus();
        assert!(text.contains("fleetkv_replication_failures_total 1"));
        assert!(text.contains("fleetkv_known_peers 2"));
        assert!(text.contains("# TYPE fleetkv_peer_syncs_total counter"));
    }
}
