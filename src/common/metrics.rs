//! Cluster metrics
//!
//! Atomic counters and gauges for the coordination paths, rendered in the
//! Prometheus text format.

use std::sync::atomic::{AtomicU64, Ordering};
use once_cell::sync::Lazy;
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
    /// Write path
    pub writes_routed: Counter,
    pub writes_no_leader: Counter,
    pub writes_rejected_by_replica: Counter,
    pub queries_served: Counter,

    /// Election
    pub leaders_elected: Counter,
    pub leaders_lost: Counter,

    /// Replication
    pub catch_ups_started: Counter,
    pub catch_ups_failed: Counter,
    pub bulk_resyncs: Counter,

    /// Cluster view
    pub live_nodes: Gauge,
    pub state_version: Gauge,

    /// Start time for uptime calculation
    start_time: Instant,
}

pub static METRICS: Lazy<MetricsRegistry> = Lazy::new(MetricsRegistry::new);

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            writes_routed: Counter::new(),
            writes_no_leader: Counter::new(),
            writes_rejected_by_replica: Counter::new(),
            queries_served: Counter::new(),
            leaders_elected: Counter::new(),
            leaders_lost: Counter::new(),
            catch_ups_started: Counter::new(),
            catch_ups_failed: Counter::new(),
            bulk_resyncs: Counter::new(),
            live_nodes: Gauge::new(),
            state_version: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();

        let counters = [
            ("writes_routed_total", "Writes forwarded to a shard leader", &self.writes_routed),
            ("writes_no_leader_total", "Writes failed for lack of a live leader", &self.writes_no_leader),
            ("writes_rejected_total", "Writes refused by a non-leader replica", &self.writes_rejected_by_replica),
            ("queries_total", "Queries served by replicas", &self.queries_served),
            ("leaders_elected_total", "Shard leaders confirmed", &self.leaders_elected),
            ("leaders_lost_total", "Shard leaders cleared", &self.leaders_lost),
            ("catch_ups_total", "Replica catch-up attempts", &self.catch_ups_started),
            ("catch_up_failures_total", "Replica catch-ups that left the replica down", &self.catch_ups_failed),
            ("bulk_resyncs_total", "Full index copies from a leader", &self.bulk_resyncs),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP minishard_{} {}", name, help);
            let _ = writeln!(out, "# TYPE minishard_{} counter", name);
            let _ = writeln!(out, "minishard_{} {}", name, counter.get());
        }

        let gauges = [
            ("live_nodes", "Nodes currently registered as live", &self.live_nodes),
            ("state_version", "Substrate revision of the cached cluster state", &self.state_version),
        ];
        for (name, help, gauge) in gauges {
            let _ = writeln!(out, "# HELP minishard_{} {}", name, help);
            let _ = writeln!(out, "# TYPE minishard_{} gauge", name);
            let _ = writeln!(out, "minishard_{} {}", name, gauge.get());
        }

        let _ = writeln!(out, "# HELP minishard_uptime_seconds Process uptime");
        let _ = writeln!(out, "# TYPE minishard_uptime_seconds gauge");
        let _ = writeln!(out, "minishard_uptime_seconds {}", self.uptime_seconds());
        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
