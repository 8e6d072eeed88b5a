//! Process-local counters rendered in Prometheus text format

use std::fmt::Write;
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
    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metrics for one cluster-facing process
#[derive(Debug)]
pub struct MetricsRegistry {
    pub add_shard_total: Counter,
    pub add_shard_duplicates: Counter,
    pub routing_flushes: Counter,
    pub database_flushes: Counter,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub cache_stale_reloads: Counter,
    pub session_refreshes: Counter,
    pub elections_started: Counter,
    pub elections_won: Counter,
    pub member_restarts: Counter,
    pub admin_errors: Counter,
    pub commit_index: Gauge,
    pub shard_count: Gauge,
    start_time: Instant,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            add_shard_total: Counter::new(),
            add_shard_duplicates: Counter::new(),
            routing_flushes: Counter::new(),
            database_flushes: Counter::new(),
            cache_hits: Counter::new(),
            cache_misses: Counter::new(),
            cache_stale_reloads: Counter::new(),
            session_refreshes: Counter::new(),
            elections_started: Counter::new(),
            elections_won: Counter::new(),
            member_restarts: Counter::new(),
            admin_errors: Counter::new(),
            commit_index: Gauge::default(),
            shard_count: Gauge::default(),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        let counters: [(&str, &str, &Counter); 12] = [
            ("add_shard_total", "addShard commands handled", &self.add_shard_total),
            (
                "add_shard_duplicates_total",
                "addShard commands that matched an existing shard",
                &self.add_shard_duplicates,
            ),
            ("routing_flushes_total", "Routing cache flushes", &self.routing_flushes),
            ("database_flushes_total", "Database cache flushes", &self.database_flushes),
            ("cache_hits_total", "Cache reads served locally", &self.cache_hits),
            ("cache_misses_total", "Cache reads that loaded from the store", &self.cache_misses),
            (
                "cache_stale_reloads_total",
                "Reloads forced by a required version",
                &self.cache_stale_reloads,
            ),
            ("session_refreshes_total", "Logical session cache refreshes", &self.session_refreshes),
            ("elections_started_total", "Elections started by local members", &self.elections_started),
            ("elections_won_total", "Elections won by local members", &self.elections_won),
            ("member_restarts_total", "Replica member restarts", &self.member_restarts),
            ("admin_errors_total", "Administrative commands that failed", &self.admin_errors),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP minicatalog_{} {}", name, help);
            let _ = writeln!(out, "# TYPE minicatalog_{} counter", name);
            let _ = writeln!(out, "minicatalog_{} {}", name, counter.get());
        }

        let gauges: [(&str, &str, u64); 3] = [
            ("commit_index", "Commit index of the local leader", self.commit_index.get()),
            ("shards", "Registered shards", self.shard_count.get()),
            ("uptime_seconds", "Process uptime in seconds", self.uptime_seconds()),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP minicatalog_{} {}", name, help);
            let _ = writeln!(out, "# TYPE minicatalog_{} gauge", name);
            let _ = writeln!(out, "minicatalog_{} {}", name, value);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_output() {
        let metrics = MetricsRegistry::new();
        metrics.add_shard_total.inc();
        metrics.add_shard_total.inc();
        metrics.shard_count.set(1);

        let out = metrics.to_prometheus();
        assert!(out.contains("minicatalog_add_shard_total 2"));
        assert!(out.contains("# TYPE minicatalog_shards gauge"));
        assert!(out.contains("minicatalog_shards 1"));
    }
}
