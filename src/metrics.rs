//! Metrics registry and per-thread stats records.
//!
//! `Counter`/`Gauge`/`Histogram`/`MetricsRegistry` carry forward an
//! existing observability stack (USE/RED-style atomics-backed registry);
//! `SystemMetrics`/`NetworkMetrics` (CPU/disk/request-rate placeholders with
//! no counterpart here) are replaced with [`ThreadStats`], the
//! per-worker-thread record ported from
//! `original_source/NIOMan/Classes/pxythr/pxythr.c`'s `pxy_thr_print_info`:
//! max load, max fd, max atime/ctime, byte totals, watermark counts, a
//! timeout count, an error count, and an incrementing stats id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Counter for monotonically increasing values (e.g. bytes relayed).
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
    description: String,
}

impl Counter {
    pub fn new(description: impl Into<String>) -> Self {
        Self { value: AtomicU64::new(0), description: description.into() }
    }

    pub fn increment(&self) {
        self.increment_by(1);
    }

    pub fn increment_by(&self, amount: u64) {
        self.value.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Gauge for point-in-time measurements (e.g. active connections, thread load).
#[derive(Debug)]
pub struct Gauge {
    value: AtomicU64,
    description: String,
}

impl Gauge {
    pub fn new(description: impl Into<String>) -> Self {
        Self { value: AtomicU64::new(0), description: description.into() }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Latency/size distribution histogram with simple percentile estimation.
#[derive(Debug)]
pub struct Histogram {
    values: RwLock<Vec<u64>>,
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
    description: String,
}

impl Histogram {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            values: RwLock::new(Vec::new()),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
            description: description.into(),
        }
    }

    pub fn record(&self, value: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.min.fetch_min(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
        self.values.write().unwrap().push(value);
    }

    pub fn stats(&self) -> HistogramStats {
        let count = self.count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        let min = self.min.load(Ordering::Relaxed);
        let max = self.max.load(Ordering::Relaxed);
        let mean = if count > 0 { sum as f64 / count as f64 } else { 0.0 };

        let mut sorted = self.values.read().unwrap().clone();
        sorted.sort_unstable();
        let percentiles = Percentiles {
            p50: percentile(&sorted, 0.5),
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
        };

        HistogramStats { count, sum, min: if min == u64::MAX { 0 } else { min }, max, mean, percentiles }
    }
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let index = (p * (sorted.len() - 1) as f64) as usize;
    sorted[index]
}

#[derive(Debug, Clone, Default)]
pub struct HistogramStats {
    pub count: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub percentiles: Percentiles,
}

#[derive(Debug, Clone, Default)]
pub struct Percentiles {
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
}

/// Thread-safe named-metric registry. Workers and the orchestrator register
/// into one shared instance; `export_prometheus` renders it for scraping.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: RwLock<HashMap<String, Counter>>,
    gauges: RwLock<HashMap<String, Gauge>>,
    histograms: RwLock<HashMap<String, Histogram>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str, description: &str) -> u64 {
        let counters = self.counters.read().unwrap();
        if let Some(c) = counters.get(name) {
            return c.get();
        }
        drop(counters);
        self.counters.write().unwrap().entry(name.to_string()).or_insert_with(|| Counter::new(description)).get()
    }

    pub fn incr(&self, name: &str, description: &str, amount: u64) {
        let counters = self.counters.read().unwrap();
        if let Some(c) = counters.get(name) {
            c.increment_by(amount);
            return;
        }
        drop(counters);
        self.counters.write().unwrap().entry(name.to_string()).or_insert_with(|| Counter::new(description)).increment_by(amount);
    }

    pub fn set_gauge(&self, name: &str, description: &str, value: u64) {
        let gauges = self.gauges.read().unwrap();
        if let Some(g) = gauges.get(name) {
            g.set(value);
            return;
        }
        drop(gauges);
        self.gauges.write().unwrap().entry(name.to_string()).or_insert_with(|| Gauge::new(description)).set(value);
    }

    pub fn observe(&self, name: &str, description: &str, value: u64) {
        let histograms = self.histograms.read().unwrap();
        if let Some(h) = histograms.get(name) {
            h.record(value);
            return;
        }
        drop(histograms);
        self.histograms.write().unwrap().entry(name.to_string()).or_insert_with(|| Histogram::new(description)).record(value);
    }

    /// Renders every registered metric in Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();
        for (name, counter) in self.counters.read().unwrap().iter() {
            out.push_str(&format!("# HELP {name} {}\n# TYPE {name} counter\n{name} {}\n", counter.description(), counter.get()));
        }
        for (name, gauge) in self.gauges.read().unwrap().iter() {
            out.push_str(&format!("# HELP {name} {}\n# TYPE {name} gauge\n{name} {}\n", gauge.description(), gauge.get()));
        }
        for (name, histogram) in self.histograms.read().unwrap().iter() {
            let stats = histogram.stats();
            out.push_str(&format!(
                "# HELP {name} {}\n# TYPE {name} histogram\n{name}_count {}\n{name}_sum {}\n",
                histogram.description, stats.count, stats.sum
            ));
        }
        out
    }
}

/// Per-worker-thread stats record, emitted every `stats_period` idle-sweep
/// ticks. Field names and the "max carries forward, totals
/// reset" behavior are ported from `pxythr.c`'s `pxy_thr_print_info`: the
/// `max_*` fields hold the high-water mark across the thread's whole
/// lifetime, while the per-period counters (`watermark_set`/`_unset`,
/// `timedout_conns`, `errors`) reset to zero after each emission.
#[derive(Debug, Clone, Default)]
pub struct ThreadStats {
    pub stats_id: u64,
    pub max_load: usize,
    pub max_fd: i32,
    pub max_atime_secs: u64,
    pub max_ctime_secs: u64,
    pub total_in_bytes: u64,
    pub total_out_bytes: u64,
    pub watermark_set_count: u64,
    pub watermark_unset_count: u64,
    pub timedout_conns: u64,
    pub errors: u64,
}

impl ThreadStats {
    /// Folds one period's worth of per-period counters into a textual
    /// `STATS:` log line shape, matching the original's log granularity,
    /// and advances `stats_id`. Per-period counters are reset by the caller
    /// after this call; `max_*` fields are left untouched (they carry
    /// forward).
    pub fn render_stats_line(&self, thread_index: usize) -> String {
        format!(
            "STATS: thr={thread_index} id={} max_load={} max_fd={} in_bytes={} out_bytes={} wm_set={} wm_unset={} timedout={} errors={}",
            self.stats_id, self.max_load, self.max_fd, self.total_in_bytes, self.total_out_bytes,
            self.watermark_set_count, self.watermark_unset_count, self.timedout_conns, self.errors
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let registry = MetricsRegistry::new();
        registry.incr("conns_accepted", "connections accepted", 1);
        registry.incr("conns_accepted", "connections accepted", 2);
        assert_eq!(registry.counter("conns_accepted", ""), 3);
    }

    #[test]
    fn histogram_tracks_percentiles() {
        let h = Histogram::new("latency");
        for v in 1..=100 {
            h.record(v);
        }
        let stats = h.stats();
        assert_eq!(stats.count, 100);
        assert!(stats.percentiles.p50 >= 49 && stats.percentiles.p50 <= 51);
    }

    #[test]
    fn stats_line_carries_max_forward() {
        let stats = ThreadStats { stats_id: 3, max_load: 5, max_fd: 42, ..Default::default() };
        let line = stats.render_stats_line(0);
        assert!(line.contains("max_load=5"));
        assert!(line.contains("id=3"));
    }
}
