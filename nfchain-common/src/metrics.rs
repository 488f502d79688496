//! Metric sink consumed by the lifecycle engine.
//!
//! The engine only needs a narrow publish surface; the Prometheus
//! exposition endpoint that reads the registry lives outside this crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Number of times a network function was started.
pub const NF_START_COUNT: &str = "NFStartCount";
/// Number of times a network function was stopped.
pub const NF_STOP_COUNT: &str = "NFStopCount";
/// Number of config-map updates applied to a network function.
pub const NF_UPDATE_COUNT: &str = "NFUpdateCount";
/// Unix timestamp of the last successful start.
pub const NF_START_TIME: &str = "NFStartTime";
/// 1 while the network function is running, 0 otherwise.
pub const NF_RUNNING: &str = "NFRunning";
/// Aggregated value of one monitored eBPF map slot.
pub const NF_MONITOR_MAP: &str = "NFMonitorMap";

/// Narrow publish interface the lifecycle engine writes through.
pub trait MetricsSink: Send + Sync {
    /// Increment the counter `name` for the given label values.
    fn incr(&self, name: &str, labels: &[&str]);
    /// Set the gauge `name` for the given label values.
    fn set(&self, value: f64, name: &str, labels: &[&str]);
    /// Set the gauge `name` for the given label values, creating it on
    /// first use. Kept separate from `set` to match the sampler call site.
    fn set_value(&self, value: f64, name: &str, labels: &[&str]);
}

/* ---------------------------------------------------------------- *
 * Counter
 * ---------------------------------------------------------------- */

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/* ---------------------------------------------------------------- *
 * Gauge
 * ---------------------------------------------------------------- */

#[derive(Debug, Default)]
pub struct Gauge {
    bits: AtomicU64,
}

impl Gauge {
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn value(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/* ---------------------------------------------------------------- *
 * Registry
 * ---------------------------------------------------------------- */

/// In-memory metric registry keyed by `name{label,label,...}`.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: Mutex<HashMap<String, Counter>>,
    gauges: Mutex<HashMap<String, Gauge>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn series_key(name: &str, labels: &[&str]) -> String {
        format!("{}{{{}}}", name, labels.join(","))
    }

    /// Current value of a counter series, 0 if it was never incremented.
    pub fn counter_value(&self, name: &str, labels: &[&str]) -> u64 {
        let counters = self.counters.lock().unwrap();
        counters
            .get(&Self::series_key(name, labels))
            .map(Counter::value)
            .unwrap_or(0)
    }

    /// Current value of a gauge series, if it was ever set.
    pub fn gauge_value(&self, name: &str, labels: &[&str]) -> Option<f64> {
        let gauges = self.gauges.lock().unwrap();
        gauges.get(&Self::series_key(name, labels)).map(Gauge::value)
    }

    /// Snapshot of every series, for the exposition layer.
    pub fn snapshot(&self) -> Vec<(String, f64)> {
        let mut out = Vec::new();
        for (key, counter) in self.counters.lock().unwrap().iter() {
            out.push((key.clone(), counter.value() as f64));
        }
        for (key, gauge) in self.gauges.lock().unwrap().iter() {
            out.push((key.clone(), gauge.value()));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

impl MetricsSink for MetricsRegistry {
    fn incr(&self, name: &str, labels: &[&str]) {
        let mut counters = self.counters.lock().unwrap();
        counters
            .entry(Self::series_key(name, labels))
            .or_default()
            .increment();
    }

    fn set(&self, value: f64, name: &str, labels: &[&str]) {
        let mut gauges = self.gauges.lock().unwrap();
        gauges
            .entry(Self::series_key(name, labels))
            .or_default()
            .set(value);
    }

    fn set_value(&self, value: f64, name: &str, labels: &[&str]) {
        self.set(value, name, labels);
    }
}

/// Sink that drops every sample; used in tests and tools.
#[derive(Debug, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn incr(&self, _name: &str, _labels: &[&str]) {}
    fn set(&self, _value: f64, _name: &str, _labels: &[&str]) {}
    fn set_value(&self, _value: f64, _name: &str, _labels: &[&str]) {}
}
