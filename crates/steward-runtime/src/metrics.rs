//! [`MetricsCollector`] – counters, gauges and histograms fed by bus events.
//!
//! Every event bumps `events.<kind>`.  Task outcomes additionally feed
//! `task.duration_ms` and `task.peak_memory_mb`, failures are counted per
//! reason under `task.failures.<reason>`, and pressure events set
//! `pressure.<resource>`.  Callers can add their own figures through
//! [`MetricsCollector::increment`], [`MetricsCollector::set_gauge`] and
//! [`MetricsCollector::observe`].
//!
//! The same figures are mirrored to the global OpenTelemetry meter, which is
//! a no-op unless a meter provider has been installed.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram};
use serde::{Deserialize, Serialize};
use steward_types::{EventPayload, KernelEvent};

/// Samples kept per histogram.
pub const HISTOGRAM_WINDOW: usize = 1024;

/// Distribution of the retained samples of one histogram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: usize,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl HistogramSummary {
    fn from_samples(samples: &VecDeque<f64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        let rank = |q: f64| sorted[((count as f64 * q) as usize).min(count - 1)];
        Self {
            count,
            sum,
            min: sorted[0],
            max: sorted[count - 1],
            avg: sum / count as f64,
            p50: rank(0.50),
            p95: rank(0.95),
            p99: rank(0.99),
        }
    }
}

/// Point-in-time copy of every metric, sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub histograms: BTreeMap<String, HistogramSummary>,
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    /// Prometheus text exposition.  Names get a `steward_` prefix with dots
    /// turned into underscores; histograms are exported as summaries.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.counters {
            let name = prometheus_name(name);
            let _ = writeln!(out, "# TYPE {name} counter\n{name} {value}");
        }
        for (name, value) in &self.gauges {
            let name = prometheus_name(name);
            let _ = writeln!(out, "# TYPE {name} gauge\n{name} {value}");
        }
        for (name, h) in &self.histograms {
            let name = prometheus_name(name);
            let _ = writeln!(out, "# TYPE {name} summary");
            for (q, v) in [("0.5", h.p50), ("0.95", h.p95), ("0.99", h.p99)] {
                let _ = writeln!(out, "{name}{{quantile=\"{q}\"}} {v}");
            }
            let _ = writeln!(out, "{name}_sum {}\n{name}_count {}", h.sum, h.count);
        }
        out
    }
}

fn prometheus_name(name: &str) -> String {
    let body: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("steward_{body}")
}

struct Instruments {
    events: Counter<u64>,
    failures: Counter<u64>,
    duration: Histogram<f64>,
}

impl Instruments {
    fn new() -> Self {
        let meter = opentelemetry::global::meter("steward");
        Self {
            events: meter
                .u64_counter("steward.events")
                .with_description("Kernel events by kind")
                .build(),
            failures: meter
                .u64_counter("steward.task.failures")
                .with_description("Failed task attempts by reason")
                .build(),
            duration: meter
                .f64_histogram("steward.task.duration")
                .with_unit("ms")
                .with_description("Wall time of finished task attempts")
                .build(),
        }
    }
}

pub struct MetricsCollector {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    histograms: HashMap<String, VecDeque<f64>>,
    otel: Instruments,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: HashMap::new(),
            gauges: HashMap::new(),
            histograms: HashMap::new(),
            otel: Instruments::new(),
        }
    }

    /// Fold one bus event into the metrics.
    pub fn record_event(&mut self, event: &KernelEvent) {
        let kind = event.payload.kind();
        self.increment(&format!("events.{kind}"), 1);
        self.otel.events.add(1, &[KeyValue::new("kind", kind)]);

        match &event.payload {
            EventPayload::TaskCompleted { usage, .. } => {
                if let Some(usage) = usage {
                    self.observe_usage(usage.elapsed_ms, usage.peak_memory_mb);
                }
            }
            EventPayload::TaskFailed { reason, usage, .. } => {
                let reason = reason.kind();
                self.increment(&format!("task.failures.{reason}"), 1);
                self.otel.failures.add(1, &[KeyValue::new("reason", reason)]);
                if let Some(usage) = usage {
                    self.observe_usage(usage.elapsed_ms, usage.peak_memory_mb);
                }
            }
            EventPayload::Pressure {
                resource, value, ..
            } => self.set_gauge(&format!("pressure.{resource}"), *value),
            EventPayload::Tick { tick } => self.set_gauge("scheduler.tick", *tick as f64),
            _ => {}
        }
    }

    fn observe_usage(&mut self, elapsed_ms: u64, peak_memory_mb: f64) {
        let elapsed = elapsed_ms as f64;
        self.observe("task.duration_ms", elapsed);
        self.observe("task.peak_memory_mb", peak_memory_mb);
        self.otel.duration.record(elapsed, &[]);
    }

    pub fn increment(&mut self, name: &str, by: u64) {
        let counter = self.counters.entry(name.to_string()).or_default();
        *counter = counter.saturating_add(by);
    }

    pub fn set_gauge(&mut self, name: &str, value: f64) {
        self.gauges.insert(name.to_string(), value);
    }

    /// Add a histogram sample.  Only the newest [`HISTOGRAM_WINDOW`] are kept.
    pub fn observe(&mut self, name: &str, value: f64) {
        let samples = self.histograms.entry(name.to_string()).or_default();
        if samples.len() >= HISTOGRAM_WINDOW {
            samples.pop_front();
        }
        samples.push_back(value);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.get(name).copied()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            gauges: self.gauges.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            histograms: self
                .histograms
                .iter()
                .map(|(k, v)| (k.clone(), HistogramSummary::from_samples(v)))
                .collect(),
        }
    }

    pub fn reset(&mut self) {
        self.counters.clear();
        self.gauges.clear();
        self.histograms.clear();
    }
}
