//! Metrics export functionality for simulation results.
//!
//! This module provides an in-memory recorder for the `metrics` facade that
//! collects everything entities emit during a run and can export it in JSON
//! or Prometheus format. Values are broken down by the `node` and `phy`
//! labels every mqsim metric carries.

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// Export Types
// ============================================================================

/// Metric values of one breakdown bucket (a node or a technology).
#[derive(Debug, Default, Clone, Serialize)]
pub struct MetricGroup {
    /// Counter metrics.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, u64>,
    /// Gauge metrics.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub gauges: BTreeMap<String, f64>,
    /// Histogram metrics.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Collected metric data for export.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsExport {
    /// Scenario label of the run.
    pub label: String,
    /// Virtual time the export was taken at.
    pub sim_time_s: f64,
    /// Totals across all nodes.
    pub totals: MetricGroup,
    /// Per-node breakdown.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<String, MetricGroup>,
    /// Per-technology breakdown.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub protocols: BTreeMap<String, MetricGroup>,
}

/// Summary statistics for a histogram metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSummary {
    /// Number of samples recorded.
    pub count: u64,
    /// Sum of all samples.
    pub sum: f64,
    /// Minimum value.
    pub min: f64,
    /// Maximum value.
    pub max: f64,
    /// Mean value.
    pub mean: f64,
    /// 50th percentile (median).
    pub p50: f64,
    /// 90th percentile.
    pub p90: f64,
    /// 99th percentile.
    pub p99: f64,
}

// ============================================================================
// Export Functions
// ============================================================================

/// Export metrics as JSON.
pub fn export_json<W: Write>(export: &MetricsExport, writer: &mut W) -> std::io::Result<()> {
    serde_json::to_writer_pretty(&mut *writer, export)?;
    writeln!(writer)?;
    Ok(())
}

/// Export metrics in Prometheus text exposition format.
pub fn export_prometheus<W: Write>(export: &MetricsExport, writer: &mut W) -> std::io::Result<()> {
    for (name, value) in &export.totals.counters {
        let prom_name = name.replace('.', "_");
        writeln!(writer, "# TYPE {} counter", prom_name)?;
        writeln!(writer, "{}{{label=\"{}\"}} {}", prom_name, export.label, value)?;
    }
    for (node, group) in &export.nodes {
        for (name, value) in &group.counters {
            let prom_name = name.replace('.', "_");
            writeln!(
                writer,
                "{}{{label=\"{}\",node=\"{}\"}} {}",
                prom_name, export.label, node, value
            )?;
        }
    }

    for (name, value) in &export.totals.gauges {
        let prom_name = name.replace('.', "_");
        writeln!(writer, "# TYPE {} gauge", prom_name)?;
        writeln!(writer, "{}{{label=\"{}\"}} {}", prom_name, export.label, value)?;
    }

    for (name, summary) in &export.totals.histograms {
        let prom_name = name.replace('.', "_");
        writeln!(writer, "# TYPE {} summary", prom_name)?;
        writeln!(writer, "{}_count{{label=\"{}\"}} {}", prom_name, export.label, summary.count)?;
        writeln!(writer, "{}_sum{{label=\"{}\"}} {}", prom_name, export.label, summary.sum)?;
        for (q, v) in [("0.5", summary.p50), ("0.9", summary.p90), ("0.99", summary.p99)] {
            writeln!(
                writer,
                "{}{{label=\"{}\",quantile=\"{}\"}} {}",
                prom_name, export.label, q, v
            )?;
        }
    }
    for (protocol, group) in &export.protocols {
        for (name, summary) in &group.histograms {
            let prom_name = name.replace('.', "_");
            writeln!(
                writer,
                "{}_count{{label=\"{}\",phy=\"{}\"}} {}",
                prom_name, export.label, protocol, summary.count
            )?;
            writeln!(
                writer,
                "{}_sum{{label=\"{}\",phy=\"{}\"}} {}",
                prom_name, export.label, protocol, summary.sum
            )?;
        }
    }

    Ok(())
}

// ============================================================================
// In-Memory Recorder
// ============================================================================

#[derive(Debug, Default)]
struct CounterState {
    value: AtomicU64,
}

impl CounterState {
    fn increment(&self, value: u64) {
        self.value.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge value stored as f64 bits.
#[derive(Debug, Default)]
struct GaugeState {
    value: AtomicU64,
}

impl GaugeState {
    fn set(&self, value: f64) {
        self.value.store(value.to_bits(), Ordering::Relaxed);
    }

    fn increment(&self, value: f64) {
        let mut current = self.value.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self
                .value
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }
}

/// Histogram samples. Runs are finite, so every sample is kept.
#[derive(Debug, Default)]
struct HistogramState {
    samples: RwLock<Vec<f64>>,
}

impl HistogramState {
    fn record(&self, value: f64) {
        self.samples.write().push(value);
    }

    fn samples(&self) -> Vec<f64> {
        self.samples.read().clone()
    }

    fn summary(&self) -> HistogramSummary {
        compute_histogram_summary(&self.samples.read())
    }
}

/// Labels of a registered key.
#[derive(Debug, Clone)]
struct KeyMetadata {
    name: String,
    node: Option<String>,
    phy: Option<String>,
}

fn key_to_string(key: &Key) -> String {
    let labels: Vec<String> = key
        .labels()
        .map(|l| format!("{}={}", l.key(), l.value()))
        .collect();
    if labels.is_empty() {
        key.name().to_string()
    } else {
        format!("{}|{}", key.name(), labels.join(","))
    }
}

fn key_metadata(key: &Key) -> KeyMetadata {
    let label = |name: &str| {
        key.labels()
            .find(|l| l.key() == name)
            .map(|l| l.value().to_string())
    };
    KeyMetadata {
        name: key.name().to_string(),
        node: label("node"),
        phy: label("phy"),
    }
}

#[derive(Debug, Default)]
struct RecorderState {
    counters: RwLock<BTreeMap<String, Arc<CounterState>>>,
    gauges: RwLock<BTreeMap<String, Arc<GaugeState>>>,
    histograms: RwLock<BTreeMap<String, Arc<HistogramState>>>,
    key_metadata: RwLock<BTreeMap<String, KeyMetadata>>,
}

impl RecorderState {
    fn get_or_create<T: Default>(
        &self,
        map: &RwLock<BTreeMap<String, Arc<T>>>,
        key: &Key,
    ) -> Arc<T> {
        let key_str = key_to_string(key);
        if let Some(state) = map.read().get(&key_str) {
            return state.clone();
        }
        self.key_metadata
            .write()
            .entry(key_str.clone())
            .or_insert_with(|| key_metadata(key));
        map.write()
            .entry(key_str)
            .or_insert_with(|| Arc::new(T::default()))
            .clone()
    }

    fn clear(&self) {
        self.counters.write().clear();
        self.gauges.write().clear();
        self.histograms.write().clear();
        self.key_metadata.write().clear();
    }

    fn export(&self, label: &str, sim_time_s: f64) -> MetricsExport {
        let metadata = self.key_metadata.read();
        let mut totals = MetricGroup::default();
        let mut nodes: BTreeMap<String, MetricGroup> = BTreeMap::new();
        let mut protocols: BTreeMap<String, MetricGroup> = BTreeMap::new();

        for (key_str, counter) in self.counters.read().iter() {
            let Some(meta) = metadata.get(key_str) else {
                continue;
            };
            let value = counter.get();
            *totals.counters.entry(meta.name.clone()).or_insert(0) += value;
            if let Some(node) = &meta.node {
                let group = nodes.entry(node.clone()).or_default();
                *group.counters.entry(meta.name.clone()).or_insert(0) += value;
            }
            if let Some(phy) = &meta.phy {
                let group = protocols.entry(phy.clone()).or_default();
                *group.counters.entry(meta.name.clone()).or_insert(0) += value;
            }
        }

        for (key_str, gauge) in self.gauges.read().iter() {
            let Some(meta) = metadata.get(key_str) else {
                continue;
            };
            let value = gauge.get();
            *totals.gauges.entry(meta.name.clone()).or_insert(0.0) += value;
            if let Some(node) = &meta.node {
                nodes
                    .entry(node.clone())
                    .or_default()
                    .gauges
                    .insert(meta.name.clone(), value);
            }
        }

        let mut all_samples: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut protocol_samples: BTreeMap<(String, String), Vec<f64>> = BTreeMap::new();
        for (key_str, histogram) in self.histograms.read().iter() {
            let Some(meta) = metadata.get(key_str) else {
                continue;
            };
            let samples = histogram.samples();
            if let Some(node) = &meta.node {
                nodes
                    .entry(node.clone())
                    .or_default()
                    .histograms
                    .insert(meta.name.clone(), histogram.summary());
            }
            if let Some(phy) = &meta.phy {
                protocol_samples
                    .entry((phy.clone(), meta.name.clone()))
                    .or_default()
                    .extend(samples.iter().copied());
            }
            all_samples
                .entry(meta.name.clone())
                .or_default()
                .extend(samples);
        }
        totals.histograms = all_samples
            .into_iter()
            .map(|(name, samples)| (name, compute_histogram_summary(&samples)))
            .collect();
        for ((phy, name), samples) in protocol_samples {
            protocols
                .entry(phy)
                .or_default()
                .histograms
                .insert(name, compute_histogram_summary(&samples));
        }

        MetricsExport {
            label: label.to_string(),
            sim_time_s,
            totals,
            nodes,
            protocols,
        }
    }
}

/// Compute histogram summary from a slice of samples.
fn compute_histogram_summary(samples: &[f64]) -> HistogramSummary {
    if samples.is_empty() {
        return HistogramSummary {
            count: 0,
            sum: 0.0,
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            p50: 0.0,
            p90: 0.0,
            p99: 0.0,
        };
    }

    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let count = sorted.len() as u64;
    let sum: f64 = sorted.iter().sum();
    let percentile = |p: f64| -> f64 {
        let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    };

    HistogramSummary {
        count,
        sum,
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        mean: sum / count as f64,
        p50: percentile(50.0),
        p90: percentile(90.0),
        p99: percentile(99.0),
    }
}

/// In-memory metrics recorder that collects metrics for later export.
///
/// Clones share the same storage, so one clone can be installed as the
/// global recorder while another is kept for exporting.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecorder {
    state: Arc<RecorderState>,
}

impl InMemoryRecorder {
    /// Create a new in-memory recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Export all current metric values.
    pub fn export(&self, label: &str, sim_time_s: f64) -> MetricsExport {
        self.state.export(label, sim_time_s)
    }

    /// Drop every recorded metric.
    pub fn clear(&self) {
        self.state.clear();
    }
}

struct InMemoryCounter {
    state: Arc<CounterState>,
}

impl metrics::CounterFn for InMemoryCounter {
    fn increment(&self, value: u64) {
        self.state.increment(value);
    }

    fn absolute(&self, value: u64) {
        self.state.value.store(value, Ordering::Relaxed);
    }
}

struct InMemoryGauge {
    state: Arc<GaugeState>,
}

impl metrics::GaugeFn for InMemoryGauge {
    fn increment(&self, value: f64) {
        self.state.increment(value);
    }

    fn decrement(&self, value: f64) {
        self.state.increment(-value);
    }

    fn set(&self, value: f64) {
        self.state.set(value);
    }
}

struct InMemoryHistogram {
    state: Arc<HistogramState>,
}

impl metrics::HistogramFn for InMemoryHistogram {
    fn record(&self, value: f64) {
        self.state.record(value);
    }
}

impl Recorder for InMemoryRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        let state = self.state.get_or_create(&self.state.counters, key);
        Counter::from_arc(Arc::new(InMemoryCounter { state }))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        let state = self.state.get_or_create(&self.state.gauges, key);
        Gauge::from_arc(Arc::new(InMemoryGauge { state }))
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        let state = self.state.get_or_create(&self.state.histograms, key);
        Histogram::from_arc(Arc::new(InMemoryHistogram { state }))
    }
}
