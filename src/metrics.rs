//! Metrics collection and reporting for vault jobs.
//!
//! A [`MetricsCollector`] holds named [`Metric`]s plus the job's start and end time.
//! [`Job::run`](crate::Job::run) fills one with the counters below and, when
//! [`JobConfig::write_metrics`](crate::JobConfig::write_metrics) is set, saves it as
//! `metrics.json` next to the manifest.
//!
//! # Example
//!
//! ```no_run
//! use hashvault::metrics::{Metric, MetricsCollector};
//! use serde_json::Value;
//!
//! struct Collisions(u64);
//!
//! impl Metric for Collisions {
//!     fn name(&self) -> &str {
//!         "digest_collisions"
//!     }
//!
//!     fn value(&self) -> Value {
//!         serde_json::json!(self.0)
//!     }
//!
//!     fn as_any(&self) -> &dyn std::any::Any {
//!         self
//!     }
//! }
//!
//! # fn main() -> anyhow::Result<()> {
//! let metrics = MetricsCollector::new();
//! metrics.register(Box::new(Collisions(3)));
//! metrics.increment_counter("records_generated", 1 << 20);
//! metrics.save_to_file("metrics.json")?;
//! # Ok(())
//! # }
//! ```

use crate::coordinator::JobReport;
use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::any::Any;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const METRICS_FILE: &str = "metrics.json";

pub const RECORDS_GENERATED: &str = "records_generated";
pub const UNITS_COMPLETED: &str = "units_completed";
pub const UNIT_RETRIES: &str = "unit_retries";
pub const SORT_RETRIES: &str = "sort_retries";
pub const STAGE_SPILLS: &str = "stage_spills";
pub const SORT_RUNS: &str = "sort_runs";
pub const MERGE_PASSES: &str = "merge_passes";
pub const PARTITIONS_COMMITTED: &str = "partitions_committed";
pub const IMBALANCED_PARTITIONS: &str = "imbalanced_partitions";
pub const PARTITION_RECORDS: &str = "partition_records";
pub const RECORDS_PER_SECOND: &str = "records_per_second";

/// Trait for custom metrics.
pub trait Metric: Send + Sync + Any {
    /// The name of this metric (e.g., `records_generated`).
    fn name(&self) -> &str;

    /// The current value of this metric as a JSON value.
    fn value(&self) -> Value;

    fn description(&self) -> Option<&str> {
        None
    }

    /// Cast to Any for downcasting.
    fn as_any(&self) -> &dyn Any;
}

/// Thread-safe container of job metrics. Clones share the same storage.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsCollectorInner>>,
}

struct MetricsCollectorInner {
    metrics: HashMap<String, Box<dyn Metric>>,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsCollectorInner {
                metrics: HashMap::new(),
                start_time: None,
                end_time: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsCollectorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a metric, replacing any metric of the same name.
    pub fn register(&self, metric: Box<dyn Metric>) {
        self.lock().metrics.insert(metric.name().to_string(), metric);
    }

    pub fn register_all(&self, metrics: Vec<Box<dyn Metric>>) {
        for metric in metrics {
            self.register(metric);
        }
    }

    pub fn record_start(&self) {
        self.lock().start_time = Some(Instant::now());
    }

    pub fn record_end(&self) {
        self.lock().end_time = Some(Instant::now());
    }

    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        let inner = self.lock();
        match (inner.start_time, inner.end_time) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }

    /// Increment a counter by name, creating it at zero if needed.
    ///
    /// A non-counter metric of the same name is replaced.
    pub fn increment_counter(&self, name: &str, value: u64) {
        let mut inner = self.lock();
        let current = inner
            .metrics
            .get(name)
            .and_then(|m| m.as_any().downcast_ref::<CounterMetric>())
            .map_or(0, |c| c.count);
        inner.metrics.insert(
            name.to_string(),
            Box::new(CounterMetric::with_value(name, current.saturating_add(value))),
        );
    }

    pub fn set_counter(&self, name: &str, value: u64) {
        self.register(Box::new(CounterMetric::with_value(name, value)));
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        self.register(Box::new(GaugeMetric::new(name, value)));
    }

    /// All metrics as a JSON object, plus `execution_time_ms` once start and end are known.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let inner = self.lock();
        let mut metrics_json = serde_json::Map::new();

        for (name, metric) in &inner.metrics {
            let mut metric_obj = serde_json::Map::new();
            metric_obj.insert("value".to_string(), metric.value());
            if let Some(desc) = metric.description() {
                metric_obj.insert("description".to_string(), json!(desc));
            }
            metrics_json.insert(name.clone(), Value::Object(metric_obj));
        }

        if let (Some(start), Some(end)) = (inner.start_time, inner.end_time) {
            let elapsed_ms = end.duration_since(start).as_millis();
            metrics_json.insert(
                "execution_time_ms".to_string(),
                json!({
                    "value": elapsed_ms,
                    "description": "Wall time of the job in milliseconds"
                }),
            );
        }
        drop(inner);
        Value::Object(metrics_json)
    }

    /// Save all metrics to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written to.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let formatted = serde_json::to_string_pretty(&self.to_json())?;
        let mut file = File::create(path)
            .with_context(|| format!("creating metrics file {}", path.display()))?;
        file.write_all(formatted.as_bytes())
            .with_context(|| format!("writing metrics file {}", path.display()))?;
        Ok(())
    }

    /// Snapshot of metric names and values.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.lock()
            .metrics
            .iter()
            .map(|(name, metric)| (name.clone(), metric.value()))
            .collect()
    }

    /// Fill in the standard job metrics from a finished run.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_job(&self, report: &JobReport) {
        self.set_counter(RECORDS_GENERATED, report.records_generated);
        self.set_counter(UNITS_COMPLETED, report.units_completed);
        self.set_counter(UNIT_RETRIES, report.unit_retries);
        self.set_counter(SORT_RETRIES, report.sort_retries);
        self.set_counter(STAGE_SPILLS, report.stage_spills);
        self.set_counter(SORT_RUNS, report.sort_runs);
        self.set_counter(MERGE_PASSES, report.merge_passes);
        self.set_counter(PARTITIONS_COMMITTED, report.manifest.partitions.len() as u64);
        self.set_counter(IMBALANCED_PARTITIONS, report.imbalances.len() as u64);
        self.register(Box::new(
            HistogramMetric::with_values(
                PARTITION_RECORDS,
                report
                    .manifest
                    .partitions
                    .iter()
                    .map(|e| e.record_count as f64)
                    .collect(),
            )
            .with_description("Records per partition"),
        ));
        let secs = report.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.register(Box::new(
                GaugeMetric::new(RECORDS_PER_SECOND, report.records_generated as f64 / secs)
                    .with_description("Generated records per second of wall time"),
            ));
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// A simple counter metric.
pub struct CounterMetric {
    name: String,
    count: u64,
}

impl CounterMetric {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_value(name, 0)
    }

    pub fn with_value(name: impl Into<String>, count: u64) -> Self {
        Self {
            name: name.into(),
            count,
        }
    }

    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }
}

impl Metric for CounterMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        json!(self.count)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A gauge metric that holds a single numeric value.
pub struct GaugeMetric {
    name: String,
    value: f64,
    description: Option<String>,
}

impl GaugeMetric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            description: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl Metric for GaugeMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        json!(self.value)
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Distribution of a set of values, reported as summary statistics.
pub struct HistogramMetric {
    name: String,
    values: Vec<f64>,
    description: Option<String>,
}

impl HistogramMetric {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_values(name, Vec::new())
    }

    pub fn with_values(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            values,
            description: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn record(&mut self, value: f64) {
        self.values.push(value);
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> HistogramStats {
        if self.values.is_empty() {
            return HistogramStats::default();
        }

        let mut sorted = self.values.clone();
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        let mean = sum / count as f64;
        let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;

        HistogramStats {
            count,
            sum,
            mean,
            stddev: variance.sqrt(),
            min: sorted[0],
            max: sorted[count - 1],
            p50: sorted[count / 2],
            p99: sorted[(count * 99) / 100],
        }
    }
}

impl Metric for HistogramMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        let stats = self.stats();
        json!({
            "count": stats.count,
            "sum": stats.sum,
            "mean": stats.mean,
            "stddev": stats.stddev,
            "min": stats.min,
            "max": stats.max,
            "p50": stats.p50,
            "p99": stats.p99,
        })
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Statistics computed from a histogram.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistogramStats {
    pub count: usize,
    pub sum: f64,
    pub mean: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p99: f64,
}
