//! Job metrics: the collector itself and the `metrics.json` a job writes.

#![cfg(feature = "metrics")]

use anyhow::Result;
use hashvault::Job;
use hashvault::metrics::{
    CounterMetric, GaugeMetric, HistogramMetric, METRICS_FILE, MERGE_PASSES, Metric,
    MetricsCollector, PARTITION_RECORDS, PARTITIONS_COMMITTED, RECORDS_GENERATED, UNIT_RETRIES,
};
use hashvault::testing::{CrashOnceHash, test_config};
use serde_json::{Value, json};
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

#[macro_use]
mod macros;

#[test]
fn counters_accumulate_and_can_be_reset() {
    let collector = MetricsCollector::new();
    collector.increment_counter(RECORDS_GENERATED, 256);
    collector.increment_counter(RECORDS_GENERATED, 512);
    assert_eq!(collector.snapshot()[RECORDS_GENERATED], json!(768));

    collector.set_counter(RECORDS_GENERATED, 5);
    assert_eq!(collector.snapshot()[RECORDS_GENERATED], json!(5));
}

#[test]
fn incrementing_replaces_a_gauge_of_the_same_name() {
    let collector = MetricsCollector::new();
    collector.set_gauge("throughput", 1.5);
    collector.increment_counter("throughput", 2);
    assert_eq!(collector.snapshot()["throughput"], json!(2));
}

#[test]
fn clones_share_storage() {
    let collector = MetricsCollector::new();
    let clone = collector.clone();
    clone.register(Box::new(CounterMetric::with_value(UNIT_RETRIES, 3)));
    assert_eq!(collector.snapshot()[UNIT_RETRIES], json!(3));
}

#[test]
fn execution_time_appears_once_both_ends_are_known() {
    let collector = MetricsCollector::new();
    collector.register_all(vec![
        Box::new(CounterMetric::new("a")) as Box<dyn Metric>,
        Box::new(GaugeMetric::new("b", 0.25).with_description("a gauge")),
    ]);
    assert!(collector.to_json().get("execution_time_ms").is_none());

    collector.record_start();
    thread::sleep(Duration::from_millis(20));
    collector.record_end();
    let json = collector.to_json();
    assert!(json["execution_time_ms"]["value"].as_u64().unwrap() >= 20);
    assert_eq!(json["b"]["description"], json!("a gauge"));
    assert!(collector.elapsed().unwrap() >= Duration::from_millis(20));
}

#[test]
fn histogram_summarises_partition_sizes() {
    let mut hist = HistogramMetric::with_values(PARTITION_RECORDS, vec![90.0, 110.0, 100.0]);
    hist.record(100.0);
    let stats = hist.stats();
    assert_eq!(stats.count, 4);
    assert_close!(stats.mean, 100.0);
    assert_close!(stats.min, 90.0);
    assert_close!(stats.max, 110.0);
    assert_close!(stats.stddev, 50.0_f64.sqrt());
    assert_eq!(hist.value()["count"], json!(4));

    let empty = HistogramMetric::new("empty").stats();
    assert_eq!(empty.count, 0);
    assert_close!(empty.sum, 0.0);
}

#[test]
fn job_writes_metrics_next_to_the_manifest() -> Result<()> {
    let dir = tempdir()?;
    let config = test_config(2048, 4, dir.path()).with_metrics(true);
    let report = Job::new(config)
        .with_hash(Arc::new(CrashOnceHash::after(500)))
        .run()?;

    let metrics: Value = serde_json::from_slice(&fs::read(dir.path().join(METRICS_FILE))?)?;
    assert_eq!(metrics[RECORDS_GENERATED]["value"], json!(2048));
    assert_eq!(metrics[PARTITIONS_COMMITTED]["value"], json!(4));
    assert_eq!(metrics[UNIT_RETRIES]["value"], json!(report.unit_retries));
    assert_eq!(metrics[MERGE_PASSES]["value"], json!(0));
    assert_eq!(metrics[PARTITION_RECORDS]["value"]["count"], json!(4));
    assert_close!(
        metrics[PARTITION_RECORDS]["value"]["sum"].as_f64().unwrap(),
        2048.0
    );
    assert!(metrics["execution_time_ms"]["value"].is_number());
    Ok(())
}

#[test]
fn metrics_file_is_optional() -> Result<()> {
    let dir = tempdir()?;
    Job::new(test_config(256, 2, dir.path()).with_metrics(false)).run()?;
    assert!(!dir.path().join(METRICS_FILE).exists());
    Ok(())
}

#[test]
fn save_to_file_writes_pretty_json() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("custom.json");
    let collector = MetricsCollector::default();
    collector.set_counter("saved", 123);
    collector.save_to_file(&path)?;
    let parsed: Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
    assert_eq!(parsed["saved"]["value"], json!(123));
    Ok(())
}
