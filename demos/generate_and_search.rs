//! Build a small vault, check it, list its first records and look one up.
//!
//! Demonstrates:
//! - Running a job from a log2 record count
//! - Reading the job report and imbalance warnings
//! - Verifying a finished vault
//! - Listing records and searching by digest prefix
//!
//! Run with: cargo run --example generate_and_search [output-dir] [k] [partitions]

use anyhow::{Context, Result};
use hashvault::{Dataset, Job, JobConfig, format_record};
use std::env;
use std::path::PathBuf;

fn main() -> Result<()> {
    let mut args = env::args().skip(1);
    let scratch = tempfile::tempdir()?;
    let dir = args
        .next()
        .map_or_else(|| scratch.path().join("vault"), PathBuf::from);
    let k: u32 = args.next().map_or(Ok(16), |s| s.parse()).context("k must be a number")?;
    let partitions: u32 = args
        .next()
        .map_or(Ok(4), |s| s.parse())
        .context("partitions must be a number")?;

    println!("Generating 2^{k} records into {partitions} partitions at {}", dir.display());
    let report = Job::new(JobConfig::from_exponent(k, partitions, &dir)).run()?;
    println!(
        "  {} records, {} unit retries, {} sort runs, {:?}",
        report.records_generated, report.unit_retries, report.sort_runs, report.elapsed
    );
    for imbalance in &report.imbalances {
        println!(
            "  partition {} holds {} records ({:.1} sigma from {:.0})",
            imbalance.partition, imbalance.records, imbalance.deviation_sigmas, imbalance.expected
        );
    }

    let dataset = Dataset::open(&dir)?;
    let verified = dataset.verify()?;
    println!(
        "\nVerified {} records: {}",
        verified.records(),
        if verified.is_ok() { "ok" } else { "FAILED" }
    );

    println!("\nFirst records:");
    let head = dataset.head(5)?;
    for record in &head {
        println!("  {}", format_record(dataset.layout(), record));
    }

    // Look up a record by the first half of its digest.
    let digest_len = dataset.layout().digest_len;
    if let Some(record) = dataset.read_partition(dataset.num_partitions() - 1)?.get(0) {
        let prefix = &record[..digest_len.div_ceil(2)];
        let found = dataset.search(prefix)?;
        println!(
            "\nPrefix {}: {} match(es) in partitions {:?} after {} comparisons and {} seeks",
            hex::encode(prefix),
            found.matches.len(),
            found.partitions,
            found.comparisons,
            found.seeks
        );
        if let Some(first) = found.first() {
            println!("  {}", format_record(dataset.layout(), first));
        }
    }
    Ok(())
}
