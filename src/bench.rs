//! `relaybench run`: optional warm-up pass, measured run, report.
//!
//! Prints the latency percentile table and the producer throughput line, and
//! optionally writes the same numbers as JSON.

use anyhow::Result;
use relay_core::{Deadline, RunConfig, RunReport, Yielding};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::color::{paint, row, Style};
use crate::config::BenchConfig;

#[derive(Debug, Serialize)]
pub struct BenchReport {
    pub generated_at: String,
    pub stages: usize,
    pub throughput_target: Option<u64>,
    pub records_written: u64,
    pub records_collected: u64,
    pub producer_elapsed_secs: f64,
    pub producer_rate_per_sec: f64,
    pub percentiles: Vec<PercentileEntry>,
    pub worst_us: f64,
    pub mean_us: f64,
    /// Mean time each stage added after its predecessor, stage 1 first.
    pub stage_hop_mean_us: Vec<f64>,
    pub gates: BTreeMap<String, i64>,
    pub clock_anomalies: u64,
    pub incomplete_records: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pretouched_pages: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct PercentileEntry {
    pub percentile: f64,
    pub latency_us: f64,
}

pub fn run(config: &BenchConfig, report_path: Option<PathBuf>) -> Result<()> {
    let run_config = config.run_config()?;
    let stall = config.stall_timeout();

    eprintln!(
        "relaybench: {} stage(s), {} records, {}",
        run_config.stages,
        run_config.count,
        match run_config.throughput {
            Some(t) => format!("{} records/s", t),
            None => "unpaced".to_string(),
        }
    );

    if config.warmup && config.warmup_count > 0 {
        eprintln!("  warm-up: {} records...", config.warmup_count);
        let warm = execute(config.warmup_config()?, stall)?;
        tracing::debug!(
            records = warm.latency.records,
            p50_ns = warm.latency.histogram.value_at_percentile(50.0),
            "warm-up done"
        );
    }

    let report = execute(run_config.clone(), stall)?;
    let bench = bench_report(&run_config, &report);

    print_summary(&report, &bench);

    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&bench)?;
        std::fs::write(&path, &json)?;
        eprintln!("Report written to {}", path.display());
    }

    Ok(())
}

fn execute(config: RunConfig, stall: Option<Duration>) -> Result<RunReport> {
    match stall {
        Some(timeout) => relay_core::run(config, Deadline::new(timeout)),
        None => relay_core::run(config, Yielding::default()),
    }
}

fn ns_to_us(ns: f64) -> f64 {
    ns / 1_000.0
}

fn bench_report(config: &RunConfig, report: &RunReport) -> BenchReport {
    let latency = &report.latency;
    BenchReport {
        generated_at: chrono::Utc::now().to_rfc3339(),
        stages: report.stages,
        throughput_target: config.throughput,
        records_written: report.producer.written,
        records_collected: latency.records,
        producer_elapsed_secs: report.producer.elapsed.as_secs_f64(),
        producer_rate_per_sec: report.producer.rate_per_sec(),
        percentiles: latency
            .percentiles()
            .into_iter()
            .map(|(percentile, ns)| PercentileEntry { percentile, latency_us: ns_to_us(ns as f64) })
            .collect(),
        worst_us: ns_to_us(latency.worst_ns() as f64),
        mean_us: ns_to_us(latency.mean_ns()),
        stage_hop_mean_us: latency.mean_hop_ns().into_iter().map(ns_to_us).collect(),
        gates: report.gates.iter().cloned().collect(),
        clock_anomalies: latency.clock_anomalies,
        incomplete_records: latency.incomplete,
        pretouched_pages: report.pretouched_pages,
    }
}

fn print_summary(report: &RunReport, bench: &BenchReport) {
    println!("{}", report.throughput_line());
    println!();
    println!(
        "{}",
        paint(
            Style::Heading,
            &format!(
                "End-to-end latency (µs), {} stages, {} records",
                bench.stages, bench.records_collected
            )
        )
    );
    for p in &bench.percentiles {
        println!("{}", row(None, &format!("{}%", p.percentile), p.latency_us));
    }
    println!("{}", row(None, "worst", bench.worst_us));
    println!("{}", row(Some(Style::Muted), "mean", bench.mean_us));
    println!();

    println!("{}", paint(Style::Heading, "Per-stage mean hop (µs)"));
    for (i, hop) in bench.stage_hop_mean_us.iter().enumerate() {
        println!("{}", row(None, &format!("stage {}", i + 1), *hop));
    }

    if bench.clock_anomalies > 0 || bench.incomplete_records > 0 {
        println!();
        println!(
            "{}",
            paint(
                Style::Warning,
                &format!(
                    "warning: {} clock anomalies, {} incomplete records",
                    bench.clock_anomalies, bench.incomplete_records
                )
            )
        );
    }
}
