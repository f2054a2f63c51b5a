//! End-to-end latency collection.
//!
//! Runs after every stage has joined, so each record in the log is already
//! complete and "none yet" from the tailer simply means end of log.

use anyhow::{Context, Result};
use hdrhistogram::Histogram;

use crate::context::RunContext;

/// Percentiles printed in every report.
pub const PERCENTILES: [f64; 7] = [50.0, 90.0, 99.0, 99.9, 99.99, 99.999, 99.9999];

/// Highest latency the histogram tracks exactly (60s); larger samples saturate.
const MAX_TRACKABLE_NS: u64 = 60_000_000_000;

/// Latency distribution for one run.
#[derive(Debug, Clone)]
pub struct LatencyReport {
    pub stages: usize,
    /// Records read from the log.
    pub records: u64,
    /// `remaining` of the last record read (0 for a complete run).
    pub last_remaining: Option<i64>,
    /// Records with at least one unwritten timestamp.
    pub incomplete: u64,
    /// Records whose final timestamp was earlier than their production time.
    pub clock_anomalies: u64,
    /// End-to-end latency in nanoseconds.
    pub histogram: Histogram<u64>,
    /// Sum of `timestamps[s] - timestamps[s-1]` per stage, indexed by s - 1.
    hop_sum_ns: Vec<u128>,
}

impl LatencyReport {
    fn new(stages: usize) -> Result<Self> {
        let histogram = Histogram::<u64>::new_with_bounds(1, MAX_TRACKABLE_NS, 3)
            .context("failed to create latency histogram")?;
        Ok(Self {
            stages,
            records: 0,
            last_remaining: None,
            incomplete: 0,
            clock_anomalies: 0,
            histogram,
            hop_sum_ns: vec![0; stages],
        })
    }

    /// `(percentile, latency_ns)` for each of [`PERCENTILES`].
    pub fn percentiles(&self) -> Vec<(f64, u64)> {
        PERCENTILES
            .iter()
            .map(|&p| (p, self.histogram.value_at_percentile(p)))
            .collect()
    }

    pub fn worst_ns(&self) -> u64 {
        self.histogram.max()
    }

    pub fn mean_ns(&self) -> f64 {
        self.histogram.mean()
    }

    /// Mean time each stage added on top of its predecessor, indexed by s - 1.
    pub fn mean_hop_ns(&self) -> Vec<f64> {
        self.hop_sum_ns
            .iter()
            .map(|&sum| if self.records > 0 { sum as f64 / self.records as f64 } else { 0.0 })
            .collect()
    }
}

/// Read every record from the start of the log and build the latency report.
pub fn collect(ctx: &RunContext) -> Result<LatencyReport> {
    let stages = ctx.layout().stages();
    let mut report = LatencyReport::new(stages)?;
    let mut tailer = ctx.log().tail();

    while let Some(entry) = tailer.next() {
        let record = entry.record();
        report.records += 1;
        report.last_remaining = Some(record.remaining());

        if !record.is_complete() {
            report.incomplete += 1;
        }
        let latency = record.latency_ns();
        if latency < 0 {
            report.clock_anomalies += 1;
        }
        report.histogram.saturating_record(latency.max(0) as u64);
        for slot in 1..=stages {
            report.hop_sum_ns[slot - 1] += record.hop_ns(slot).max(0) as u128;
        }

        if record.is_last() {
            break;
        }
    }

    if report.incomplete > 0 {
        tracing::warn!(incomplete = report.incomplete, "records missing stage timestamps");
    }
    tracing::debug!(records = report.records, "latency collected");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use tempfile::TempDir;

    #[test]
    fn test_collect_synthetic_records() {
        let out = TempDir::new().unwrap();
        let ctx = RunContext::create(RunConfig::new(2, 4, out.path())).unwrap();
        {
            let mut appender = ctx.log().appender().unwrap();
            // [remaining, ts0, ts1, ts2]
            appender.append(&[3, 1_000, 2_000, 4_000]).unwrap();
            appender.append(&[2, 1_000, 1_500, 2_000]).unwrap();
            appender.append(&[1, 5_000, 6_000, 8_000]).unwrap();
            appender.append(&[0, 9_000, 9_500, 10_000]).unwrap();
        }
        let report = collect(&ctx).unwrap();
        assert_eq!(report.records, 4);
        assert_eq!(report.last_remaining, Some(0));
        assert_eq!(report.incomplete, 0);
        assert_eq!(report.clock_anomalies, 0);
        assert_eq!(report.histogram.len(), 4);
        // latencies: 3000, 1000, 3000, 1000
        assert!((report.mean_ns() - 2_000.0).abs() < 10.0);
        assert!((2_995..=3_005).contains(&report.worst_ns()));
        let hops = report.mean_hop_ns();
        // stage 1 hops: 1000, 500, 1000, 500; stage 2: 2000, 500, 2000, 500
        assert!((hops[0] - 750.0).abs() < 0.01);
        assert!((hops[1] - 1_250.0).abs() < 0.01);
    }

    #[test]
    fn test_collect_stops_at_last_record() {
        let out = TempDir::new().unwrap();
        let ctx = RunContext::create(RunConfig::new(1, 3, out.path())).unwrap();
        {
            let mut appender = ctx.log().appender().unwrap();
            appender.append(&[0, 10, 20]).unwrap();
            appender.append(&[5, 10, 20]).unwrap();
        }
        let report = collect(&ctx).unwrap();
        assert_eq!(report.records, 1);
    }

    #[test]
    fn test_collect_flags_incomplete_and_negative() {
        let out = TempDir::new().unwrap();
        let ctx = RunContext::create(RunConfig::new(1, 2, out.path())).unwrap();
        {
            let mut appender = ctx.log().appender().unwrap();
            appender.append(&[1, 100]).unwrap();
            appender.append(&[0, 100, 50]).unwrap();
        }
        let report = collect(&ctx).unwrap();
        assert_eq!(report.incomplete, 1);
        assert_eq!(report.clock_anomalies, 2);
    }

    #[test]
    fn test_percentiles_shape() {
        let out = TempDir::new().unwrap();
        let ctx = RunContext::create(RunConfig::new(1, 1, out.path())).unwrap();
        ctx.log().appender().unwrap().append(&[0, 1_000, 251_000]).unwrap();
        let report = collect(&ctx).unwrap();
        let p = report.percentiles();
        assert_eq!(p.len(), PERCENTILES.len());
        for (_, ns) in p {
            assert!((249_000..=251_000).contains(&ns));
        }
    }

    #[test]
    fn test_empty_log() {
        let out = TempDir::new().unwrap();
        let ctx = RunContext::create(RunConfig::new(1, 1, out.path())).unwrap();
        let report = collect(&ctx).unwrap();
        assert_eq!(report.records, 0);
        assert_eq!(report.last_remaining, None);
        assert_eq!(report.mean_hop_ns(), vec![0.0]);
    }
}
