//! End-to-end tests for the staged relay pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use relay_core::{
    producer, stage, stage_gate_id, Deadline, PauseStrategy, RunConfig, RunContext, Yielding,
    NOTHING_COMPLETED,
};
use tempfile::TempDir;

fn guard() -> Deadline {
    Deadline::new(Duration::from_secs(10))
}

/// Drive every stage and the producer by hand so the log can be inspected
/// before the run directory goes away.
fn run_by_hand(config: RunConfig) -> Arc<RunContext> {
    let ctx = Arc::new(RunContext::create(config).unwrap());
    let stages = ctx.config().stages;
    let workers: Vec<_> = (1..=stages)
        .map(|s| {
            let ctx = ctx.clone();
            thread::spawn(move || stage::run(&ctx, s, guard()).unwrap())
        })
        .collect();
    producer::run(&ctx, guard()).unwrap();
    for w in workers {
        w.join().unwrap();
    }
    ctx
}

/// Every record's timestamps as `[ts0, ts1, .., tsN]`, plus its `remaining`.
fn records(ctx: &RunContext) -> Vec<(i64, Vec<u64>)> {
    let stages = ctx.config().stages;
    let mut tailer = ctx.log().tail();
    let mut out = Vec::new();
    while let Some(entry) = tailer.next() {
        let r = entry.record();
        out.push((r.remaining(), (0..=stages).map(|s| r.timestamp(s)).collect()));
    }
    out
}

#[test]
fn three_stages_ten_records_unpaced() {
    let out = TempDir::new().unwrap();
    let report = relay_core::run(RunConfig::new(3, 10, out.path()), guard()).unwrap();

    assert_eq!(report.producer.written, 10);
    assert_eq!(report.latency.records, 10);
    assert_eq!(report.latency.histogram.len(), 10);
    assert_eq!(report.latency.last_remaining, Some(0));
    assert_eq!(report.latency.incomplete, 0);
    assert_eq!(report.gate(&stage_gate_id(3)), Some(9));
    assert_eq!(report.gate(&stage_gate_id(1)), Some(9));
    assert_eq!(report.stage_stats.iter().map(|s| s.processed).collect::<Vec<_>>(), vec![10, 10, 10]);
    assert!(report.stage_stats.iter().all(|s| s.last_index == 9));
}

#[test]
fn every_record_counted_and_last_is_terminal() {
    let out = TempDir::new().unwrap();
    let ctx = run_by_hand(RunConfig::new(2, 1_000, out.path()));
    let recs = records(&ctx);
    assert_eq!(recs.len(), 1_000);
    for (i, (remaining, _)) in recs.iter().enumerate() {
        assert_eq!(*remaining, 999 - i as i64);
    }
    assert_eq!(recs[999].0, 0);
}

#[test]
fn stages_stamp_in_index_order() {
    let out = TempDir::new().unwrap();
    let ctx = run_by_hand(RunConfig::new(4, 2_000, out.path()));
    let recs = records(&ctx);
    for s in 0..=4 {
        for pair in recs.windows(2) {
            assert!(pair[0].1[s] <= pair[1].1[s], "slot {} went backwards", s);
        }
    }
}

#[test]
fn no_stage_stamps_before_its_predecessor() {
    let out = TempDir::new().unwrap();
    let ctx = run_by_hand(RunConfig::new(3, 2_000, out.path()).with_throughput(200_000));
    for (i, (_, ts)) in records(&ctx).iter().enumerate() {
        assert!(ts.iter().all(|&t| t != 0), "record {} incomplete: {:?}", i, ts);
        for s in 1..ts.len() {
            assert!(ts[s] >= ts[s - 1], "record {} stage {} stamped early: {:?}", i, s, ts);
        }
    }
}

#[test]
fn gate_values_never_decrease() {
    let out = TempDir::new().unwrap();
    let count = 5_000u64;
    let ctx = Arc::new(RunContext::create(RunConfig::new(3, count, out.path())).unwrap());
    let last_gate = ctx.gates().open(&stage_gate_id(3)).unwrap();
    assert_eq!(last_gate.read_acquire(), NOTHING_COMPLETED);

    let observer = {
        let gate = last_gate.clone();
        thread::spawn(move || {
            let mut prev = NOTHING_COMPLETED;
            let mut observations = 0u64;
            while prev < count as i64 - 1 {
                let v = gate.read_acquire();
                assert!(v >= prev, "gate went from {} to {}", prev, v);
                prev = v;
                observations += 1;
                thread::yield_now();
            }
            observations
        })
    };

    let workers: Vec<_> = (1..=3)
        .map(|s| {
            let ctx = ctx.clone();
            thread::spawn(move || stage::run(&ctx, s, guard()).unwrap())
        })
        .collect();
    producer::run(&ctx, guard()).unwrap();
    for w in workers {
        w.join().unwrap();
    }
    assert!(observer.join().unwrap() > 0);
    assert_eq!(last_gate.read_acquire(), count as i64 - 1);
}

#[test]
fn delayed_publish_holds_back_next_stage() {
    let out = TempDir::new().unwrap();
    let delay = Duration::from_micros(200);
    let ctx = run_by_hand(RunConfig::new(3, 50, out.path()).with_stage_delay(2, delay));
    for (i, (_, ts)) in records(&ctx).iter().enumerate() {
        let gap = ts[3] - ts[2];
        assert!(gap >= delay.as_nanos() as u64, "record {}: stage 3 only {}ns after stage 2", i, gap);
    }
}

#[test]
fn latency_is_non_negative_and_small() {
    let out = TempDir::new().unwrap();
    let report = relay_core::run(RunConfig::new(3, 1_000, out.path()).with_throughput(100_000), Yielding::default()).unwrap();
    assert_eq!(report.latency.clock_anomalies, 0);
    // Generous bound: microseconds expected, seconds would mean the gates are broken.
    assert!(report.latency.worst_ns() < 1_000_000_000);
    assert!(report.latency.percentiles().windows(2).all(|w| w[0].1 <= w[1].1));
    assert_eq!(report.latency.mean_hop_ns().len(), 3);
}

#[test]
fn zero_stages_rejected() {
    let out = TempDir::new().unwrap();
    let err = relay_core::run(RunConfig::new(0, 10, out.path()), guard()).unwrap_err();
    assert!(err.to_string().contains("stage count"));
}

#[test]
fn zero_throughput_rejected() {
    let out = TempDir::new().unwrap();
    let cfg = RunConfig::new(2, 10, out.path()).with_throughput(0);
    assert!(relay_core::run(cfg, guard()).is_err());
}

/// Fails the first time it is asked to wait on the thread named `victim`.
#[derive(Clone)]
struct FailOn {
    victim: &'static str,
    inner: Yielding,
}

impl PauseStrategy for FailOn {
    fn pause(&mut self) -> Result<()> {
        if thread::current().name() == Some(self.victim) {
            anyhow::bail!("injected failure");
        }
        self.inner.pause()
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

#[test]
fn failed_stage_aborts_the_run() {
    let out = TempDir::new().unwrap();
    // Paced slowly enough that stage 2 is certain to wait at least once.
    let cfg = RunConfig::new(3, 1_000, out.path()).with_throughput(10_000);
    let pause = FailOn { victim: "relay-stage-2", inner: Yielding::default() };
    let err = relay_core::run(cfg, pause).unwrap_err();
    let msg = format!("{:#}", err);
    assert!(msg.contains("relay-stage-2 failed"), "{}", msg);
    assert!(msg.contains("injected failure"), "{}", msg);
    // Run directory is cleaned up on failure too.
    assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
}

#[test]
fn stalled_upstream_is_reported_not_hung() {
    let out = TempDir::new().unwrap();
    let ctx = Arc::new(RunContext::create(RunConfig::new(2, 5, out.path())).unwrap());
    producer::run(&ctx, guard()).unwrap();
    // Stage 1 never runs.
    let err = stage::run(&ctx, 2, Deadline::new(Duration::from_millis(20))).unwrap_err();
    assert!(format!("{:#}", err).contains("stalled"));
}

#[test]
fn abort_flag_releases_waiting_stage() {
    let out = TempDir::new().unwrap();
    let ctx = Arc::new(RunContext::create(RunConfig::new(1, 5, out.path())).unwrap());
    let started = Arc::new(AtomicBool::new(false));
    let waiter = {
        let ctx = ctx.clone();
        let started = started.clone();
        thread::spawn(move || {
            started.store(true, Ordering::Relaxed);
            stage::run(&ctx, 1, Yielding::default())
        })
    };
    while !started.load(Ordering::Relaxed) {
        thread::yield_now();
    }
    ctx.abort();
    let err = waiter.join().unwrap().unwrap_err();
    assert!(format!("{:#}", err).contains("aborted"));
}
