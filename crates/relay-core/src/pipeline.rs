//! Run orchestration.
//!
//! [`run`] creates a fresh [`RunContext`], starts the pretoucher, one thread per
//! stage and the producer, and waits for all of them to report back over a
//! crossbeam channel. The first failure raises the run's abort flag so every
//! other polling loop exits instead of spinning on a dead upstream. Once all
//! workers have joined, the latency collector reads the log and the run
//! directory is deleted.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;

use crate::affinity::pin_to_core;
use crate::collector::{self, LatencyReport};
use crate::config::RunConfig;
use crate::context::RunContext;
use crate::pause::PauseStrategy;
use crate::producer::{self, Pretoucher, ProducerStats};
use crate::stage::{self, StageStats};

/// Everything measured in one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub stages: usize,
    pub producer: ProducerStats,
    /// Sorted by stage.
    pub stage_stats: Vec<StageStats>,
    pub latency: LatencyReport,
    /// Final value of every gate, sorted by id.
    pub gates: Vec<(String, i64)>,
    /// Pages the pretoucher faulted in, if it stopped in time.
    pub pretouched_pages: Option<usize>,
}

impl RunReport {
    pub fn throughput_line(&self) -> String {
        format!(
            "Producer wrote {} messages in {:.3} seconds",
            self.producer.written,
            self.producer.elapsed.as_secs_f64()
        )
    }

    pub fn gate(&self, id: &str) -> Option<i64> {
        self.gates.iter().find(|(g, _)| g == id).map(|(_, v)| *v)
    }
}

enum Outcome {
    Producer(ProducerStats),
    Stage(StageStats),
}

struct Exit {
    role: String,
    result: Result<Outcome>,
}

/// Run the whole pipeline once with `config`, using clones of `pause` in
/// every polling loop.
pub fn run<P: PauseStrategy>(config: RunConfig, pause: P) -> Result<RunReport> {
    let ctx = Arc::new(RunContext::create(config)?);
    let stages = ctx.config().stages;
    let join_timeout = ctx.config().pretouch_join_timeout;

    let mut pretoucher = Some(Pretoucher::start(ctx.clone())?);
    let (exit_tx, exit_rx) = crossbeam_channel::unbounded::<Exit>();
    let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(stages + 1);

    let spawned = spawn_workers(&ctx, &pause, &exit_tx, &mut handles);
    drop(exit_tx);
    if let Err(e) = spawned {
        ctx.abort();
        for handle in handles {
            let _ = handle.join();
        }
        if let Some(p) = pretoucher.take() {
            p.stop(join_timeout);
        }
        return Err(e);
    }

    let mut producer_stats = None;
    let mut stage_stats = Vec::with_capacity(stages);
    let mut pretouched_pages = None;
    let mut first_err: Option<anyhow::Error> = None;

    // Ends once every worker has reported and dropped its sender.
    for exit in exit_rx.iter() {
        match exit.result {
            Ok(Outcome::Producer(stats)) => {
                producer_stats = Some(stats);
                if let Some(p) = pretoucher.take() {
                    pretouched_pages = p.stop(join_timeout);
                }
            }
            Ok(Outcome::Stage(stats)) => {
                tracing::debug!(stage = stats.stage, processed = stats.processed, "stage joined");
                stage_stats.push(stats);
            }
            Err(e) if first_err.is_none() => {
                tracing::error!(role = %exit.role, "{:#}", e);
                ctx.abort();
                first_err = Some(e.context(format!("{} failed", exit.role)));
            }
            Err(e) => {
                tracing::debug!(role = %exit.role, "{:#}", e);
            }
        }
    }

    if let Some(p) = pretoucher.take() {
        p.stop(join_timeout);
    }
    for handle in handles {
        let _ = handle.join();
    }
    if let Some(e) = first_err {
        return Err(e);
    }

    let producer = producer_stats.context("producer exited without reporting")?;
    let latency = collector::collect(&ctx)?;
    if latency.records != producer.written {
        anyhow::bail!(
            "collector read {} records but the producer wrote {}",
            latency.records,
            producer.written
        );
    }
    stage_stats.sort_by_key(|s| s.stage);
    let gates = ctx.gates().snapshot();

    remove_run_dir(ctx)?;

    Ok(RunReport { stages, producer, stage_stats, latency, gates, pretouched_pages })
}

/// Delete the run directory now. A pretoucher that missed its join timeout
/// may still hold a reference; its mapping stays valid after the files are
/// unlinked, so the directory is removed out from under it.
fn remove_run_dir(ctx: Arc<RunContext>) -> Result<()> {
    let run_dir = ctx.dir().to_path_buf();
    match Arc::try_unwrap(ctx) {
        Ok(ctx) => ctx.close()?,
        Err(shared) => {
            tracing::warn!(dir = %run_dir.display(), "run context still shared; removing directory anyway");
            std::fs::remove_dir_all(&run_dir).with_context(|| {
                format!("failed to remove run directory {}", run_dir.display())
            })?;
            drop(shared);
        }
    }
    tracing::debug!(dir = %run_dir.display(), "run directory removed");
    Ok(())
}

/// Start the stage threads (downstream first, so every stage is already
/// polling when the first record lands) and then the producer.
fn spawn_workers<P: PauseStrategy>(
    ctx: &Arc<RunContext>,
    pause: &P,
    exits: &Sender<Exit>,
    handles: &mut Vec<JoinHandle<()>>,
) -> Result<()> {
    for s in (1..=ctx.config().stages).rev() {
        let p = pause.clone();
        handles.push(spawn_worker(
            format!("relay-stage-{}", s),
            ctx.clone(),
            ctx.config().pin_core(s),
            exits.clone(),
            move |ctx| stage::run(ctx, s, p).map(Outcome::Stage),
        )?);
    }

    let p = pause.clone();
    handles.push(spawn_worker(
        "relay-producer".to_string(),
        ctx.clone(),
        ctx.config().pin_core(0),
        exits.clone(),
        move |ctx| producer::run(ctx, p).map(Outcome::Producer),
    )?);
    Ok(())
}

fn spawn_worker<F>(
    name: String,
    ctx: Arc<RunContext>,
    core: Option<usize>,
    exits: Sender<Exit>,
    work: F,
) -> Result<JoinHandle<()>>
where
    F: FnOnce(&RunContext) -> Result<Outcome> + Send + 'static,
{
    let role = name.clone();
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                if let Some(core) = core {
                    pin_to_core(core);
                }
                work(&ctx)
            }))
                .unwrap_or_else(|panic| Err(anyhow::anyhow!("panicked: {}", panic_message(&*panic))));
            let _ = exits.send(Exit { role, result });
        })
        .context("failed to spawn worker thread")
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pause::{Bounded, Yielding};
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_panic_message() {
        let p: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*p), "boom");
        let p: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*p), "bang");
        let p: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*p), "unknown panic payload");
    }

    #[test]
    fn test_single_stage_run() {
        let out = TempDir::new().unwrap();
        let report = run(RunConfig::new(1, 100, out.path()), Yielding::default()).unwrap();
        assert_eq!(report.producer.written, 100);
        assert_eq!(report.latency.records, 100);
        assert_eq!(report.gate("stage-1"), Some(99));
        assert_eq!(report.stage_stats.len(), 1);
        assert!(report.throughput_line().starts_with("Producer wrote 100 messages in "));
    }

    #[test]
    fn test_zero_stages_rejected_before_threads() {
        let out = TempDir::new().unwrap();
        let err = run(RunConfig::new(0, 10, out.path()), Bounded::new(10)).unwrap_err();
        assert!(err.to_string().contains("stage count"));
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_run_directory_removed_when_pretoucher_is_slow_to_stop() {
        let out = TempDir::new().unwrap();
        let mut cfg = RunConfig::new(2, 10, out.path());
        cfg.pretouch_period = Duration::from_millis(500);
        cfg.pretouch_join_timeout = Duration::from_millis(1);
        let report = run(cfg, Yielding::default()).unwrap();
        assert_eq!(report.latency.records, 10);
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_remove_run_dir_with_outstanding_reference() {
        let out = TempDir::new().unwrap();
        let ctx = Arc::new(RunContext::create(RunConfig::new(1, 10, out.path())).unwrap());
        let held = ctx.clone();
        remove_run_dir(ctx).unwrap();
        assert!(!held.dir().exists());
        // The log mapping outlives its file.
        assert!(held.log().tail().next().is_none());
        drop(held);
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_bad_pin_core_rejected_before_threads() {
        let out = TempDir::new().unwrap();
        let mut cfg = RunConfig::new(2, 10, out.path());
        cfg.pin_cores = vec![usize::MAX];
        assert!(run(cfg, Bounded::new(10)).is_err());
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_run_directory_removed() {
        let out = TempDir::new().unwrap();
        run(RunConfig::new(2, 10, out.path()), Yielding::default()).unwrap();
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }
}
