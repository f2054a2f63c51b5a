//! Paced record producer and its page pretoucher.
//!
//! The producer owns the log's appender. Record `i` is due at
//! `start + i * interval`; the producer busy-waits for that deadline, then
//! writes `remaining` and `timestamps[0]` straight into the reserved slot.
//!
//! The pretoucher runs beside it on its own thread and keeps faulting in
//! log pages ahead of the write position so the producer never pays for a
//! first-touch page fault inside a measured record.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::clock::now_ns;
use crate::context::RunContext;
use crate::pause::{poll, PauseStrategy};

/// What the producer did.
#[derive(Debug, Clone, Copy)]
pub struct ProducerStats {
    pub written: u64,
    pub elapsed: Duration,
}

impl ProducerStats {
    pub fn rate_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.written as f64 / secs
        } else {
            0.0
        }
    }
}

/// Append `count` records to the run's log at the configured rate.
pub fn run<P: PauseStrategy>(ctx: &RunContext, mut pause: P) -> Result<ProducerStats> {
    let config = ctx.config();
    let count = config.count;
    let interval = config.interval_ns();
    let progress_every = config.progress_every;
    let abort = ctx.abort_flag();
    let mut appender = ctx.log().appender()?;

    let wall = Instant::now();
    let start = now_ns();

    for i in 0..count {
        if interval > 0 {
            let deadline = start + i * interval;
            poll(&mut pause, abort, || (now_ns() >= deadline).then_some(()))
                .with_context(|| format!("producer pacing record {}", i))?;
        } else if ctx.is_aborted() {
            anyhow::bail!("run aborted");
        }

        let remaining = (count - 1 - i) as i64;
        let index = appender
            .append_with(|record| {
                record.set_remaining(remaining);
                record.stamp(0, now_ns());
            })
            .with_context(|| format!("producer failed to append record {}", i))?;
        debug_assert_eq!(index, i);

        if progress_every > 0 && remaining > 0 && remaining as u64 % progress_every == 0 {
            tracing::debug!(remaining, "producer progress");
        }
    }

    let stats = ProducerStats { written: count, elapsed: wall.elapsed() };
    tracing::debug!(
        "Producer wrote {} messages in {:.3} seconds",
        stats.written,
        stats.elapsed.as_secs_f64()
    );
    Ok(stats)
}

/// Handle to a running pretoucher thread. Dropping it stops the thread.
pub struct Pretoucher {
    stop: Sender<()>,
    done: Receiver<usize>,
    handle: Option<JoinHandle<()>>,
}

impl Pretoucher {
    /// Start touching pages of `ctx`'s log every `pretouch_period`.
    pub fn start(ctx: Arc<RunContext>) -> Result<Self> {
        let (stop, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (done_tx, done) = crossbeam_channel::bounded(1);
        let period = ctx.config().pretouch_period;

        let handle = std::thread::Builder::new()
            .name("relay-pretouch".into())
            .spawn(move || {
                let mut pages = 0usize;
                loop {
                    pages += ctx.log().pretouch();
                    // A stop message or a dropped handle both end the loop.
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                }
                drop(ctx);
                let _ = done_tx.send(pages);
            })
            .context("failed to spawn pretoucher thread")?;

        Ok(Self { stop, done, handle: Some(handle) })
    }

    /// Signal the thread and wait up to `timeout` for it to exit. Returns the
    /// pages it touched, or `None` if it did not stop in time (it is then left
    /// detached).
    pub fn stop(mut self, timeout: Duration) -> Option<usize> {
        let _ = self.stop.try_send(());
        match self.done.recv_timeout(timeout) {
            Ok(pages) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                tracing::debug!(pages, "pretoucher stopped");
                Some(pages)
            }
            Err(_) => {
                tracing::warn!(?timeout, "pretoucher did not stop in time; detaching");
                None
            }
        }
    }
}
