//! Stage processor loop.
//!
//! Stage `s` tails the log from the first record and, for each record:
//!
//! 1. waits for the tailer to return it (awaiting record),
//! 2. for `s >= 2`, waits until `stage-{s-1}`'s gate reaches the record's
//!    index (awaiting upstream gate); stage 1 only depends on the producer,
//!    whose commit the log already orders,
//! 3. stamps `timestamps[s]` in place (processing),
//! 4. publishes its own gate with the record's index (published),
//!
//! and exits after the record whose `remaining` is 0. The stamp is a plain
//! store sequenced before the gate's `Release` store, so the next stage's
//! `Acquire` read of the gate makes the stamp visible to it.

use anyhow::{Context, Result};

use crate::clock::{now_ns, spin_for};
use crate::context::RunContext;
use crate::gate::stage_gate_id;
use crate::pause::{poll, PauseStrategy};

/// What one stage did.
#[derive(Debug, Clone, Copy)]
pub struct StageStats {
    pub stage: usize,
    pub processed: u64,
    pub last_index: u64,
}

/// Run stage `stage` (1-based) until it has processed the terminal record.
pub fn run<P: PauseStrategy>(ctx: &RunContext, stage: usize, mut pause: P) -> Result<StageStats> {
    let stages = ctx.config().stages;
    if stage == 0 || stage > stages {
        anyhow::bail!("stage {} out of range 1..={}", stage, stages);
    }

    let gate = ctx.gates().open(&stage_gate_id(stage))?;
    let upstream = match stage {
        1 => None,
        s => Some(ctx.gates().open(&stage_gate_id(s - 1))?),
    };
    let delay = ctx.config().stage_delay(stage);
    let abort = ctx.abort_flag();
    let mut tailer = ctx.log().tail();
    let mut processed = 0u64;

    tracing::debug!(stage, upstream = ?upstream.as_ref().map(|g| g.id()), "stage started");

    loop {
        let want = tailer.next_index();
        let entry = poll(&mut pause, abort, || tailer.next())
            .with_context(|| format!("stage {} waiting for record {}", stage, want))?;
        let index = entry.index();
        let record = entry.record();

        if let Some(upstream) = &upstream {
            poll(&mut pause, abort, || upstream.has_completed(index).then_some(()))
                .with_context(|| {
                    format!("stage {} waiting for {} to reach record {}", stage, upstream.id(), index)
                })?;
        }

        record.stamp(stage, now_ns());
        if let Some(delay) = delay {
            spin_for(delay);
        }
        gate.publish(index as i64);
        processed += 1;

        if record.is_last() {
            tracing::debug!(stage, processed, last_index = index, "stage done");
            return Ok(StageStats { stage, processed, last_index: index });
        }
    }
}
