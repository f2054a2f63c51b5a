//! Validated parameters for one pipeline run.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::affinity::MAX_CORE_ID;
use crate::record::MAX_STAGES;

/// Highest producer rate that still leaves a whole nanosecond between records.
pub const MAX_THROUGHPUT: u64 = 1_000_000_000;

/// Everything a run needs, fixed before any thread starts.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Number of stage processors (N). Records carry N + 1 timestamps.
    pub stages: usize,
    /// Target producer rate in records per second; `None` runs unpaced.
    pub throughput: Option<u64>,
    /// Records to produce.
    pub count: u64,
    /// Parent directory for the run's temporary storage.
    pub output_dir: PathBuf,
    /// Log producer progress every this many records (0 = never).
    pub progress_every: u64,
    pub pretouch_period: Duration,
    pub pretouch_join_timeout: Duration,
    /// Artificial work each stage spins for between stamping and publishing,
    /// indexed by stage - 1. Missing entries mean no delay.
    pub stage_delays: Vec<Duration>,
    /// CPU to pin each worker to: index 0 is the producer, index s is stage s.
    pub pin_cores: Vec<usize>,
}

impl RunConfig {
    pub fn new(stages: usize, count: u64, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            stages,
            throughput: None,
            count,
            output_dir: output_dir.into(),
            progress_every: 0,
            pretouch_period: Duration::from_micros(500),
            pretouch_join_timeout: Duration::from_secs(1),
            stage_delays: Vec::new(),
            pin_cores: Vec::new(),
        }
    }

    pub fn with_throughput(mut self, per_sec: u64) -> Self {
        self.throughput = Some(per_sec);
        self
    }

    pub fn with_stage_delay(mut self, stage: usize, delay: Duration) -> Self {
        if stage >= 1 {
            if self.stage_delays.len() < stage {
                self.stage_delays.resize(stage, Duration::ZERO);
            }
            self.stage_delays[stage - 1] = delay;
        }
        self
    }

    /// Reject anything that would make the pipeline misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.stages == 0 {
            anyhow::bail!("stage count must be at least 1");
        }
        if self.stages > MAX_STAGES {
            anyhow::bail!("stage count {} exceeds the record capacity of {}", self.stages, MAX_STAGES);
        }
        if self.count == 0 {
            anyhow::bail!("record count must be at least 1");
        }
        if self.throughput == Some(0) {
            anyhow::bail!("throughput must be positive (omit it to run unpaced)");
        }
        if let Some(t) = self.throughput.filter(|&t| t > MAX_THROUGHPUT) {
            anyhow::bail!(
                "throughput {} records/s exceeds {} (omit it to run unpaced)",
                t,
                MAX_THROUGHPUT
            );
        }
        if self.stage_delays.len() > self.stages {
            anyhow::bail!(
                "stage delays given for {} stages but only {} configured",
                self.stage_delays.len(),
                self.stages
            );
        }
        if self.pin_cores.len() > self.stages + 1 {
            anyhow::bail!(
                "{} pin cores given for {} worker threads",
                self.pin_cores.len(),
                self.stages + 1
            );
        }
        if let Some(&core) = self.pin_cores.iter().find(|&&c| c >= MAX_CORE_ID) {
            anyhow::bail!("pin core {} is out of range (must be below {})", core, MAX_CORE_ID);
        }
        Ok(())
    }

    /// Nominal gap between consecutive records; 0 when unpaced.
    pub fn interval_ns(&self) -> u64 {
        self.throughput.map_or(0, |t| 1_000_000_000 / t)
    }

    /// Delay configured for `stage`, if any.
    pub fn stage_delay(&self, stage: usize) -> Option<Duration> {
        stage
            .checked_sub(1)
            .and_then(|i| self.stage_delays.get(i))
            .copied()
            .filter(|d| !d.is_zero())
    }

    /// Core for worker `slot` (0 = producer, s = stage s).
    pub fn pin_core(&self, slot: usize) -> Option<usize> {
        self.pin_cores.get(slot).copied()
    }
}
