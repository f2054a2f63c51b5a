//! `relay.toml` configuration for relaybench.

use anyhow::{Context, Result};
use relay_core::RunConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level benchmark configuration. Every field has a default, so an empty
/// file (or no file at all) is a valid config.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BenchConfig {
    /// Number of stage processors in the chain.
    #[serde(default = "BenchConfig::default_stages")]
    pub stages: usize,
    /// Producer rate in records per second.
    #[serde(default = "BenchConfig::default_throughput")]
    pub throughput: u64,
    /// Ignore `throughput` and produce as fast as the log accepts records.
    #[serde(default)]
    pub unpaced: bool,
    /// Records produced in the measured run.
    #[serde(default = "BenchConfig::default_count")]
    pub count: u64,
    /// Directory the run's temporary log and gate files are created under.
    #[serde(default = "BenchConfig::default_output_dir")]
    pub output_dir: String,
    /// Run a shorter, unreported pass first to warm caches and the allocator.
    #[serde(default = "BenchConfig::default_warmup")]
    pub warmup: bool,
    #[serde(default = "BenchConfig::default_warmup_count")]
    pub warmup_count: u64,
    /// Log producer progress every N records (0 disables).
    #[serde(default = "BenchConfig::default_progress_every")]
    pub progress_every: u64,
    #[serde(default = "BenchConfig::default_pretouch_period_us")]
    pub pretouch_period_us: u64,
    #[serde(default = "BenchConfig::default_pretouch_join_timeout_ms")]
    pub pretouch_join_timeout_ms: u64,
    /// Fail a run when any thread waits longer than this. Omit to wait forever.
    #[serde(default)]
    pub stall_timeout_ms: Option<u64>,
    /// Simulated work per stage in nanoseconds, spun between stamping and
    /// publishing. Index 0 is stage 1.
    #[serde(default)]
    pub stage_delay_ns: Vec<u64>,
    /// CPU cores to pin threads to. Index 0 is the producer, index s is stage s.
    #[serde(default)]
    pub pin_cores: Vec<usize>,
}

impl BenchConfig {
    fn default_stages() -> usize { 3 }
    fn default_throughput() -> u64 { 100_000 }
    fn default_count() -> u64 { 1_000_000 }
    fn default_output_dir() -> String {
        std::env::temp_dir().join("relaybench").to_string_lossy().into_owned()
    }
    fn default_warmup() -> bool { true }
    fn default_warmup_count() -> u64 { 100_000 }
    fn default_progress_every() -> u64 { 100_000 }
    fn default_pretouch_period_us() -> u64 { 500 }
    fn default_pretouch_join_timeout_ms() -> u64 { 1_000 }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }

    /// Load `path` if it exists, otherwise fall back to the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            Ok(Self::default())
        }
    }

    /// Returns the config printed by `relaybench init`.
    pub fn default_example() -> Self {
        Self { stall_timeout_ms: Some(30_000), ..Self::default() }
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout_ms.map(Duration::from_millis)
    }

    /// Parameters for the measured run.
    pub fn run_config(&self) -> Result<RunConfig> {
        self.build(self.count)
    }

    /// Parameters for the warm-up pass: same pipeline, `warmup_count` records.
    pub fn warmup_config(&self) -> Result<RunConfig> {
        self.build(self.warmup_count)
    }

    fn build(&self, count: u64) -> Result<RunConfig> {
        let mut cfg = RunConfig::new(self.stages, count, PathBuf::from(&self.output_dir));
        cfg.throughput = (!self.unpaced).then_some(self.throughput);
        cfg.progress_every = self.progress_every;
        cfg.pretouch_period = Duration::from_micros(self.pretouch_period_us);
        cfg.pretouch_join_timeout = Duration::from_millis(self.pretouch_join_timeout_ms);
        cfg.stage_delays = self.stage_delay_ns.iter().map(|&ns| Duration::from_nanos(ns)).collect();
        cfg.pin_cores = self.pin_cores.clone();
        cfg.validate()?;
        // Every wait spans at least one pacing gap, so a shorter timeout
        // would fail a healthy run.
        if let Some(stall) = self.stall_timeout() {
            let interval = Duration::from_nanos(cfg.interval_ns());
            if stall <= interval {
                anyhow::bail!(
                    "stall_timeout_ms ({} ms) must exceed the pacing interval ({:?} at {} records/s)",
                    stall.as_millis(),
                    interval,
                    self.throughput
                );
            }
        }
        Ok(cfg)
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            stages: Self::default_stages(),
            throughput: Self::default_throughput(),
            unpaced: false,
            count: Self::default_count(),
            output_dir: Self::default_output_dir(),
            warmup: Self::default_warmup(),
            warmup_count: Self::default_warmup_count(),
            progress_every: Self::default_progress_every(),
            pretouch_period_us: Self::default_pretouch_period_us(),
            pretouch_join_timeout_ms: Self::default_pretouch_join_timeout_ms(),
            stall_timeout_ms: None,
            stage_delay_ns: Vec::new(),
            pin_cores: Vec::new(),
        }
    }
}
