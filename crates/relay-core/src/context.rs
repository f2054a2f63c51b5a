//! Per-run shared state: the log, the gates and the abort flag.
//!
//! A [`RunContext`] owns a fresh temporary directory under the configured
//! output directory. The log and every gate file live inside it, and it is
//! deleted when the last `Arc<RunContext>` is dropped.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::config::RunConfig;
use crate::gate::GateRegistry;
use crate::log::RecordLog;
use crate::record::RecordLayout;

/// Name of the log inside the run directory.
pub const LOG_NAME: &str = "relay";

pub struct RunContext {
    config: RunConfig,
    // Declared before `dir` so the mappings go away before the directory does.
    log: RecordLog,
    gates: GateRegistry,
    abort: AtomicBool,
    dir: TempDir,
}

impl RunContext {
    /// Validate `config` and create the run directory, log and gate registry.
    pub fn create(config: RunConfig) -> Result<Self> {
        config.validate()?;
        let layout = RecordLayout::new(config.stages)?;

        std::fs::create_dir_all(&config.output_dir).with_context(|| {
            format!("failed to create output directory: {}", config.output_dir.display())
        })?;
        let dir = tempfile::Builder::new()
            .prefix("relay-run-")
            .tempdir_in(&config.output_dir)
            .with_context(|| {
                format!("failed to create run directory in {}", config.output_dir.display())
            })?;

        let capacity = RecordLog::bytes_for(layout, config.count);
        let log = RecordLog::create(dir.path(), LOG_NAME, layout, capacity)?;
        let gates = GateRegistry::new(dir.path());

        tracing::info!(
            dir = %dir.path().display(),
            stages = config.stages,
            count = config.count,
            log_bytes = capacity,
            "run created"
        );

        Ok(Self { config, log, gates, abort: AtomicBool::new(false), dir })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn layout(&self) -> RecordLayout {
        self.log.layout()
    }

    pub fn log(&self) -> &RecordLog {
        &self.log
    }

    pub fn gates(&self) -> &GateRegistry {
        &self.gates
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Ask every polling loop in the run to give up.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    pub fn abort_flag(&self) -> &AtomicBool {
        &self.abort
    }

    /// Unmap the log and gates, then delete the run directory, reporting any
    /// failure instead of ignoring it on drop.
    pub fn close(self) -> Result<()> {
        let RunContext { log, gates, dir, .. } = self;
        drop(log);
        drop(gates);
        let path = dir.path().to_path_buf();
        dir.close()
            .with_context(|| format!("failed to remove run directory {}", path.display()))
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("dir", &self.dir.path())
            .field("stages", &self.config.stages)
            .field("count", &self.config.count)
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_teardown() {
        let out = TempDir::new().unwrap();
        let ctx = RunContext::create(RunConfig::new(2, 100, out.path())).unwrap();
        let run_dir = ctx.dir().to_path_buf();
        assert!(run_dir.starts_with(out.path()));
        assert!(run_dir.join("relay.log").exists());
        assert_eq!(ctx.layout().stages(), 2);
        drop(ctx);
        assert!(!run_dir.exists());
    }

    #[test]
    fn test_close_removes_directory() {
        let out = TempDir::new().unwrap();
        let ctx = RunContext::create(RunConfig::new(1, 10, out.path())).unwrap();
        let run_dir = ctx.dir().to_path_buf();
        ctx.close().unwrap();
        assert!(!run_dir.exists());
    }

    #[test]
    fn test_invalid_config_creates_nothing() {
        let out = TempDir::new().unwrap();
        assert!(RunContext::create(RunConfig::new(0, 100, out.path())).is_err());
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_creates_missing_output_dir() {
        let out = TempDir::new().unwrap();
        let nested = out.path().join("a").join("b");
        let ctx = RunContext::create(RunConfig::new(1, 1, &nested)).unwrap();
        assert!(ctx.dir().starts_with(&nested));
    }

    #[test]
    fn test_abort_flag() {
        let out = TempDir::new().unwrap();
        let ctx = RunContext::create(RunConfig::new(1, 1, out.path())).unwrap();
        assert!(!ctx.is_aborted());
        ctx.abort();
        assert!(ctx.is_aborted());
        assert!(ctx.abort_flag().load(Ordering::Relaxed));
    }
}
