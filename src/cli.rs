//! CLI definitions for relaybench.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "relaybench",
    version,
    about = "Staged relay pipeline latency benchmark\n\nPushes fixed-size records through a chain of gated stages over a memory-mapped log and reports end-to-end latency percentiles.",
    long_about = None
)]
pub struct Cli {
    /// Path to relay.toml config file (defaults are used if it does not exist)
    #[clap(long, short, default_value = "relay.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the benchmark and print a latency report
    Run {
        /// Number of stages (overrides config)
        #[clap(long)]
        stages: Option<usize>,

        /// Producer rate in records/sec (overrides config)
        #[clap(long)]
        throughput: Option<u64>,

        /// Produce as fast as possible, ignoring throughput
        #[clap(long)]
        unpaced: bool,

        /// Records in the measured run (overrides config)
        #[clap(long)]
        count: Option<u64>,

        /// Directory for the run's temporary storage (overrides config)
        #[clap(long)]
        output_dir: Option<String>,

        /// Skip the warm-up pass
        #[clap(long)]
        no_warmup: bool,

        /// Also write a JSON report to this file
        #[clap(long)]
        report: Option<PathBuf>,
    },

    /// Print an example relay.toml to stdout
    Init,
}
