//! relaybench: staged relay pipeline latency benchmark.
//!
//! Pushes records through N gated stages over a shared memory-mapped log and
//! reports end-to-end latency percentiles. Run `relaybench --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod bench;
mod cli;
mod color;
mod config;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let example = config::BenchConfig::default_example();
            print!("{}", toml::to_string_pretty(&example)?);
        }
        Commands::Run {
            stages,
            throughput,
            unpaced,
            count,
            output_dir,
            no_warmup,
            report,
        } => {
            let mut config = config::BenchConfig::load_or_default(&cli.config)?;
            if let Some(stages) = stages {
                config.stages = stages;
            }
            if let Some(throughput) = throughput {
                config.throughput = throughput;
            }
            if let Some(count) = count {
                config.count = count;
            }
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }
            config.unpaced |= unpaced;
            config.warmup &= !no_warmup;
            bench::run(&config, report)?;
        }
    }

    Ok(())
}
