mod config;
mod executors;
mod launch;
mod sync;
mod unit;

use clap::Parser;
use config::ExperimentConfig;
use executors::Executors;
use launch::LaunchOptions;
use std::{path::PathBuf, process::exit};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Batch launcher for gem5 experiment units.
///
/// Units that already ran to success are skipped; units another invocation
/// is currently running are left alone.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to the experiment description (yaml)
    config: PathBuf,

    /// Worker pool size, overrides the configured value
    #[arg(short = 'j', long)]
    workers: Option<usize>,

    /// Relaunch units whose previous run exited non-zero
    #[arg(long)]
    rerun_failed: bool,

    /// Relaunch every unit regardless of its recorded status
    #[arg(long)]
    force: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match ExperimentConfig::load(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            error!(path = %cli.config.display(), %error, "failed to load experiment config");
            exit(1);
        }
    };
    if let Some(workers) = cli.workers {
        config.executor.workers = workers;
    }

    if config.preflight_checks() {
        error!("preflight checks failed, aborting");
        exit(1);
    }

    let opts = LaunchOptions {
        rerun_failed: cli.rerun_failed || config.rerun_failed,
        force: cli.force,
    };
    let launchers = config.build_launchers();
    info!(units = launchers.len(), "dispatching experiment units");

    let mut executor = match Executors::load(&config.executor, launchers, opts) {
        Ok(executor) => executor,
        Err(error) => {
            error!(%error, "failed to load executor");
            exit(1);
        }
    };

    if let Err(error) = executor.execute() {
        error!(%error, "executor failed");
        exit(1);
    }
}
