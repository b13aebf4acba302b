//! scanfleetd — the scan engine fleet daemon.
//!
//! # Usage
//!
//! ```text
//! scanfleetd run --config fleet.toml [--json]
//! scanfleetd simulate --config fleet.toml --jobs 20 --seconds 30
//! scanfleetd check-config --config fleet.toml
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use scanfleetd::SimulatedFleet;
use scanfleetd::fleet::{describe, load_config};

const DEFAULT_FILTER: &str = "info,scanfleetd=debug,scanfleet=debug";

#[derive(Parser)]
#[command(name = "scanfleetd", about = "Scan engine fleet daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the fleet until Ctrl-C.
    Run {
        /// Path to fleet.toml.
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,

        /// Emit logs as JSON lines.
        #[arg(long)]
        json: bool,
    },
    /// Run the fleet against synthetic scans and print the final pool.
    Simulate {
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,

        /// Number of scans to queue.
        #[arg(long, default_value = "10")]
        jobs: usize,

        /// How long to run, in seconds.
        #[arg(long, default_value = "30")]
        seconds: u64,
    },
    /// Validate a config file and print its tier table.
    CheckConfig {
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, json } => {
            init_tracing(json);
            run(config).await
        }
        Command::Simulate {
            config,
            jobs,
            seconds,
        } => {
            init_tracing(false);
            simulate(config, jobs, seconds).await
        }
        Command::CheckConfig { config } => {
            let config = load_config(&config)?;
            print!("{}", describe(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(path: PathBuf) -> anyhow::Result<()> {
    let config = load_config(&path)?;
    info!(config = %path.display(), tiers = config.pool.len(), "scanfleetd starting");

    let mut fleet = SimulatedFleet::from_config(&config)?;
    fleet.supervisor.start().await?;
    fleet
        .supervisor
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("scanfleetd stopped");
    Ok(())
}

async fn simulate(path: PathBuf, jobs: usize, seconds: u64) -> anyhow::Result<()> {
    let config = load_config(&path)?;
    let mut fleet = SimulatedFleet::from_config(&config)?;
    fleet.seed_scans(jobs).await;
    info!(jobs, seconds, "simulation starting");

    fleet.supervisor.start().await?;
    fleet
        .supervisor
        .run_until(tokio::time::sleep(Duration::from_secs(seconds)))
        .await?;

    let report = fleet.report().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
