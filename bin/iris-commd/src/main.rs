//! ---
//! iris_section: "01-core-functionality"
//! iris_subsection: "binary"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Binary entrypoint for the comm link daemon."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use iris_comm::{new_registry, MessengerFactory, PollerMetrics};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

mod config;
mod jobs;
mod links;
mod logging;
mod status_server;

use config::DaemonConfig;
use links::Supervisor;
use logging::init_tracing;
use status_server::spawn_status_server;

const SERVICE: &str = "iris-commd";

#[derive(Debug, Parser)]
#[command(author, version, about = "IRIS comm link daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run every configured link")]
    Run {
        #[arg(long, value_name = "SECS", help = "Stop after this many seconds")]
        duration: Option<u64>,
        #[arg(long, value_name = "FILE", help = "Write a JSON status report on exit")]
        report: Option<PathBuf>,
    },
    #[command(about = "Validate the configuration and exit")]
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/iris-commd.toml"));
    let (config, source) = DaemonConfig::load_with_source(&candidates)?;

    match cli.command.unwrap_or(Commands::Run {
        duration: None,
        report: None,
    }) {
        Commands::Check => {
            println!(
                "{}: {} links, {} controllers, {} simulators",
                source.display(),
                config.comm.links.len(),
                config.comm.controllers.len(),
                config.simulation.build().len()
            );
            Ok(())
        }
        Commands::Run { duration, report } => {
            init_tracing(SERVICE, &config.logging)?;
            info!(config_path = %source.display(), "configuration loaded");
            run_daemon(config, duration.map(Duration::from_secs), report.as_deref()).await
        }
    }
}

async fn run_daemon(
    config: DaemonConfig,
    duration: Option<Duration>,
    report: Option<&Path>,
) -> Result<()> {
    let registry = new_registry();
    let metrics = PollerMetrics::new(registry.clone())?;

    let factory = MessengerFactory::new();
    let sims = config.simulation.build();
    if !sims.is_empty() {
        info!(simulators = sims.len(), "simulated devices registered");
        sims.register(&factory);
    }

    let supervisor = Supervisor::start(&config, factory, Some(metrics))?;
    let links = supervisor.links();
    let status_server = if config.metrics.enabled {
        Some(spawn_status_server(registry, links.clone(), config.metrics.listen)?)
    } else {
        info!("status endpoint disabled by configuration");
        None
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let jobs = jobs::spawn_jobs(links.clone(), &config.polling, shutdown_rx);

    match duration {
        Some(limit) => {
            tokio::select! {
                _ = tokio::time::sleep(limit) => {
                    info!(seconds = limit.as_secs(), "run duration elapsed");
                }
                result = signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
            }
        }
        None => signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?,
    }
    info!("shutdown requested");

    let _ = shutdown_tx.send(true);
    for job in jobs {
        if let Err(err) = job.await {
            warn!(error = %err, "polling job ended abnormally");
        }
    }
    links.log_summary();
    if let Some(path) = report {
        let json = serde_json::to_string_pretty(&links.report())?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report {}", path.display()))?;
        info!(report = %path.display(), "status report written");
    }
    supervisor.shutdown().await;

    if let Some(server) = status_server {
        server.shutdown().await?;
    }
    Ok(())
}
