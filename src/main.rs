//! virtfleet daemon entry point.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use virtfleet::config::Config;
use virtfleet::db::Database;
use virtfleet::reconcile::ClusterSupervisor;
use virtfleet::sync::TemplateSyncEngine;

#[derive(Parser)]
#[command(name = "virtfleet", version, about = "Fleet-wide hypervisor inventory and control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reconciliation daemon.
    Run {
        /// Path to the TOML configuration file.
        #[arg(long, default_value = "virtfleet.toml")]
        config: PathBuf,
    },
    /// Parse the configuration file and exit.
    CheckConfig {
        #[arg(long, default_value = "virtfleet.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => run(&config).await,
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = Config::load(path)?;
    println!(
        "configuration OK: resync every {}s, watch every {}s, supervisor tick {}s",
        config.reconciler.resync_period_secs,
        config.reconciler.poll_interval_secs,
        config.reconciler.supervisor_tick_secs,
    );
    Ok(())
}

async fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load_or_default(config_path)?;
    init_tracing(&config.log.level);

    tracing::info!(
        database = %config.database.path.display(),
        "starting virtfleet"
    );
    let db = Database::open(&config.database.path)?;

    let root = CancellationToken::new();
    let supervisor = Arc::new(ClusterSupervisor::new(
        db.clone(),
        config.reconciler.clone(),
        &root,
    ));
    let sync_engine = TemplateSyncEngine::new(db, config.template_sync.clone(), &root);

    let supervisor_task = tokio::spawn(supervisor.clone().run());
    let sync_task = sync_engine.run();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received, stopping");

    root.cancel();
    supervisor.stop().await;
    let _ = supervisor_task.await;
    let _ = sync_task.await;

    tracing::info!("virtfleet stopped");
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
