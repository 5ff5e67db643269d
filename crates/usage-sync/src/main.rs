//! usage-sync CLI - push storage usage from metering services into the
//! allocation usage store.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use usage_sync::config::{
    env_path, DEFAULT_SERVERS_PATH, DEFAULT_SNAPSHOT_DIR, ENV_SERVERS, ENV_SNAPSHOT_DIR,
};
use usage_sync::{
    build_orchestrator, RunStatus, RunSummary, SnapshotStore, SyncConfig, VolumeRegistry,
};

/// Storage usage sync - metering API to allocation usage store.
#[derive(Parser)]
#[command(name = "usage-sync")]
#[command(about = "Sync per-user storage usage into allocation records")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, snapshot and commit usage for every configured volume
    Run {
        /// Only sync volumes with this name
        #[arg(long)]
        volume: Option<String>,

        /// Remove snapshots once committed
        #[arg(long)]
        clean: bool,
    },

    /// Commit snapshots left pending by earlier runs
    Retry {
        /// Remove snapshots once committed
        #[arg(long)]
        clean: bool,
    },

    /// List snapshots that have not been committed
    Pending,

    /// Remove committed snapshots older than a number of days
    Prune {
        #[arg(long, default_value = "7")]
        days: u32,
    },

    /// Print the configured volumes
    Volumes,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json);

    match cli.command {
        Commands::Run { volume, clean } => {
            let config = SyncConfig::from_env()?;
            let registry = VolumeRegistry::load(&config.servers_path)?;
            let volumes = registry.select(volume.as_deref())?;

            let orchestrator = build_orchestrator(&config)?;
            let token = orchestrator.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted - finishing current volume");
                    token.cancel();
                }
            });

            let summary = orchestrator.run(&volumes, clean).await;
            print_summary(&summary);
            exit_on_total_loss(&summary);
        }

        Commands::Retry { clean } => {
            let config = SyncConfig::from_env()?;
            let orchestrator = build_orchestrator(&config)?;
            let summary = orchestrator.retry_pending(clean)?;
            if summary.results.is_empty() {
                println!("{}", "No pending snapshots".dimmed());
            } else {
                print_summary(&summary);
                exit_on_total_loss(&summary);
            }
        }

        Commands::Pending => {
            let snapshots = SnapshotStore::new(env_path(ENV_SNAPSHOT_DIR, DEFAULT_SNAPSHOT_DIR));
            let pending = snapshots.pending(None)?;
            if pending.is_empty() {
                println!("{}", "No pending snapshots".dimmed());
            }
            for handle in pending {
                println!(
                    "{:<24} {}  {} records  {}",
                    handle.volume.to_string().bold(),
                    handle.run_id,
                    handle.record_count,
                    handle.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string().dimmed()
                );
            }
        }

        Commands::Prune { days } => {
            let snapshots = SnapshotStore::new(env_path(ENV_SNAPSHOT_DIR, DEFAULT_SNAPSHOT_DIR));
            let removed = snapshots.prune(chrono::Duration::days(i64::from(days)))?;
            println!("Removed {removed} committed snapshot(s) older than {days} day(s)");
        }

        Commands::Volumes => {
            let path = env_path(ENV_SERVERS, DEFAULT_SERVERS_PATH);
            let registry = VolumeRegistry::load(&path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            for volume in registry.volumes() {
                println!(
                    "{:<24} {:<12} {}",
                    volume.id().to_string().bold(),
                    volume.kind.to_string(),
                    volume.endpoint_url
                );
                for path in &volume.paths {
                    println!("    {}", path.dimmed());
                }
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("usage_sync=debug,info")
        } else {
            EnvFilter::new("usage_sync=info,warn")
        }
    });

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} {}  {}/{} volumes succeeded, {} records committed",
        "Run".bold(),
        summary.run_id,
        summary.succeeded(),
        summary.results.len(),
        summary.records_committed()
    );

    for result in &summary.results {
        let status = match result.status {
            RunStatus::Success => "success".green(),
            RunStatus::Partial => "partial".yellow(),
            RunStatus::Failed => "failed".red(),
            RunStatus::Cancelled => "cancelled".dimmed(),
        };
        let mut line = format!(
            "  {:<24} {:<9} committed={} skipped={}",
            result.volume.to_string(),
            status,
            result.records_committed,
            result.records_skipped
        );
        if result.resumed {
            line.push_str(" (resumed)");
        }
        println!("{line}");
        if let Some(error) = &result.error {
            println!("    {} {}", format!("{}:", error.kind).red(), error.message);
        }
    }
}

fn exit_on_total_loss(summary: &RunSummary) {
    if summary.is_total_loss() {
        eprintln!("{}", "No volume synced successfully".red().bold());
        std::process::exit(1);
    }
}
