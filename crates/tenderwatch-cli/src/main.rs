use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tenderwatch_sync::{
    build_storage, report_recent_runs_markdown, run_sync_once_from_env, ArchiveManager, PurgeMode, PurgeStatus,
    SourceOutcome, SourceRegistry, SyncConfig, SyncPipeline,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "tenderwatch")]
#[command(about = "Merge scraped tender batches into versioned histories and archive superseded files")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled source once.
    Sync {
        /// Purge expired archive entries regardless of the weekday.
        #[arg(long, conflicts_with = "skip_purge")]
        force_purge: bool,
        #[arg(long)]
        skip_purge: bool,
    },
    /// Purge expired archive entries only.
    Purge,
    /// Run syncs on TENDERWATCH_SYNC_CRON until interrupted.
    Schedule,
    /// Print the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("tenderwatch=info".parse()?))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        force_purge: false,
        skip_purge: false,
    }) {
        Commands::Sync {
            force_purge,
            skip_purge,
        } => {
            let mode = match (force_purge, skip_purge) {
                (true, _) => PurgeMode::Force,
                (_, true) => PurgeMode::Skip,
                _ => PurgeMode::Scheduled,
            };
            let summary = run_sync_once_from_env(mode).await?;
            for source in &summary.sources {
                match &source.outcome {
                    SourceOutcome::Merged => println!(
                        "{}: inserted={} appended={} discarded={} skipped={} upload={:?}",
                        source.source,
                        source.counts.inserted,
                        source.counts.appended,
                        source.counts.discarded,
                        source.counts.skipped,
                        source.upload
                    ),
                    SourceOutcome::Failed { stage, error } => {
                        println!("{}: FAILED at {stage}: {error}", source.source)
                    }
                }
            }
            println!(
                "sync complete: run_id={} sources={} failed={} purge={} reports={}",
                summary.run_id,
                summary.sources.len(),
                summary.failed_sources(),
                purge_label(&summary.purge),
                summary.reports_dir
            );
            if summary.failed_sources() > 0 {
                std::process::exit(1);
            }
        }
        Commands::Purge => {
            let config = SyncConfig::from_env();
            let storage = build_storage(&config)?;
            let archive = ArchiveManager::new(storage, config.archive_folder.clone(), config.retention_days);
            let outcome = archive.run_weekly_purge(Utc::now()).await?;
            println!(
                "purge complete: deleted={} retained={} failed={}",
                outcome.deleted.len(),
                outcome.retained,
                outcome.failed.len()
            );
            if !outcome.failed.is_empty() {
                std::process::exit(1);
            }
        }
        Commands::Schedule => {
            let config = SyncConfig::from_env();
            if !config.scheduler_enabled {
                bail!("scheduler disabled; set TENDERWATCH_SCHEDULER_ENABLED=true");
            }
            let registry = SourceRegistry::load(config.registry_path()).await?;
            let storage = build_storage(&config)?;
            let pipeline = Arc::new(SyncPipeline::new(config, registry, storage));
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler was not built");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            let root = SyncConfig::from_env().workspace_root;
            println!("{}", report_recent_runs_markdown(runs, Some(root))?);
        }
    }

    Ok(())
}

fn purge_label(status: &PurgeStatus) -> &'static str {
    match status {
        PurgeStatus::NotScheduled => "not-scheduled",
        PurgeStatus::Completed(_) => "completed",
        PurgeStatus::Failed { .. } => "failed",
    }
}
