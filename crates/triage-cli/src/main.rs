use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use triage_core::CursorPosition;
use triage_storage::{CursorStore, PgStore, RunLedger};
use triage_sync::{
    build_cron_scheduler, import_file, orchestrator_from_config, report_runs_markdown,
    IngestConfig, IngestScheduler, IngestionOrchestrator, RunOutcome,
};
use triage_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "triage-cli")]
#[command(about = "Sales triage ingestion command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass, or keep polling with --watch
    Sync {
        #[arg(long)]
        watch: bool,
    },
    /// Serve the JSON API
    Serve {
        /// Also run the ingestion scheduler in this process
        #[arg(long)]
        scheduler: bool,
    },
    /// Import sales from a JSON, envelope or NDJSON file
    Import {
        file: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
    /// Show recent ingestion runs
    Runs {
        #[arg(short, long, default_value = "10")]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Show or overwrite the ingestion cursor
    Cursor {
        #[arg(long, value_name = "VALUE")]
        set: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("triage=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { watch: false }) {
        Commands::Sync { watch: false } => {
            let (_store, orchestrator) = orchestrator_from_config(&config).await?;
            print_outcome(&orchestrator.run_once().await)?;
        }
        Commands::Sync { watch: true } => {
            let (_store, orchestrator) = orchestrator_from_config(&config).await?;
            run_scheduler_until_ctrl_c(&config, Arc::new(orchestrator)).await?;
        }
        Commands::Serve { scheduler } => {
            let (store, orchestrator) = orchestrator_from_config(&config).await?;
            let orchestrator = Arc::new(orchestrator);
            let state = AppState::new(store, config.cursor_key.clone())
                .with_orchestrator(orchestrator.clone());
            let port = triage_web::port_from_env();
            if scheduler {
                let api = triage_web::serve(state, port);
                let ingest = run_scheduler_until_ctrl_c(&config, orchestrator);
                tokio::select! {
                    result = api => result?,
                    result = ingest => result?,
                }
            } else {
                triage_web::serve(state, port).await?;
            }
        }
        Commands::Import { file, dry_run } => {
            let store = PgStore::connect(&config.database_url).await?;
            let summary = import_file(&store, &file, dry_run)
                .await
                .with_context(|| format!("importing {}", file.display()))?;
            println!(
                "import {}: tag={} documents={} processed={} inserted={} updated={} rejected={}",
                if summary.dry_run { "dry run" } else { "complete" },
                summary.sync_tag,
                summary.documents,
                summary.processed,
                summary.inserted,
                summary.updated,
                summary.rejected
            );
        }
        Commands::Runs { limit, json } => {
            let store = PgStore::connect(&config.database_url).await?;
            let runs = store.recent_runs(limit.max(1)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else {
                println!("{}", report_runs_markdown(&runs));
            }
        }
        Commands::Cursor { set } => {
            let store = PgStore::connect(&config.database_url).await?;
            if let Some(value) = set {
                if CursorPosition::decode(&value).is_none() {
                    bail!("cursor value must name an external id");
                }
                store.set(&config.cursor_key, &value).await?;
                info!(key = %config.cursor_key, "cursor overwritten");
            }
            match store.get(&config.cursor_key).await? {
                Some(value) => println!("{} = {}", config.cursor_key, value),
                None => println!("{} is not set", config.cursor_key),
            }
        }
    }

    Ok(())
}

fn print_outcome(outcome: &RunOutcome) -> Result<()> {
    match outcome {
        RunOutcome::Completed(summary) => {
            println!(
                "sync complete: run_id={} processed={} inserted={} updated={} rejected={} cursor={}",
                summary.run_id,
                summary.counts.processed,
                summary.counts.inserted,
                summary.counts.updated,
                summary.counts.rejected,
                summary.cursor.as_deref().unwrap_or("unchanged")
            );
            Ok(())
        }
        RunOutcome::Skipped => {
            println!("sync skipped: another run is in progress");
            Ok(())
        }
        RunOutcome::Failed { run_id, message } => match run_id {
            Some(run_id) => bail!("sync failed: run_id={run_id}: {message}"),
            None => bail!("sync failed: {message}"),
        },
    }
}

async fn run_scheduler_until_ctrl_c(
    config: &IngestConfig,
    orchestrator: Arc<IngestionOrchestrator>,
) -> Result<()> {
    match &config.sync_cron {
        Some(cron) => {
            let mut sched = build_cron_scheduler(orchestrator.clone(), cron).await?;
            sched.start().await.context("starting cron scheduler")?;
            info!(%cron, "cron-driven ingestion started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            orchestrator.begin_shutdown();
            sched.shutdown().await.context("stopping cron scheduler")?;
            orchestrator.wait_idle().await;
        }
        None => {
            let scheduler = IngestScheduler::new(orchestrator, config.poll_interval());
            scheduler.start().await;
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.stop().await;
        }
    }
    Ok(())
}
