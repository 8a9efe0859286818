//! Eventlens CLI: upload a local set of photos to a campaign and manage the
//! upload history.
//!
//! State and uploaded files live under EVENTLENS_STATE_DIR and EVENTLENS_UPLOAD_DIR.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::watch;
use uuid::Uuid;

use eventlens_cli::{build_pipeline, render_batch, BatchSummary, Pipeline};
use eventlens_core::models::{NewUploadItem, UploadBatch, UploadStatus};
use eventlens_core::{AppError, PipelineConfig};
use eventlens_infra::{init_telemetry, shutdown_telemetry};
use eventlens_worker::{LocalBackgroundWorker, UnavailableRegistrar};

#[derive(Parser)]
#[command(name = "eventlens", about = "Resilient photo upload pipeline")]
struct Cli {
    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload files to a campaign and wait until every item has settled
    Upload {
        /// Target campaign id
        #[arg(long)]
        campaign: String,
        /// Run the background execution context for periodic retries
        #[arg(long)]
        background: bool,
        /// Files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// List batches, most recent first
    List,
    /// Show one batch and its items
    Show {
        /// Batch UUID
        batch: Uuid,
    },
    /// Retry the failed items of a batch
    Retry {
        /// Batch UUID
        batch: Uuid,
        /// Also retry items that exhausted their attempts or failed permanently
        #[arg(long)]
        all: bool,
    },
    /// Remove completed batches from history
    Clear,
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("Serialize output")?;
    println!("{}", out);
    Ok(())
}

fn print_batch(batch: &UploadBatch, json: bool) -> anyhow::Result<()> {
    if json {
        print_json(batch)
    } else {
        print!("{}", render_batch(batch));
        Ok(())
    }
}

/// Start background registration and automatic retries, then resume anything
/// left pending by an earlier run.
async fn start_workers(pipeline: &Pipeline, config: &PipelineConfig, background: bool) {
    if background {
        // A terminal session has no connectivity source; the worker only wakes periodically
        let (_, connectivity) = watch::channel(true);
        let worker = LocalBackgroundWorker::new(connectivity, config.background_sync_interval());
        pipeline.bridge.start(&worker).await;
    } else {
        pipeline.bridge.start(&UnavailableRegistrar).await;
    }
    pipeline.orchestrator.spawn_auto_retry();
    pipeline.orchestrator.resume_pending().await;
}

fn exit_status(batch: &UploadBatch) -> anyhow::Result<()> {
    let failed = batch.count_with_status(UploadStatus::Failed);
    if failed > 0 {
        anyhow::bail!(
            "{} of {} uploads failed; run `eventlens retry {}` to try again",
            failed,
            batch.items.len(),
            batch.id
        );
    }
    Ok(())
}

async fn run(cli: Cli, config: PipelineConfig) -> anyhow::Result<()> {
    let pipeline = build_pipeline(&config).await?;

    match cli.command {
        Commands::Upload {
            campaign,
            background,
            files,
        } => {
            start_workers(&pipeline, &config, background).await;
            let items = files
                .iter()
                .map(|file| NewUploadItem::new(file.to_string_lossy(), campaign.as_str()))
                .collect();
            let batch_id = pipeline
                .orchestrator
                .submit(items)
                .await
                .context("Failed to create upload batch")?;
            tracing::info!(batch_id = %batch_id, "Waiting for uploads to settle");

            let batch = pipeline.orchestrator.wait_until_settled(batch_id).await?;
            print_batch(&batch, cli.json)?;
            exit_status(&batch)?;
        }
        Commands::List => {
            let summaries: Vec<BatchSummary> = pipeline
                .store
                .get_all_batches()
                .iter()
                .map(BatchSummary::from)
                .collect();
            if cli.json {
                print_json(&summaries)?;
            } else {
                for s in &summaries {
                    println!(
                        "{}  {}  {:<16} {}/{} completed, {} failed",
                        s.id,
                        s.created_at,
                        s.status.to_string(),
                        s.completed,
                        s.total,
                        s.failed
                    );
                }
            }
        }
        Commands::Show { batch } => {
            let batch = pipeline.store.get_batch(batch)?;
            print_batch(&batch, cli.json)?;
        }
        Commands::Retry { batch, all } => {
            start_workers(&pipeline, &config, false).await;
            let result = if all {
                pipeline.orchestrator.retry_exhausted_uploads(batch).await
            } else {
                pipeline.orchestrator.retry_failed_uploads(batch).await
            };
            match result {
                Ok(requeued) => println!("Retrying {} item(s)", requeued),
                Err(e @ AppError::NoEligibleItems { .. }) => {
                    println!("{}", e);
                    if !all {
                        println!("Use --all to retry items that exhausted their attempts");
                    }
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }

            let batch = pipeline.orchestrator.wait_until_settled(batch).await?;
            print_batch(&batch, cli.json)?;
            exit_status(&batch)?;
        }
        Commands::Clear => {
            let removed = pipeline.store.clear_history().await?;
            println!("Removed {} completed batch(es)", removed);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = PipelineConfig::from_env().context("Invalid configuration")?;

    if let Err(e) = init_telemetry() {
        eprintln!("Failed to initialize telemetry: {}", e);
    }
    tracing::debug!(
        environment = %config.environment,
        production = config.is_production(),
        state_dir = %config.state_dir.display(),
        "Configuration loaded"
    );

    let result = run(cli, config).await;
    shutdown_telemetry().await;
    result
}
