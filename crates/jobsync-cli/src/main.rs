mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use jobsync_sync::{bigquery_warehouse, build_scheduler, ConfigFile, Pipeline, PipelineConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "jobsync")]
#[command(about = "Daily incremental loader for job postings")]
struct Cli {
    /// YAML file overriding the search query and destination table.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once.
    Run,
    /// Run on the configured cron schedule until interrupted.
    Schedule,
    /// List warehouse datasets to verify credentials.
    CheckConnection,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = PipelineConfig::from_env()?;
    if let Some(path) = &cli.config {
        config.apply_file(&ConfigFile::read(path)?)?;
    }
    let _log = logging::init_logging(&config.log_file)?;

    let warehouse = Arc::new(bigquery_warehouse(&config)?);
    let schedule = config.schedule.clone();
    let pipeline = Pipeline::new(config, warehouse)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = pipeline.run_once().await?;
            println!(
                "run complete: run_id={} extracted={} existing={} new={} loaded={}",
                summary.run_id,
                summary.extracted,
                summary.existing,
                summary.reconciled,
                summary.load.rows()
            );
            if !summary.is_success() {
                bail!("run {} failed to load its batch", summary.run_id);
            }
        }
        Commands::Schedule => {
            let mut sched = build_scheduler(Arc::new(pipeline), &schedule).await?;
            sched.start().await.context("starting scheduler")?;
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            info!("shutdown requested; stopping scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::CheckConnection => {
            let datasets = pipeline.check_connection().await?;
            println!("{} dataset(s): {}", datasets.len(), datasets.join(", "));
        }
    }

    Ok(())
}
