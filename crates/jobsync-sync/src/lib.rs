//! Daily incremental load: extract, snapshot existing ids, reconcile, append.

pub mod config;
pub mod keys;
pub mod loader;
pub mod reconcile;
pub mod scheduler;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobsync_core::{JobPosting, PipelineError, RecordId};
use jobsync_storage::{
    BackoffPolicy, BigQueryConfig, BigQueryWarehouse, HttpClientConfig, HttpFetcher, TokenSource,
    Warehouse,
};
use serde::Serialize;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{ConfigFile, PipelineConfig, ScheduleConfig};
pub use keys::{fetch_destination_schema, fetch_existing_ids};
pub use loader::{load, project, LoadOutcome, ProjectedBatch};
pub use reconcile::{reconcile, repeated_ids};
pub use scheduler::{build_scheduler, run_guarded, run_with_retries};

pub const CRATE_NAME: &str = "jobsync-sync";

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub extracted: usize,
    pub existing: usize,
    pub reconciled: usize,
    /// New ids that occurred more than once in the batch; all copies were loaded.
    pub repeated_ids: Vec<RecordId>,
    pub load: LoadOutcome,
    pub report_dir: Option<String>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        !matches!(self.load, LoadOutcome::Failed { .. })
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    http: HttpFetcher,
    warehouse: Arc<dyn Warehouse>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, warehouse: Arc<dyn Warehouse>) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: config.http_max_retries,
                ..Default::default()
            },
        })?;
        Ok(Self {
            config,
            http,
            warehouse,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// One full pass. Only warehouse query failures abort the run; a failed
    /// load is reported through [`RunSummary::is_success`].
    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        self.run(run_id)
            .instrument(info_span!("run", %run_id))
            .await
    }

    async fn run(&self, run_id: Uuid) -> Result<RunSummary> {
        let started_at = Utc::now();
        info!(table = %self.config.table, "data extraction process started");

        let batch =
            jobsync_adapters::extract(&self.http, run_id, &self.config.search_request()).await;

        let existing = fetch_existing_ids(
            self.warehouse.as_ref(),
            &self.config.table,
            &self.config.id_column,
        )
        .await?;

        let fresh = reconcile(Some(batch.as_slice()), &existing);
        let repeated = repeated_ids(&fresh);
        if !repeated.is_empty() {
            warn!(
                repeated = ?repeated,
                "new records share an id within this batch; every copy will be loaded"
            );
        }
        info!(
            extracted = batch.len(),
            existing = existing.len(),
            new = fresh.len(),
            "reconciled batch against existing records"
        );

        let outcome = load(self.warehouse.as_ref(), &self.config.table, &fresh).await?;
        let finished_at = Utc::now();

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at,
            extracted: batch.len(),
            existing: existing.len(),
            reconciled: fresh.len(),
            repeated_ids: repeated,
            load: outcome,
            report_dir: None,
        };

        if let Some(root) = &self.config.reports_dir {
            match write_reports(root, &summary, &fresh).await {
                Ok(dir) => summary.report_dir = Some(dir.display().to_string()),
                Err(err) => warn!(error = %err, "failed to write run reports"),
            }
        }

        if summary.is_success() {
            info!(rows = summary.load.rows(), "data extraction process completed");
        } else {
            error!("data extraction process finished with a failed load");
        }
        Ok(summary)
    }

    pub async fn check_connection(&self) -> Result<Vec<String>, PipelineError> {
        check_connection(self.warehouse.as_ref(), &self.config.table.project_id).await
    }
}

/// Lists the datasets of `project_id` as a credentials and connectivity probe.
pub async fn check_connection(
    warehouse: &dyn Warehouse,
    project_id: &str,
) -> Result<Vec<String>, PipelineError> {
    match warehouse.list_datasets(project_id).await {
        Ok(datasets) if datasets.is_empty() => {
            warn!(project_id, "connected, but the project has no datasets");
            Ok(datasets)
        }
        Ok(datasets) => {
            info!(project_id, datasets = datasets.len(), "successfully connected to warehouse");
            Ok(datasets)
        }
        Err(err) => {
            error!(project_id, error = %err, "failed to connect to warehouse");
            Err(PipelineError::QueryFailure(err.to_string()))
        }
    }
}

async fn write_reports(
    root: &Path,
    summary: &RunSummary,
    fresh: &[JobPosting],
) -> Result<PathBuf> {
    let reports_dir = root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let summary_json =
        serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), summary_json)
        .await
        .context("writing run_summary.json")?;

    let rows: Vec<_> = fresh.iter().map(|posting| &posting.fields).collect();
    let records_json = serde_json::to_vec_pretty(&rows).context("serializing new records")?;
    fs::write(reports_dir.join("new_records.json"), records_json)
        .await
        .context("writing new_records.json")?;

    Ok(reports_dir)
}

/// Production warehouse for `config`'s destination project.
pub fn bigquery_warehouse(config: &PipelineConfig) -> Result<BigQueryWarehouse> {
    let mut bq = BigQueryConfig::new(config.table.project_id.clone());
    bq.location = config.warehouse_location.clone();
    BigQueryWarehouse::new(bq, TokenSource::from_env()).context("building warehouse client")
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    let config = PipelineConfig::from_env()?;
    let warehouse = Arc::new(bigquery_warehouse(&config)?);
    Pipeline::new(config, warehouse)?.run_once().await
}
