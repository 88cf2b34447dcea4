//! Cron trigger for the daily run, with a single delayed retry on failure.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::ScheduleConfig;
use crate::{Pipeline, RunSummary};

/// Registers the daily job. Missed triggers are not caught up, and a trigger
/// that fires while a run is still going is skipped.
pub async fn build_scheduler(
    pipeline: Arc<Pipeline>,
    schedule: &ScheduleConfig,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let running = Arc::new(Mutex::new(()));
    let retries = schedule.retries;
    let delay = schedule.retry_delay;

    let job = Job::new_async(&schedule.cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let running = Arc::clone(&running);
        Box::pin(async move {
            run_guarded(&running, &pipeline, retries, delay).await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", schedule.cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron = %schedule.cron, retries, "scheduled daily run");
    Ok(sched)
}

/// One scheduled trigger. Returns `None` without touching the pipeline when
/// another run holds `running`, or when the run ultimately failed.
pub async fn run_guarded(
    running: &Mutex<()>,
    pipeline: &Pipeline,
    retries: usize,
    delay: Duration,
) -> Option<RunSummary> {
    let Ok(_guard) = running.try_lock() else {
        warn!("previous run still in progress; skipping this trigger");
        return None;
    };
    match run_with_retries(pipeline, retries, delay).await {
        Ok(summary) => {
            info!(
                run_id = %summary.run_id,
                rows = summary.load.rows(),
                "scheduled run finished"
            );
            Some(summary)
        }
        Err(err) => {
            error!(error = %err, "scheduled run failed");
            None
        }
    }
}

/// Runs the pipeline, then up to `retries` more times after `delay` if the run
/// errored or its load failed.
pub async fn run_with_retries(
    pipeline: &Pipeline,
    retries: usize,
    delay: Duration,
) -> Result<RunSummary> {
    let mut attempt = 0;
    loop {
        let err = match pipeline.run_once().await {
            Ok(summary) if summary.is_success() => return Ok(summary),
            Ok(summary) => anyhow!("run {} finished with a failed load", summary.run_id),
            Err(err) => err,
        };
        if attempt >= retries {
            return Err(err);
        }
        attempt += 1;
        warn!(
            error = %err,
            attempt,
            delay_secs = delay.as_secs(),
            "run failed; retrying after delay"
        );
        tokio::time::sleep(delay).await;
    }
}
