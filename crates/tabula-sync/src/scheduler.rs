use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::SyncConfig;
use crate::orchestrator::Pipeline;

/// Cron-driven runs, when enabled. The caller starts the returned scheduler.
pub async fn maybe_build_scheduler(
    pipeline: Arc<Pipeline>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            info!("scheduled pipeline run triggered");
            match pipeline.run_once().await {
                Ok(run) => info!(run_id = %run.id, status = %run.status, "scheduled run finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled run could not be recorded"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
