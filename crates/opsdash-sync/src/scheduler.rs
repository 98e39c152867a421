use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use opsdash_core::ProcessingRun;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

use crate::{AppConfig, Dashboard, DashboardError};

/// Cron job that processes today's snapshot; `None` when disabled.
pub async fn maybe_build_scheduler(
    dashboard: Arc<Dashboard>,
    config: &AppConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.process_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let dashboard = dashboard.clone();
        Box::pin(async move {
            run_scheduled(&dashboard, Utc::now().date_naive()).await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron, "processing scheduler configured");
    Ok(Some(sched))
}

/// One scheduled tick. Busy dates and days without a snapshot are skipped.
pub async fn run_scheduled(dashboard: &Dashboard, date: NaiveDate) -> Option<ProcessingRun> {
    match dashboard.process_date(&date.to_string()).await {
        Ok(run) => Some(run),
        Err(DashboardError::Busy { date }) => {
            info!(%date, "processing already running; skipping scheduled tick");
            None
        }
        Err(DashboardError::NotFound { date }) => {
            debug!(%date, "no snapshot to process");
            None
        }
        Err(err) => {
            warn!(error = %err, "scheduled processing failed");
            None
        }
    }
}
