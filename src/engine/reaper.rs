//! Stuck-job reaper: fail jobs that sat in a non-terminal stage too long.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{EngineShared, FailOutcome};
use crate::error::Error;
use crate::jobs::JobStatus;

pub(crate) async fn run(shared: Arc<EngineShared>, cancel: CancellationToken) {
    info!("Reaper loop started");
    let mut ticker = tokio::time::interval(shared.config.reaper_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = run_cycle(&shared).await {
            error!(error = %e, "Reaper cycle failed");
        }
    }
    info!("Reaper loop stopped");
}

/// Fail every `generating` job past the generation timeout and every
/// `processing` job past the submission timeout. Returns how many failed.
pub(crate) async fn run_cycle(shared: &EngineShared) -> Result<usize, Error> {
    let stages = [
        (
            JobStatus::Generating,
            shared.config.generation_timeout,
            "generation timed out",
        ),
        (
            JobStatus::Processing,
            shared.config.submission_timeout,
            "submission timed out",
        ),
    ];

    let mut reaped = 0;
    for (status, timeout, reason) in stages {
        reaped += reap_stage(shared, status, timeout, reason).await?;
    }
    if reaped > 0 {
        info!(reaped, "Reaper failed stuck jobs");
    }
    Ok(reaped)
}

async fn reap_stage(
    shared: &EngineShared,
    status: JobStatus,
    timeout: Duration,
    reason: &str,
) -> Result<usize, Error> {
    let now = Utc::now();
    let mut reaped = 0;
    for job in shared.store.list_by_status(status).await? {
        let age = job.age_in_status(now);
        if age < timeout {
            continue;
        }
        warn!(
            job_id = %job.id,
            status = %status,
            age_secs = age.as_secs(),
            worker_id = job.assigned_worker.as_deref().unwrap_or("-"),
            "Job stuck, failing"
        );
        match shared.finalizer.fail_job_in_status(job.id, status, reason).await {
            Ok(FailOutcome::Failed { .. }) => reaped += 1,
            Ok(_) => {}
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to reap job"),
        }
    }
    Ok(reaped)
}
