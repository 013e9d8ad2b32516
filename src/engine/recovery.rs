//! Startup reconciliation between the job store and the worker pool.
//!
//! Runs after the registry's runtime state has been reset. Jobs stuck in
//! `processing` never reached the external service (or we cannot know that
//! they did), so they are failed and refunded. Jobs in `generating` are live
//! upstream; their workers' load counters are rebuilt from them so capacity
//! accounting matches reality and the scanner keeps watching them.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{error, info, warn};

use super::{EngineShared, FailOutcome};
use crate::error::Error;
use crate::jobs::JobStatus;

pub(crate) const INTERRUPTED_REASON: &str = "interrupted before submission was confirmed";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// `processing` jobs failed and refunded.
    pub failed_processing: usize,
    /// `generating` jobs whose worker load was restored.
    pub resumed_generating: usize,
    /// `generating` jobs assigned to a worker that no longer exists.
    pub orphaned_generating: usize,
}

pub(crate) async fn recover(shared: &EngineShared) -> Result<RecoveryReport, Error> {
    let mut report = RecoveryReport::default();

    for job in shared.store.list_by_status(JobStatus::Processing).await? {
        match shared
            .finalizer
            .fail_job_in_status(job.id, JobStatus::Processing, INTERRUPTED_REASON)
            .await
        {
            Ok(FailOutcome::Failed { .. }) => report.failed_processing += 1,
            Ok(_) => {}
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to fail interrupted job"),
        }
    }

    let mut per_worker: HashMap<String, u32> = HashMap::new();
    for job in shared.store.list_by_status(JobStatus::Generating).await? {
        match job.assigned_worker {
            Some(worker_id) => *per_worker.entry(worker_id).or_default() += 1,
            None => report.orphaned_generating += 1,
        }
    }

    for (worker_id, count) in per_worker {
        if shared.registry.get(&worker_id).await.is_some() {
            shared.registry.seed_load(&worker_id, count).await;
            report.resumed_generating += count as usize;
        } else {
            // The reaper fails these once the generation timeout passes.
            warn!(worker_id = %worker_id, jobs = count, "Generating jobs on an unknown worker");
            report.orphaned_generating += count as usize;
        }
    }

    info!(
        failed_processing = report.failed_processing,
        resumed_generating = report.resumed_generating,
        orphaned_generating = report.orphaned_generating,
        "Recovery complete"
    );
    Ok(report)
}
