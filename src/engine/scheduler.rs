//! Scheduler loop: assign pending jobs to the best available worker.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{EngineShared, submission};
use crate::error::Error;
use crate::jobs::{JobStatus, JobUpdate};

/// What one scheduler cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CycleOutcome {
    pub assigned: usize,
    /// Pending jobs were left over because every worker was full.
    pub saturated: bool,
}

pub(crate) async fn run(
    shared: Arc<EngineShared>,
    cancel: CancellationToken,
    submissions: CancellationToken,
) {
    info!("Scheduler loop started");
    let mut idle_cycles: u32 = 0;

    loop {
        let busy = match run_cycle(&shared, &submissions).await {
            Ok(outcome) => outcome.assigned > 0 || outcome.saturated,
            Err(e) => {
                error!(error = %e, "Scheduler cycle failed");
                false
            }
        };
        let has_load = shared.registry.snapshot().await.iter().any(|w| w.load > 0);

        let wait = if busy || has_load {
            idle_cycles = 0;
            shared.config.busy_interval
        } else {
            idle_cycles = idle_cycles.saturating_add(1);
            idle_backoff(
                shared.config.idle_backoff_step,
                shared.config.idle_backoff_cap,
                idle_cycles,
            )
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shared.wake.notified() => {
                idle_cycles = 0;
            }
            _ = tokio::time::sleep(wait) => {}
        }
    }
    info!("Scheduler loop stopped");
}

/// Pull a batch of pending jobs and start a submission for each one that
/// finds a worker. Stops at the first job no worker can take.
pub(crate) async fn run_cycle(
    shared: &Arc<EngineShared>,
    submissions: &CancellationToken,
) -> Result<CycleOutcome, Error> {
    let pending = shared.store.list_pending(shared.config.batch_size).await?;
    let mut outcome = CycleOutcome::default();

    for job in pending {
        let Some(worker_id) = shared
            .registry
            .reserve_best(&job.request.model, &shared.config.weights)
            .await
        else {
            debug!(job_id = %job.id, "No worker available, job stays pending");
            outcome.saturated = true;
            break;
        };

        let claimed = match shared
            .store
            .update_status(job.id, JobStatus::Pending, JobUpdate::claimed(&worker_id))
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                shared.registry.release(&worker_id).await;
                return Err(e.into());
            }
        };

        let Some(claimed) = claimed else {
            // Claimed or failed by someone else since the listing.
            shared.registry.release(&worker_id).await;
            continue;
        };

        info!(job_id = %claimed.id, worker_id = %worker_id, "Job assigned");
        submission::spawn(shared.clone(), claimed, worker_id, submissions.clone());
        outcome.assigned += 1;
    }

    if outcome.assigned > 0 {
        debug!(assigned = outcome.assigned, "Scheduler cycle assigned jobs");
    }
    if outcome.saturated && outcome.assigned == 0 {
        warn!("Pending jobs waiting, no worker has free capacity");
    }
    Ok(outcome)
}

/// Wait after `idle_cycles` consecutive cycles with nothing to do.
pub(crate) fn idle_backoff(step: Duration, cap: Duration, idle_cycles: u32) -> Duration {
    step.saturating_mul(idle_cycles).min(cap)
}
