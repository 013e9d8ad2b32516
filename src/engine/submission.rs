//! Submission tasks: hand one claimed job to its worker's session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::EngineShared;
use crate::driver::{Submission, with_timeout};
use crate::error::DriverError;
use crate::jobs::{Job, JobStatus};

/// One async mutex per worker. Submissions to a worker are serialized; the
/// scanner and health check skip a worker whose lock is held.
#[derive(Default)]
pub struct SubmissionLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SubmissionLocks {
    async fn handle(&self, worker_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(worker_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive use of the worker.
    pub async fn lock(&self, worker_id: &str) -> OwnedMutexGuard<()> {
        self.handle(worker_id).await.lock_owned().await
    }

    /// Exclusive use of the worker if nobody holds it.
    pub async fn try_lock(&self, worker_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.handle(worker_id).await.try_lock_owned().ok()
    }

    /// Forget every lock. Tasks still holding an old guard keep it.
    pub async fn reset(&self) {
        self.locks.lock().await.clear();
    }
}

/// Why a submission gave up.
#[derive(Debug)]
enum SubmitFailure {
    /// The job left `processing` under us; somebody else owns it now.
    Superseded,
    Driver(DriverError),
}

/// Spawn the submission for a job the scheduler just claimed. The worker
/// slot is already reserved and stays reserved until the job is finalized.
pub(crate) fn spawn(shared: Arc<EngineShared>, job: Job, worker_id: String, cancel: CancellationToken) {
    let tracker = shared.submissions.clone();
    tracker.spawn(async move {
        let job_id = job.id;
        tokio::select! {
            _ = cancel.cancelled() => {
                // The reaper or the next recovery fails the job.
                warn!(job_id = %job_id, worker_id = %worker_id, "Submission abandoned");
            }
            _ = submit(&shared, &job, &worker_id) => {}
        }
    });
}

async fn submit(shared: &EngineShared, job: &Job, worker_id: &str) {
    let _guard = shared.locks.lock(worker_id).await;
    let submission = Submission::for_job(job);

    match submit_with_retries(shared, &submission, worker_id).await {
        Ok(()) => match shared.finalizer.mark_generating(job.id).await {
            Ok(true) => info!(job_id = %job.id, worker_id, "Job submitted, generating"),
            Ok(false) => debug!(job_id = %job.id, "Job moved on before it was marked generating"),
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to mark job generating"),
        },
        Err(SubmitFailure::Superseded) => {
            debug!(job_id = %job.id, "Job no longer processing, submission dropped");
        }
        Err(SubmitFailure::Driver(e)) => {
            let reason = format!("submission failed: {e}");
            if let Err(e) = shared.finalizer.fail_job(job.id, &reason).await {
                error!(job_id = %job.id, error = %e, "Failed to fail job after submission error");
            }
        }
    }
}

async fn submit_with_retries(
    shared: &EngineShared,
    submission: &Submission,
    worker_id: &str,
) -> Result<(), SubmitFailure> {
    let attempts = shared.config.submit_attempts.max(1);
    let mut attempt = 1;
    loop {
        match shared.finalizer.load(submission.job_id).await {
            Ok(job) if job.status == JobStatus::Processing => {}
            Ok(_) => return Err(SubmitFailure::Superseded),
            Err(e) => warn!(job_id = %submission.job_id, error = %e, "Could not re-read job before submit"),
        }

        let result = with_timeout(
            "submit_job",
            shared.config.submit_timeout,
            shared.driver.submit_job(worker_id, submission),
        )
        .await;

        let err = match result {
            Ok(receipt) => {
                debug!(
                    job_id = %submission.job_id,
                    worker_id,
                    attempt,
                    external_ref = ?receipt.external_ref,
                    "Submission accepted"
                );
                return Ok(());
            }
            Err(e) => e,
        };

        if err.is_session_invalid() {
            warn!(worker_id, error = %err, "Session invalid during submit, marking worker unverified");
            shared.registry.mark_verified(worker_id, false).await;
            return Err(SubmitFailure::Driver(err));
        }
        if !err.is_retryable() || attempt >= attempts {
            warn!(job_id = %submission.job_id, worker_id, attempt, error = %err, "Submission failed");
            return Err(SubmitFailure::Driver(err));
        }

        let delay = retry_delay(shared.config.submit_backoff, attempt);
        warn!(
            job_id = %submission.job_id,
            worker_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Submission failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Linear backoff with up to 20% jitter on top.
fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let delay = base.saturating_mul(attempt);
    let max_jitter = delay.as_millis() as u64 / 5;
    if max_jitter == 0 {
        return delay;
    }
    let jitter = rand::thread_rng().gen_range(0..=max_jitter);
    delay + Duration::from_millis(jitter)
}
