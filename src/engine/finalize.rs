//! Terminal transitions: the single choke point for completing and
//! failing jobs.
//!
//! Every component that finalizes a job (submission task, scanner, reaper,
//! recovery, admin) goes through [`Finalizer`]. Each transition is a
//! compare-and-set on the stored status; only the caller that wins the CAS
//! releases the worker slot and, for failures, issues the refund. That is
//! what makes completion idempotent and refunds at-most-once no matter how
//! many components observe the same outcome.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, JobError};
use crate::jobs::{Job, JobStatus, JobUpdate};
use crate::store::{JobStore, Ledger};
use crate::workers::WorkerRegistry;

/// Re-read/CAS rounds before a transition gives up under contention.
const MAX_CAS_ATTEMPTS: u32 = 5;

/// Result of [`Finalizer::fail_job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailOutcome {
    /// This call failed the job. `refunded` is false only when the ledger
    /// kept erroring after every retry, or the job cost nothing.
    Failed { refunded: bool },
    /// Someone else already failed it; nothing was done.
    AlreadyFailed,
    /// The job completed first; nothing was done.
    AlreadyCompleted,
    /// The job left the expected status before it could be failed.
    Skipped { status: JobStatus },
}

/// Result of [`Finalizer::complete_job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompleteOutcome {
    Completed,
    AlreadyCompleted,
    AlreadyFailed,
    /// Still pending; a result cannot belong to an unclaimed job.
    NotStarted,
}

pub struct Finalizer {
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn Ledger>,
    registry: Arc<WorkerRegistry>,
    wake: Arc<Notify>,
    refund_attempts: u32,
}

impl Finalizer {
    pub fn new(
        store: Arc<dyn JobStore>,
        ledger: Arc<dyn Ledger>,
        registry: Arc<WorkerRegistry>,
        wake: Arc<Notify>,
        refund_attempts: u32,
    ) -> Self {
        Self {
            store,
            ledger,
            registry,
            wake,
            refund_attempts: refund_attempts.max(1),
        }
    }

    /// Fail a job from whatever non-terminal status it is in, refunding its
    /// cost on the first transition only.
    pub async fn fail_job(&self, id: Uuid, reason: &str) -> Result<FailOutcome, Error> {
        self.fail_inner(id, reason, None).await
    }

    /// Fail a job only if it is still in `expected`. Used by time-based
    /// checks whose observation may be stale by the time they act.
    pub async fn fail_job_in_status(
        &self,
        id: Uuid,
        expected: JobStatus,
        reason: &str,
    ) -> Result<FailOutcome, Error> {
        self.fail_inner(id, reason, Some(expected)).await
    }

    async fn fail_inner(
        &self,
        id: Uuid,
        reason: &str,
        expected: Option<JobStatus>,
    ) -> Result<FailOutcome, Error> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let job = self.load(id).await?;
            match job.status {
                JobStatus::Failed => {
                    debug!(job_id = %id, "Job already failed, no-op");
                    return Ok(FailOutcome::AlreadyFailed);
                }
                JobStatus::Completed => {
                    debug!(job_id = %id, "Job already completed, not failing");
                    return Ok(FailOutcome::AlreadyCompleted);
                }
                status if expected.is_some_and(|e| e != status) => {
                    debug!(job_id = %id, status = %status, "Job moved on, not failing");
                    return Ok(FailOutcome::Skipped { status });
                }
                _ => {}
            }

            let Some(failed) = self
                .store
                .update_status(id, job.status, JobUpdate::failed(reason))
                .await?
            else {
                continue;
            };

            if job.status.holds_worker() {
                if let Some(worker_id) = &job.assigned_worker {
                    self.registry.release(worker_id).await;
                }
            }
            let refunded = self.refund(&failed).await;
            self.wake.notify_one();

            info!(
                job_id = %id,
                from = %job.status,
                worker_id = job.assigned_worker.as_deref().unwrap_or("-"),
                refunded,
                reason,
                "Job failed"
            );
            return Ok(FailOutcome::Failed { refunded });
        }

        Err(JobError::Contended {
            id,
            attempts: MAX_CAS_ATTEMPTS,
        }
        .into())
    }

    /// Complete a claimed job with its result reference. Repeated calls
    /// for the same job are no-ops and never overwrite the stored result.
    pub async fn complete_job(&self, id: Uuid, result_ref: &str) -> Result<CompleteOutcome, Error> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let job = self.load(id).await?;
            match job.status {
                JobStatus::Completed => return Ok(CompleteOutcome::AlreadyCompleted),
                JobStatus::Failed => return Ok(CompleteOutcome::AlreadyFailed),
                JobStatus::Pending => return Ok(CompleteOutcome::NotStarted),
                JobStatus::Processing | JobStatus::Generating => {}
            }

            let Some(_) = self
                .store
                .update_status(id, job.status, JobUpdate::completed(result_ref))
                .await?
            else {
                continue;
            };

            if let Some(worker_id) = &job.assigned_worker {
                self.registry.release(worker_id).await;
            }
            self.wake.notify_one();

            info!(
                job_id = %id,
                from = %job.status,
                worker_id = job.assigned_worker.as_deref().unwrap_or("-"),
                result_ref,
                "Job completed"
            );
            return Ok(CompleteOutcome::Completed);
        }

        Err(JobError::Contended {
            id,
            attempts: MAX_CAS_ATTEMPTS,
        }
        .into())
    }

    /// Record external acceptance: `processing -> generating`. Returns
    /// false if the job was finalized while the submission was in flight.
    pub async fn mark_generating(&self, id: Uuid) -> Result<bool, Error> {
        let updated = self
            .store
            .update_status(id, JobStatus::Processing, JobUpdate::generating())
            .await?;
        Ok(updated.is_some())
    }

    pub(crate) async fn load(&self, id: Uuid) -> Result<Job, Error> {
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| JobError::NotFound { id }.into())
    }

    async fn refund(&self, job: &Job) -> bool {
        if job.cost.is_zero() {
            return false;
        }
        for attempt in 1..=self.refund_attempts {
            match self.ledger.refund(&job.account_id, job.cost, job.id).await {
                Ok(receipt) => {
                    if !receipt.newly_recorded {
                        warn!(job_id = %job.id, "Refund was already on the ledger");
                    }
                    return true;
                }
                Err(e) => {
                    warn!(job_id = %job.id, attempt, error = %e, "Refund attempt failed");
                }
            }
        }
        error!(
            job_id = %job.id,
            account_id = %job.account_id,
            amount = %job.cost,
            "Refund could not be recorded; job is failed without a refund"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobRequest, NewJob};
    use crate::store::LibSqlBackend;
    use crate::workers::WorkerConfig;
    use rust_decimal_macros::dec;

    struct Fixture {
        db: Arc<LibSqlBackend>,
        registry: Arc<WorkerRegistry>,
        finalizer: Finalizer,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let registry = Arc::new(WorkerRegistry::empty(dir.path().join("workers.json")));
        registry
            .add(WorkerConfig::new("w1", "+1", 5).with_capacity(2))
            .await
            .unwrap();
        registry.mark_verified("w1", true).await;
        let finalizer = Finalizer::new(
            db.clone(),
            db.clone(),
            registry.clone(),
            Arc::new(Notify::new()),
            3,
        );
        Fixture {
            db,
            registry,
            finalizer,
            _dir: dir,
        }
    }

    async fn claimed_job(f: &Fixture) -> Job {
        let job = Job::from_new(NewJob::new("acct", JobRequest::new("p", "m")));
        f.db.create_job(&job).await.unwrap();
        f.registry.seed_load("w1", 1).await;
        f.db.update_status(job.id, JobStatus::Pending, JobUpdate::claimed("w1"))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn repeated_fail_refunds_once() {
        let f = fixture().await;
        let job = claimed_job(&f).await;

        let first = f.finalizer.fail_job(job.id, "boom").await.unwrap();
        assert_eq!(first, FailOutcome::Failed { refunded: true });
        for _ in 0..3 {
            let again = f.finalizer.fail_job(job.id, "boom again").await.unwrap();
            assert_eq!(again, FailOutcome::AlreadyFailed);
        }

        assert_eq!(f.db.refunds_for_job(job.id).await.unwrap().len(), 1);
        assert_eq!(f.db.refunded_total("acct").await.unwrap(), dec!(0.99));
        assert_eq!(f.registry.status("w1").await.unwrap().load, 0);

        let stored = f.db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.failure_reason.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn concurrent_fail_refunds_once() {
        let f = Arc::new(fixture().await);
        let job_id = claimed_job(&f).await.id;

        let mut handles = Vec::new();
        for i in 0..8 {
            let f = f.clone();
            handles.push(tokio::spawn(async move {
                f.finalizer.fail_job(job_id, &format!("racer {i}")).await
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if let Ok(FailOutcome::Failed { .. }) = handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(f.db.refunds_for_job(job_id).await.unwrap().len(), 1);
        assert_eq!(f.registry.status("w1").await.unwrap().load, 0);
    }

    #[tokio::test]
    async fn completion_is_idempotent_and_blocks_failure() {
        let f = fixture().await;
        let job = claimed_job(&f).await;
        f.finalizer.mark_generating(job.id).await.unwrap();

        assert_eq!(
            f.finalizer.complete_job(job.id, "https://cdn/1.mp4").await.unwrap(),
            CompleteOutcome::Completed
        );
        assert_eq!(
            f.finalizer.complete_job(job.id, "https://cdn/other.mp4").await.unwrap(),
            CompleteOutcome::AlreadyCompleted
        );
        assert_eq!(
            f.finalizer.fail_job(job.id, "late").await.unwrap(),
            FailOutcome::AlreadyCompleted
        );

        let stored = f.db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.result_ref.as_deref(), Some("https://cdn/1.mp4"));
        assert!(f.db.refunds_for_job(job.id).await.unwrap().is_empty());
        assert_eq!(f.registry.status("w1").await.unwrap().load, 0);
    }

    #[tokio::test]
    async fn fail_in_status_skips_moved_jobs() {
        let f = fixture().await;
        let job = claimed_job(&f).await;
        f.finalizer.mark_generating(job.id).await.unwrap();

        let outcome = f
            .finalizer
            .fail_job_in_status(job.id, JobStatus::Processing, "stale")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Skipped {
                status: JobStatus::Generating
            }
        );
        assert_eq!(f.registry.status("w1").await.unwrap().load, 1);
    }

    #[tokio::test]
    async fn pending_job_fails_without_touching_load() {
        let f = fixture().await;
        let job = Job::from_new(NewJob::new("acct", JobRequest::new("p", "m")));
        f.db.create_job(&job).await.unwrap();
        f.registry.seed_load("w1", 1).await;

        let outcome = f.finalizer.fail_job(job.id, "cancelled").await.unwrap();
        assert_eq!(outcome, FailOutcome::Failed { refunded: true });
        assert_eq!(f.registry.status("w1").await.unwrap().load, 1);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let f = fixture().await;
        let err = f.finalizer.fail_job(Uuid::new_v4(), "x").await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::NotFound { .. })));
        let err = f.finalizer.complete_job(Uuid::new_v4(), "x").await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::NotFound { .. })));
    }

    #[tokio::test]
    async fn zero_cost_job_fails_without_refund() {
        let f = fixture().await;
        let job = Job::from_new(NewJob::new("acct", JobRequest::new("p", "m")).with_cost(dec!(0)));
        f.db.create_job(&job).await.unwrap();

        let outcome = f.finalizer.fail_job(job.id, "free").await.unwrap();
        assert_eq!(outcome, FailOutcome::Failed { refunded: false });
        assert!(f.db.refunds_for_job(job.id).await.unwrap().is_empty());
    }
}
