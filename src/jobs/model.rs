//! Job data model and status state machine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;

/// Default price of one generation job.
pub const DEFAULT_JOB_COST: Decimal = dec!(0.99);

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker; submission not yet confirmed.
    Processing,
    /// Accepted by the external service, generation under way.
    Generating,
    /// Finished with a result reference.
    Completed,
    /// Failed; the cost has been refunded.
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Generating,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Processing) | (Pending, Failed) |
            // From Processing (a stale artifact may complete it before submission confirms)
            (Processing, Generating) | (Processing, Completed) | (Processing, Failed) |
            // From Generating
            (Generating, Completed) | (Generating, Failed)
        )
    }

    /// Terminal jobs are never reopened.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a job in this status occupies a worker slot.
    pub fn holds_worker(&self) -> bool {
        matches!(self, Self::Processing | Self::Generating)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "generating" => Ok(Self::Generating),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Generation progress as reported by the external service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Progress {
    /// Accepted but still waiting in the upstream queue.
    Queued,
    /// Percentage complete, 0–100.
    Percent(u8),
}

impl Progress {
    /// Sentinel used for `Queued` in storage.
    const QUEUED_SENTINEL: i64 = -1;

    pub fn percent(value: u8) -> Self {
        Self::Percent(value.min(100))
    }

    pub fn to_db(self) -> i64 {
        match self {
            Self::Queued => Self::QUEUED_SENTINEL,
            Self::Percent(p) => i64::from(p),
        }
    }

    pub fn from_db(value: i64) -> Self {
        if value < 0 {
            Self::Queued
        } else {
            Self::Percent(value.min(100) as u8)
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::Percent(0)
    }
}

/// Immutable generation request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Prompt text.
    pub prompt: String,
    /// External model selector.
    pub model: String,
    /// Optional reference media (first/last frame images).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reference_media: Vec<String>,
    /// Requested resolution, e.g. "1080P".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    /// Requested clip length in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u32>,
}

impl JobRequest {
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            reference_media: Vec::new(),
            resolution: None,
            duration_secs: None,
        }
    }
}

/// A job as submitted by the API layer, before it has an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    /// Account billed for the job (refunds go back here).
    pub account_id: String,
    #[serde(flatten)]
    pub request: JobRequest,
    /// Amount charged; refunded on failure.
    #[serde(default = "default_cost")]
    pub cost: Decimal,
}

fn default_cost() -> Decimal {
    DEFAULT_JOB_COST
}

impl NewJob {
    pub fn new(account_id: impl Into<String>, request: JobRequest) -> Self {
        Self {
            account_id: account_id.into(),
            request,
            cost: DEFAULT_JOB_COST,
        }
    }

    pub fn with_cost(mut self, cost: Decimal) -> Self {
        self.cost = cost;
        self
    }

    pub fn validate(&self) -> Result<(), JobError> {
        if self.account_id.trim().is_empty() {
            return Err(JobError::InvalidRequest("account_id is required".into()));
        }
        if self.request.prompt.trim().is_empty() {
            return Err(JobError::InvalidRequest("prompt must not be empty".into()));
        }
        if self.request.model.trim().is_empty() {
            return Err(JobError::InvalidRequest("model must not be empty".into()));
        }
        if self.cost.is_sign_negative() {
            return Err(JobError::InvalidRequest("cost must not be negative".into()));
        }
        Ok(())
    }
}

/// One unit of requested generation work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub account_id: String,
    pub request: JobRequest,
    pub cost: Decimal,
    pub status: JobStatus,
    pub progress: Progress,
    /// Set only once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    /// Set while processing/generating, cleared on terminal outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh pending job from a request.
    pub fn from_new(new_job: NewJob) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id: new_job.account_id,
            request: new_job.request,
            cost: new_job.cost,
            status: JobStatus::Pending,
            progress: Progress::default(),
            result_ref: None,
            assigned_worker: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Time since the last status transition.
    pub fn age_in_status(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.updated_at).to_std().unwrap_or_default()
    }
}

/// A status transition applied by [`crate::store::JobStore::update_status`].
///
/// `None` fields keep their stored value. The assigned worker is cleared by
/// the store whenever `status` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub progress: Option<Progress>,
    pub result_ref: Option<String>,
    pub assigned_worker: Option<String>,
    pub failure_reason: Option<String>,
}

impl JobUpdate {
    pub fn claimed(worker_id: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Processing,
            progress: None,
            result_ref: None,
            assigned_worker: Some(worker_id.into()),
            failure_reason: None,
        }
    }

    pub fn generating() -> Self {
        Self {
            status: JobStatus::Generating,
            progress: Some(Progress::Queued),
            result_ref: None,
            assigned_worker: None,
            failure_reason: None,
        }
    }

    pub fn completed(result_ref: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Completed,
            progress: Some(Progress::Percent(100)),
            result_ref: Some(result_ref.into()),
            assigned_worker: None,
            failure_reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            progress: None,
            result_ref: None,
            assigned_worker: None,
            failure_reason: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_valid() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Generating));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Generating.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Generating.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn terminal_jobs_never_reopen() {
        for target in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Generating,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert!(!JobStatus::Completed.can_transition_to(target));
            assert!(!JobStatus::Failed.can_transition_to(target));
        }
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Generating,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("stuck".parse::<JobStatus>().is_err());
    }

    #[test]
    fn progress_sentinel() {
        assert_eq!(Progress::Queued.to_db(), -1);
        assert_eq!(Progress::from_db(-1), Progress::Queued);
        assert_eq!(Progress::from_db(42), Progress::Percent(42));
        assert_eq!(Progress::from_db(250), Progress::Percent(100));
        assert_eq!(Progress::percent(180), Progress::Percent(100));
    }

    #[test]
    fn new_job_validation() {
        let ok = NewJob::new("acct", JobRequest::new("a cat surfing", "hailuo_2_3"));
        assert!(ok.validate().is_ok());
        assert_eq!(ok.cost, DEFAULT_JOB_COST);

        let empty_prompt = NewJob::new("acct", JobRequest::new("  ", "hailuo_2_3"));
        assert!(matches!(
            empty_prompt.validate(),
            Err(JobError::InvalidRequest(_))
        ));

        let negative = NewJob::new("acct", JobRequest::new("p", "m")).with_cost(dec!(-1));
        assert!(negative.validate().is_err());
    }

    #[test]
    fn new_job_deserializes_flat_request() {
        let json = r#"{"account_id":"a1","prompt":"sunset","model":"hailuo_2_0","duration_secs":6}"#;
        let new_job: NewJob = serde_json::from_str(json).unwrap();
        assert_eq!(new_job.request.prompt, "sunset");
        assert_eq!(new_job.request.duration_secs, Some(6));
        assert_eq!(new_job.cost, DEFAULT_JOB_COST);
    }

    #[test]
    fn from_new_starts_pending() {
        let job = Job::from_new(NewJob::new("a", JobRequest::new("p", "m")));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, Progress::Percent(0));
        assert!(job.assigned_worker.is_none());
    }
}
