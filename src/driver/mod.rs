//! Session driver: the boundary to the external generation service.
//!
//! A driver owns one authenticated session per worker and exposes the five
//! calls the engine needs. Page mechanics live behind the trait; the engine
//! only sees the retry/timeout contract and the raw scan observations.

pub mod http;
pub mod simulated;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DriverError;
use crate::jobs::{Job, JobRequest, Progress, TrackingToken};
use crate::workers::WorkerConfig;

pub use http::HttpDriver;
pub use simulated::SimulatedDriver;

/// Result of a live session check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// The external service confirmed an authenticated session.
    Authenticated,
    /// Credentials expired; an operator must re-authenticate the account.
    NeedsAuthentication,
}

/// What gets typed into the external service for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub job_id: Uuid,
    /// Prompt with the tracking token appended.
    pub prompt: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reference_media: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u32>,
}

impl Submission {
    pub fn for_job(job: &Job) -> Self {
        let JobRequest {
            prompt,
            model,
            reference_media,
            resolution,
            duration_secs,
        } = &job.request;

        Self {
            job_id: job.id,
            prompt: TrackingToken::for_job(job.id).embed(prompt),
            model: model.clone(),
            reference_media: reference_media.clone(),
            resolution: resolution.clone(),
            duration_secs: *duration_secs,
        }
    }
}

/// Confirmation that the external service accepted a submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    /// Upstream handle, when the service exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
}

/// One rendered item observed while scanning a worker's session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanItem {
    /// Text shown next to the item (carries the tracking token).
    #[serde(default)]
    pub text: String,
    /// Item is waiting in the upstream queue.
    #[serde(default)]
    pub queued_upstream: bool,
    /// An in-progress indicator is visible.
    #[serde(default)]
    pub progress_indicator: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    /// Retrieval link of a finished artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    /// Upstream failure message, if the item failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_notice: Option<String>,
}

/// Interpretation of a [`ScanItem`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Record progress, no transition.
    Progress(Progress),
    /// Result artifact ready.
    Finished { artifact: String },
    /// The external service reports the generation failed.
    Failed { reason: String },
    /// Nothing actionable.
    Ignored,
}

impl ScanItem {
    /// First match wins: queued, in-progress, finished artifact, failure.
    pub fn classify(&self) -> Observation {
        if self.queued_upstream {
            return Observation::Progress(Progress::Queued);
        }
        if self.progress_indicator {
            return match self.percent {
                Some(p) => Observation::Progress(Progress::percent(p)),
                None => Observation::Ignored,
            };
        }
        if let Some(artifact) = self.artifact.as_ref().filter(|a| !a.is_empty()) {
            return Observation::Finished {
                artifact: artifact.clone(),
            };
        }
        if let Some(reason) = &self.failure_notice {
            return Observation::Failed {
                reason: reason.clone(),
            };
        }
        Observation::Ignored
    }

    pub fn token(&self) -> Option<TrackingToken> {
        TrackingToken::extract(&self.text)
    }
}

/// Interaction with the external service on behalf of workers.
#[async_trait]
pub trait SessionDriver: Send + Sync {
    /// Open (or re-check) the worker's session and confirm it is authenticated.
    async fn ensure_session(&self, worker: &WorkerConfig) -> Result<SessionStatus, DriverError>;

    /// Enter and submit one job. Returns once the service accepted it.
    async fn submit_job(
        &self,
        worker_id: &str,
        submission: &Submission,
    ) -> Result<SubmitReceipt, DriverError>;

    /// Read every item currently rendered in the worker's session.
    async fn scan_for_completion(&self, worker_id: &str) -> Result<Vec<ScanItem>, DriverError>;

    /// Credit balance shown by the service, if it shows one.
    async fn remaining_credits(&self, worker_id: &str) -> Result<Option<u32>, DriverError>;

    /// Tear the worker's session down. Closing an unknown session is not an error.
    async fn close(&self, worker_id: &str) -> Result<(), DriverError>;
}

/// Bound an external call; an elapsed deadline becomes a retryable
/// [`DriverError::Timeout`].
pub async fn with_timeout<T, F>(op: &str, timeout: Duration, fut: F) -> Result<T, DriverError>
where
    F: Future<Output = Result<T, DriverError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout {
            op: op.to_string(),
            timeout,
        }),
    }
}
