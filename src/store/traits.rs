//! Storage traits: the job repository and the billing ledger.
//!
//! The engine only talks to these traits; `LibSqlBackend` implements both.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DatabaseError, LedgerError};
use crate::jobs::{Job, JobStatus, JobUpdate, Progress};

/// Job repository.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: &Job) -> Result<(), DatabaseError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Up to `limit` pending jobs, oldest first.
    async fn list_pending(&self, limit: usize) -> Result<Vec<Job>, DatabaseError>;

    /// Atomic compare-and-set on status.
    ///
    /// Applies `update` only if the job is currently in `expected`. Returns
    /// the updated job, or `None` when the job was missing or had already
    /// moved on. Transitions the state machine forbids are an error.
    async fn update_status(
        &self,
        id: Uuid,
        expected: JobStatus,
        update: JobUpdate,
    ) -> Result<Option<Job>, DatabaseError>;

    /// Record progress on a non-terminal job. Does not touch `updated_at`,
    /// so stage timeouts keep counting from the last status change.
    async fn update_progress(&self, id: Uuid, progress: Progress) -> Result<bool, DatabaseError>;

    /// All jobs in `status`, oldest first.
    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, DatabaseError>;

    async fn count_by_status(&self, status: JobStatus) -> Result<usize, DatabaseError>;
}

/// Kind of ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Refund,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refund => "refund",
        }
    }
}

/// A recorded money movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub account_id: String,
    pub job_id: Uuid,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Result of a refund request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundReceipt {
    pub transaction: LedgerTransaction,
    /// False when the job had already been refunded and nothing new was recorded.
    pub newly_recorded: bool,
}

/// Billing ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Refund `amount` to `account_id` for `job_id`. At most one refund is
    /// ever recorded per job; repeating the call returns the first record.
    async fn refund(
        &self,
        account_id: &str,
        amount: Decimal,
        job_id: Uuid,
    ) -> Result<RefundReceipt, LedgerError>;

    async fn refunds_for_job(&self, job_id: Uuid) -> Result<Vec<LedgerTransaction>, LedgerError>;

    async fn refunded_total(&self, account_id: &str) -> Result<Decimal, LedgerError>;
}
