//! libSQL backend: async `JobStore` and `Ledger` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DatabaseError, LedgerError};
use crate::jobs::{Job, JobRequest, JobStatus, JobUpdate, Progress};
use crate::store::migrations;
use crate::store::traits::{JobStore, Ledger, LedgerTransaction, RefundReceipt, TransactionKind};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_jobs(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed-width RFC 3339, so text order is time order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_decimal(s: &str) -> Result<Decimal, DatabaseError> {
    s.parse::<Decimal>()
        .map_err(|e| DatabaseError::Serialization(format!("invalid amount {s:?}: {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("job row parse: {e}"));

    let id_str: String = row.get(0).map_err(parse)?;
    let account_id: String = row.get(1).map_err(parse)?;
    let request_json: String = row.get(2).map_err(parse)?;
    let cost_str: String = row.get(3).map_err(parse)?;
    let status_str: String = row.get(4).map_err(parse)?;
    let progress: i64 = row.get(5).map_err(parse)?;
    let result_ref: Option<String> = row.get(6).map_err(parse)?;
    let assigned_worker: Option<String> = row.get(7).map_err(parse)?;
    let failure_reason: Option<String> = row.get(8).map_err(parse)?;
    let created_str: String = row.get(9).map_err(parse)?;
    let updated_str: String = row.get(10).map_err(parse)?;

    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("invalid job id {id_str}: {e}")))?;
    let request: JobRequest = serde_json::from_str(&request_json)
        .map_err(|e| DatabaseError::Serialization(format!("job {id} request: {e}")))?;
    let status: JobStatus = status_str
        .parse()
        .map_err(|e: String| DatabaseError::Serialization(format!("job {id}: {e}")))?;

    Ok(Job {
        id,
        account_id,
        request,
        cost: parse_decimal(&cost_str)?,
        status,
        progress: Progress::from_db(progress),
        result_ref,
        assigned_worker,
        failure_reason,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_transaction(row: &libsql::Row) -> Result<LedgerTransaction, LedgerError> {
    let parse = |e: libsql::Error| LedgerError::Storage(format!("transaction row parse: {e}"));

    let id_str: String = row.get(0).map_err(parse)?;
    let account_id: String = row.get(1).map_err(parse)?;
    let job_str: String = row.get(2).map_err(parse)?;
    let amount_str: String = row.get(4).map_err(parse)?;
    let created_str: String = row.get(5).map_err(parse)?;

    let uuid = |s: &str| {
        Uuid::parse_str(s).map_err(|e| LedgerError::Storage(format!("invalid id {s}: {e}")))
    };

    Ok(LedgerTransaction {
        id: uuid(&id_str)?,
        account_id,
        job_id: uuid(&job_str)?,
        kind: TransactionKind::Refund,
        amount: parse_decimal(&amount_str).map_err(|e| LedgerError::Storage(e.to_string()))?,
        created_at: parse_datetime(&created_str),
    })
}

fn is_terminal_sql() -> String {
    JobStatus::ALL
        .iter()
        .filter(|s| s.is_terminal())
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Trait implementations ───────────────────────────────────────────

const JOB_COLUMNS: &str = "id, account_id, request, cost, status, progress, result_ref, assigned_worker, failure_reason, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, account_id, job_id, kind, amount, created_at";

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn create_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let request_json = serde_json::to_string(&job.request)
            .map_err(|e| DatabaseError::Serialization(format!("job request: {e}")))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    job.id.to_string(),
                    job.account_id.clone(),
                    request_json,
                    job.cost.to_string(),
                    job.status.as_str(),
                    job.progress.to_db(),
                    opt_text(job.result_ref.as_deref()),
                    opt_text(job.assigned_worker.as_deref()),
                    opt_text(job.failure_reason.as_deref()),
                    format_datetime(&job.created_at),
                    format_datetime(&job.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_job: {e}")))?;

        debug!(job_id = %job.id, account_id = %job.account_id, "Job inserted into DB");
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut jobs = self
            .query_jobs(
                "get_job",
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(jobs.pop())
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        self.query_jobs(
            "list_pending",
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY created_at ASC, rowid ASC LIMIT ?2"
            ),
            params![JobStatus::Pending.as_str(), limit as i64],
        )
        .await
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected: JobStatus,
        update: JobUpdate,
    ) -> Result<Option<Job>, DatabaseError> {
        if !expected.can_transition_to(update.status) {
            return Err(DatabaseError::InvalidTransition {
                from: expected.to_string(),
                to: update.status.to_string(),
            });
        }

        let now = format_datetime(&Utc::now());
        let affected = self
            .conn()
            .execute(
                &format!(
                    "UPDATE jobs SET
                        status = ?1,
                        progress = COALESCE(?2, progress),
                        result_ref = COALESCE(?3, result_ref),
                        assigned_worker = CASE WHEN ?1 IN ({terminal}) THEN NULL
                                               ELSE COALESCE(?4, assigned_worker) END,
                        failure_reason = COALESCE(?5, failure_reason),
                        updated_at = ?6
                     WHERE id = ?7 AND status = ?8",
                    terminal = is_terminal_sql()
                ),
                params![
                    update.status.as_str(),
                    opt_int(update.progress.map(Progress::to_db)),
                    opt_text(update.result_ref.as_deref()),
                    opt_text(update.assigned_worker.as_deref()),
                    opt_text(update.failure_reason.as_deref()),
                    now,
                    id.to_string(),
                    expected.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_status: {e}")))?;

        if affected == 0 {
            debug!(job_id = %id, expected = %expected, to = %update.status, "Status CAS lost");
            return Ok(None);
        }
        debug!(job_id = %id, from = %expected, to = %update.status, "Job status updated in DB");
        self.get_job(id).await
    }

    async fn update_progress(&self, id: Uuid, progress: Progress) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                &format!(
                    "UPDATE jobs SET progress = ?1 WHERE id = ?2 AND status NOT IN ({})",
                    is_terminal_sql()
                ),
                params![progress.to_db(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_progress: {e}")))?;
        Ok(affected > 0)
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, DatabaseError> {
        self.query_jobs(
            "list_by_status",
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY created_at ASC, rowid ASC"
            ),
            params![status.as_str()],
        )
        .await
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<usize, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM jobs WHERE status = ?1",
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_by_status: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count_by_status: {e}")))?;
                Ok(count.max(0) as usize)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_by_status: {e}"))),
        }
    }
}

impl LibSqlBackend {
    async fn find_transaction(
        &self,
        job_id: Uuid,
        kind: TransactionKind,
    ) -> Result<Option<LedgerTransaction>, LedgerError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE job_id = ?1 AND kind = ?2"
                ),
                params![job_id.to_string(), kind.as_str()],
            )
            .await
            .map_err(|e| LedgerError::Storage(format!("find_transaction: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_transaction(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(LedgerError::Storage(format!("find_transaction: {e}"))),
        }
    }
}

#[async_trait]
impl Ledger for LibSqlBackend {
    async fn refund(
        &self,
        account_id: &str,
        amount: Decimal,
        job_id: Uuid,
    ) -> Result<RefundReceipt, LedgerError> {
        if amount.is_sign_negative() {
            return Err(LedgerError::Rejected(format!(
                "refund amount must not be negative, got {amount}"
            )));
        }

        let kind = TransactionKind::Refund;
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO transactions ({TRANSACTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                ),
                params![
                    Uuid::new_v4().to_string(),
                    account_id,
                    job_id.to_string(),
                    kind.as_str(),
                    amount.to_string(),
                    format_datetime(&Utc::now()),
                ],
            )
            .await
            .map_err(|e| LedgerError::Storage(format!("refund: {e}")))?;

        let transaction = self
            .find_transaction(job_id, kind)
            .await?
            .ok_or_else(|| LedgerError::Storage(format!("refund for job {job_id} not readable")))?;

        if inserted > 0 {
            info!(job_id = %job_id, account_id, amount = %amount, "Refund recorded");
        } else {
            debug!(job_id = %job_id, "Refund already recorded, nothing to do");
        }
        Ok(RefundReceipt {
            transaction,
            newly_recorded: inserted > 0,
        })
    }

    async fn refunds_for_job(&self, job_id: Uuid) -> Result<Vec<LedgerTransaction>, LedgerError> {
        Ok(self
            .find_transaction(job_id, TransactionKind::Refund)
            .await?
            .into_iter()
            .collect())
    }

    async fn refunded_total(&self, account_id: &str) -> Result<Decimal, LedgerError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT amount FROM transactions WHERE account_id = ?1 AND kind = ?2",
                params![account_id, TransactionKind::Refund.as_str()],
            )
            .await
            .map_err(|e| LedgerError::Storage(format!("refunded_total: {e}")))?;

        let mut total = Decimal::ZERO;
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| LedgerError::Storage(format!("refunded_total: {e}")))?
        {
            let amount: String = row
                .get(0)
                .map_err(|e| LedgerError::Storage(format!("refunded_total: {e}")))?;
            total += parse_decimal(&amount).map_err(|e| LedgerError::Storage(e.to_string()))?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::NewJob;
    use rust_decimal_macros::dec;

    async fn backend() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn new_job(prompt: &str) -> Job {
        Job::from_new(NewJob::new("acct-1", JobRequest::new(prompt, "hailuo_2_3")))
    }

    #[test]
    fn terminal_filter_lists_completed_and_failed() {
        assert_eq!(is_terminal_sql(), "'completed', 'failed'");
    }

    #[tokio::test]
    async fn local_database_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data").join("genpool.db");
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(path.parent().unwrap().is_dir());
        assert_eq!(db.count_by_status(JobStatus::Pending).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let db = backend().await;
        let mut job = new_job("a lighthouse in a storm");
        job.request.reference_media = vec!["https://img/first.png".into()];
        job.request.duration_secs = Some(6);
        db.create_job(&job).await.unwrap();

        let loaded = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.request, job.request);
        assert_eq!(loaded.cost, dec!(0.99));
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(
            loaded.created_at.timestamp_micros(),
            job.created_at.timestamp_micros()
        );

        assert!(db.get_job(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_pending_is_oldest_first_and_limited() {
        let db = backend().await;
        let mut ids = Vec::new();
        for i in 0..5 {
            let job = new_job(&format!("job {i}"));
            ids.push(job.id);
            db.create_job(&job).await.unwrap();
        }

        let pending = db.list_pending(3).await.unwrap();
        let got: Vec<Uuid> = pending.iter().map(|j| j.id).collect();
        assert_eq!(got, ids[..3]);
    }

    #[tokio::test]
    async fn update_status_is_compare_and_set() {
        let db = backend().await;
        let job = new_job("cas");
        db.create_job(&job).await.unwrap();

        let claimed = db
            .update_status(job.id, JobStatus::Pending, JobUpdate::claimed("w1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.assigned_worker.as_deref(), Some("w1"));

        // Second claim from a stale read loses.
        let second = db
            .update_status(job.id, JobStatus::Pending, JobUpdate::claimed("w2"))
            .await
            .unwrap();
        assert!(second.is_none());
        let current = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(current.assigned_worker.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn terminal_update_clears_assignment() {
        let db = backend().await;
        let job = new_job("finish");
        db.create_job(&job).await.unwrap();
        db.update_status(job.id, JobStatus::Pending, JobUpdate::claimed("w1"))
            .await
            .unwrap();
        db.update_status(job.id, JobStatus::Processing, JobUpdate::generating())
            .await
            .unwrap();

        let done = db
            .update_status(
                job.id,
                JobStatus::Generating,
                JobUpdate::completed("https://cdn/a.mp4"),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result_ref.as_deref(), Some("https://cdn/a.mp4"));
        assert_eq!(done.progress, Progress::Percent(100));
        assert!(done.assigned_worker.is_none());
    }

    #[tokio::test]
    async fn forbidden_transition_is_error() {
        let db = backend().await;
        let job = new_job("nope");
        db.create_job(&job).await.unwrap();
        let err = db
            .update_status(job.id, JobStatus::Failed, JobUpdate::claimed("w1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn progress_only_on_live_jobs_and_keeps_updated_at() {
        let db = backend().await;
        let job = new_job("progress");
        db.create_job(&job).await.unwrap();
        let claimed = db
            .update_status(job.id, JobStatus::Pending, JobUpdate::claimed("w1"))
            .await
            .unwrap()
            .unwrap();

        assert!(db.update_progress(job.id, Progress::Percent(37)).await.unwrap());
        let loaded = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.progress, Progress::Percent(37));
        assert_eq!(loaded.updated_at, claimed.updated_at);

        db.update_status(job.id, JobStatus::Processing, JobUpdate::failed("boom"))
            .await
            .unwrap();
        assert!(!db.update_progress(job.id, Progress::Queued).await.unwrap());
    }

    #[tokio::test]
    async fn list_and_count_by_status() {
        let db = backend().await;
        let a = new_job("a");
        let b = new_job("b");
        db.create_job(&a).await.unwrap();
        db.create_job(&b).await.unwrap();
        db.update_status(a.id, JobStatus::Pending, JobUpdate::claimed("w1"))
            .await
            .unwrap();

        let processing = db.list_by_status(JobStatus::Processing).await.unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].id, a.id);
        assert_eq!(db.count_by_status(JobStatus::Pending).await.unwrap(), 1);
        assert_eq!(db.count_by_status(JobStatus::Failed).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn refund_recorded_once_per_job() {
        let db = backend().await;
        let job_id = Uuid::new_v4();

        let first = db.refund("acct-1", dec!(0.99), job_id).await.unwrap();
        assert!(first.newly_recorded);
        let second = db.refund("acct-1", dec!(0.99), job_id).await.unwrap();
        assert!(!second.newly_recorded);
        assert_eq!(second.transaction.id, first.transaction.id);

        assert_eq!(db.refunds_for_job(job_id).await.unwrap().len(), 1);
        db.refund("acct-1", dec!(1.50), Uuid::new_v4()).await.unwrap();
        assert_eq!(db.refunded_total("acct-1").await.unwrap(), dec!(2.49));
        assert_eq!(db.refunded_total("someone-else").await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn negative_refund_rejected() {
        let db = backend().await;
        assert!(matches!(
            db.refund("acct-1", dec!(-1), Uuid::new_v4()).await,
            Err(LedgerError::Rejected(_))
        ));
    }
}
