//! Orchestration engine: one injected instance that owns the worker pool
//! and drives jobs from `pending` to a terminal status.
//!
//! Four cooperative loops share the engine state:
//!
//! * scheduler: assigns pending jobs to workers, spawns submissions
//! * scanner: polls busy workers' sessions and finalizes jobs
//! * session health: re-checks every active worker's session and credits
//! * reaper: fails jobs stuck past their stage timeout
//!
//! A watchdog task restarts any loop that dies and periodically rebuilds
//! the whole pool.

mod finalize;
mod health;
mod reaper;
mod recovery;
mod scanner;
mod scheduler;
mod status;
mod submission;
mod watchdog;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::driver::{SessionDriver, with_timeout};
use crate::error::{EngineError, JobError, RegistryError, Result};
use crate::jobs::{Job, JobStatus, NewJob};
use crate::store::{JobStore, Ledger};
use crate::workers::{WorkerConfig, WorkerPatch, WorkerRegistry, WorkerStatus};

pub use finalize::{CompleteOutcome, FailOutcome, Finalizer};
pub use recovery::RecoveryReport;
pub use scanner::{ScanReport, SeenArtifacts};
pub use status::{LoadLevel, LoopRestartCounts, SystemStatus};
pub use submission::SubmissionLocks;
pub use watchdog::{RestartDecision, restart_decision};

/// The supervised loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopKind {
    Scheduler,
    Scanner,
    SessionHealth,
    Reaper,
}

impl LoopKind {
    pub(crate) const ALL: [LoopKind; 4] = [
        LoopKind::Scheduler,
        LoopKind::Scanner,
        LoopKind::SessionHealth,
        LoopKind::Reaper,
    ];

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Scheduler => "scheduler",
            Self::Scanner => "scanner",
            Self::SessionHealth => "session_health",
            Self::Reaper => "reaper",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }

    fn spawn(&self, shared: &Arc<EngineShared>, loops: &LoopTokens) -> JoinHandle<()> {
        let shared = shared.clone();
        let cancel = loops.cancel.clone();
        match self {
            Self::Scheduler => {
                let submissions = loops.submissions.clone();
                tokio::spawn(scheduler::run(shared, cancel, submissions))
            }
            Self::Scanner => tokio::spawn(scanner::run(shared, cancel)),
            Self::SessionHealth => tokio::spawn(health::run(shared, cancel)),
            Self::Reaper => tokio::spawn(reaper::run(shared, cancel)),
        }
    }
}

/// Cancellation for one generation of loops.
#[derive(Clone)]
pub(crate) struct LoopTokens {
    /// Stops the four loops.
    cancel: CancellationToken,
    /// Abandons in-flight submissions.
    submissions: CancellationToken,
}

/// One running generation of the four loops.
pub(crate) struct LoopSet {
    tokens: LoopTokens,
    handles: [JoinHandle<()>; 4],
}

impl LoopSet {
    fn spawn(shared: &Arc<EngineShared>, shutdown: &CancellationToken) -> Self {
        let tokens = LoopTokens {
            cancel: shutdown.child_token(),
            submissions: shutdown.child_token(),
        };
        let handles = LoopKind::ALL.map(|kind| kind.spawn(shared, &tokens));
        Self { tokens, handles }
    }
}

/// The watchdog and the token that shuts everything down.
struct Supervisor {
    shutdown: CancellationToken,
    watchdog: JoinHandle<()>,
}

/// State shared by the engine facade, the loops and the submission tasks.
pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,
    pub(crate) registry: Arc<WorkerRegistry>,
    pub(crate) driver: Arc<dyn SessionDriver>,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) finalizer: Finalizer,
    pub(crate) locks: SubmissionLocks,
    pub(crate) seen: SeenArtifacts,
    pub(crate) wake: Arc<Notify>,
    pub(crate) submissions: TaskTracker,
    running: AtomicBool,
    started_at: RwLock<Option<Instant>>,
    loops: Mutex<Option<LoopSet>>,
    supervisor: Mutex<Option<Supervisor>>,
    /// Submissions spawned by manual scheduler ticks while stopped.
    idle_submissions: CancellationToken,
    loop_restarts: [AtomicU64; 4],
    full_restarts: AtomicU64,
}

impl EngineShared {
    pub(crate) fn record_loop_restart(&self, kind: LoopKind) {
        self.loop_restarts[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn loop_restart_counts(&self) -> LoopRestartCounts {
        let get = |kind: LoopKind| self.loop_restarts[kind.index()].load(Ordering::Relaxed);
        LoopRestartCounts {
            scheduler: get(LoopKind::Scheduler),
            scanner: get(LoopKind::Scanner),
            session_health: get(LoopKind::SessionHealth),
            reaper: get(LoopKind::Reaper),
            full_restarts: self.full_restarts.load(Ordering::Relaxed),
        }
    }

    pub(crate) async fn uptime(&self) -> Option<Duration> {
        self.started_at.read().await.map(|t| t.elapsed())
    }

    /// Check one worker's session and credits; update the registry.
    /// Transient errors leave the previous verification state alone.
    pub(crate) async fn check_worker(&self, worker: &WorkerConfig) -> bool {
        use crate::driver::SessionStatus;

        let timeout = self.config.call_timeout;
        match with_timeout("ensure_session", timeout, self.driver.ensure_session(worker)).await {
            Ok(SessionStatus::Authenticated) => {
                self.registry.mark_verified(&worker.id, true).await;
            }
            Ok(SessionStatus::NeedsAuthentication) => {
                warn!(worker_id = %worker.id, "Worker session needs re-authentication");
                self.registry.mark_verified(&worker.id, false).await;
                return false;
            }
            Err(e) if e.is_session_invalid() => {
                warn!(worker_id = %worker.id, error = %e, "Worker session invalid");
                self.registry.mark_verified(&worker.id, false).await;
                return false;
            }
            Err(e) => {
                warn!(worker_id = %worker.id, error = %e, "Session check failed");
                return false;
            }
        }

        match with_timeout("remaining_credits", timeout, self.driver.remaining_credits(&worker.id)).await {
            Ok(credits) => self.registry.set_credits(&worker.id, credits).await,
            Err(e) => warn!(worker_id = %worker.id, error = %e, "Credit lookup failed"),
        }
        true
    }

    /// Check every active worker concurrently. Returns how many verified.
    pub(crate) async fn establish_sessions(&self) -> usize {
        let workers = self.registry.active_configs().await;
        let results = join_all(workers.iter().map(|w| self.check_worker(w))).await;
        let verified = results.into_iter().filter(|ok| *ok).count();
        info!(
            active = workers.len(),
            verified,
            "Worker sessions established"
        );
        verified
    }

    pub(crate) async fn close_session(&self, worker_id: &str) {
        if let Err(e) =
            with_timeout("close", self.config.call_timeout, self.driver.close(worker_id)).await
        {
            warn!(worker_id, error = %e, "Failed to close worker session");
        }
    }

    pub(crate) async fn close_all_sessions(&self) {
        let workers = self.registry.snapshot().await;
        join_all(workers.iter().map(|w| self.close_session(&w.id))).await;
    }

    /// Cancel a loop generation and wait for it to exit.
    async fn stop_loops(&self, set: LoopSet) {
        set.tokens.cancel.cancel();
        let grace = self.config.call_timeout;
        for (kind, mut handle) in LoopKind::ALL.into_iter().zip(set.handles) {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(task = kind.name(), "Loop did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
    }

    /// Wait up to `grace` for in-flight submissions, then abandon the rest.
    async fn drain_submissions(&self, tokens: &LoopTokens, grace: Duration) {
        self.submissions.close();
        if tokio::time::timeout(grace, self.submissions.wait()).await.is_err() {
            warn!(
                in_flight = self.submissions.len(),
                "Submissions still running after grace period, abandoning them"
            );
            tokens.submissions.cancel();
            let _ = tokio::time::timeout(self.config.call_timeout, self.submissions.wait()).await;
        }
        self.submissions.reopen();
    }

    /// Clear scheduling state, reconcile with the store and spawn loops.
    async fn bring_up(self: &Arc<Self>, shutdown: &CancellationToken) -> Result<RecoveryReport> {
        self.registry.reset_runtime().await;
        self.seen.clear().await;
        self.locks.reset().await;

        self.establish_sessions().await;
        let report = recovery::recover(self).await?;

        *self.loops.lock().await = Some(LoopSet::spawn(self, shutdown));
        *self.started_at.write().await = Some(Instant::now());
        self.wake.notify_one();
        Ok(report)
    }

    /// Full, clean restart of the worker pool.
    pub(crate) async fn rebuild(self: &Arc<Self>, shutdown: &CancellationToken) -> Result<()> {
        info!("Rebuilding worker pool");
        let previous = self.loops.lock().await.take();
        if let Some(set) = previous {
            let tokens = set.tokens.clone();
            self.stop_loops(set).await;
            // The watchdog only rebuilds once in-flight work drained or the
            // grace period ran out, so anything left is abandoned now.
            self.drain_submissions(&tokens, Duration::ZERO).await;
        }

        self.close_all_sessions().await;
        if let Err(e) = self.registry.reload().await {
            warn!(error = %e, "Worker configuration reload failed, keeping current workers");
        }
        if shutdown.is_cancelled() {
            return Ok(());
        }
        let report = self.bring_up(shutdown).await?;
        self.full_restarts.fetch_add(1, Ordering::Relaxed);
        info!(
            failed_processing = report.failed_processing,
            resumed_generating = report.resumed_generating,
            "Worker pool rebuilt"
        );
        Ok(())
    }
}

/// Handle to the orchestration engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        registry: Arc<WorkerRegistry>,
        driver: Arc<dyn SessionDriver>,
        store: Arc<dyn JobStore>,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        let wake = Arc::new(Notify::new());
        let finalizer = Finalizer::new(
            store.clone(),
            ledger,
            registry.clone(),
            wake.clone(),
            config.refund_attempts,
        );
        let seen = SeenArtifacts::new(config.seen_artifact_capacity, config.seen_artifact_ttl);

        Self {
            shared: Arc::new(EngineShared {
                config,
                registry,
                driver,
                store,
                finalizer,
                locks: SubmissionLocks::default(),
                seen,
                wake,
                submissions: TaskTracker::new(),
                running: AtomicBool::new(false),
                started_at: RwLock::new(None),
                loops: Mutex::new(None),
                supervisor: Mutex::new(None),
                idle_submissions: CancellationToken::new(),
                loop_restarts: Default::default(),
                full_restarts: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.shared.registry
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Establish sessions, reconcile in-flight jobs and start the loops.
    pub async fn start(&self) -> Result<RecoveryReport> {
        let mut supervisor = self.shared.supervisor.lock().await;
        if supervisor.is_some() {
            return Err(EngineError::AlreadyRunning.into());
        }
        if self.shared.registry.active_configs().await.is_empty() {
            return Err(EngineError::NoActiveWorkers.into());
        }

        let shutdown = CancellationToken::new();
        let report = self.shared.bring_up(&shutdown).await?;
        let watchdog = tokio::spawn(watchdog::run(self.shared.clone(), shutdown.clone()));
        *supervisor = Some(Supervisor { shutdown, watchdog });
        self.shared.running.store(true, Ordering::SeqCst);

        info!(
            failed_processing = report.failed_processing,
            resumed_generating = report.resumed_generating,
            "Engine started"
        );
        Ok(report)
    }

    /// Stop the loops, let in-flight submissions finish within the restart
    /// grace period, then close every session.
    pub async fn stop(&self) -> Result<()> {
        let Some(supervisor) = self.shared.supervisor.lock().await.take() else {
            return Err(EngineError::NotRunning.into());
        };
        self.shared.running.store(false, Ordering::SeqCst);

        supervisor.shutdown.cancel();
        if let Err(e) = supervisor.watchdog.await {
            warn!(error = %e, "Watchdog task ended abnormally");
        }

        let set = self.shared.loops.lock().await.take();
        if let Some(set) = set {
            let tokens = set.tokens.clone();
            self.shared.stop_loops(set).await;
            self.shared
                .drain_submissions(&tokens, self.shared.config.restart_grace)
                .await;
        }

        self.shared.close_all_sessions().await;
        *self.shared.started_at.write().await = None;
        info!("Engine stopped");
        Ok(())
    }

    // ── Jobs ────────────────────────────────────────────────────────────

    /// Persist a new pending job and wake the scheduler.
    pub async fn enqueue(&self, new_job: NewJob) -> Result<Job> {
        new_job.validate()?;
        let job = Job::from_new(new_job);
        self.shared.store.create_job(&job).await?;
        self.shared.wake.notify_one();
        info!(job_id = %job.id, model = %job.request.model, "Job enqueued");
        Ok(job)
    }

    /// Interrupt the scheduler's wait.
    pub fn wake(&self) {
        self.shared.wake.notify_one();
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job> {
        self.shared
            .store
            .get_job(id)
            .await?
            .ok_or_else(|| JobError::NotFound { id }.into())
    }

    /// Fail (and refund) a job through the same path the loops use.
    pub async fn fail_job(&self, id: Uuid, reason: &str) -> Result<FailOutcome> {
        self.shared.finalizer.fail_job(id, reason).await
    }

    // ── Status ──────────────────────────────────────────────────────────

    pub async fn get_worker_status(&self) -> Vec<WorkerStatus> {
        self.shared.registry.snapshot().await
    }

    pub async fn get_system_status(&self) -> Result<SystemStatus> {
        let shared = &self.shared;
        let processing = shared.store.count_by_status(JobStatus::Processing).await?;
        let generating = shared.store.count_by_status(JobStatus::Generating).await?;
        let pending = shared.store.count_by_status(JobStatus::Pending).await?;

        Ok(SystemStatus::build(
            self.is_running(),
            processing + generating,
            pending,
            &shared.registry.snapshot().await,
            shared.uptime().await,
            shared.submissions.len(),
            shared.loop_restart_counts(),
        ))
    }

    // ── Workers ─────────────────────────────────────────────────────────

    /// Add and persist a worker; if the engine runs, verify it right away.
    pub async fn add_worker(&self, config: WorkerConfig) -> Result<WorkerStatus> {
        let status = self.shared.registry.add(config.clone()).await?;
        if self.is_running() && config.is_active {
            self.shared.check_worker(&config).await;
            self.shared.wake.notify_one();
        }
        Ok(self.current_status(&config.id).await.unwrap_or(status))
    }

    pub async fn update_worker(&self, id: &str, patch: WorkerPatch) -> Result<WorkerStatus> {
        let current = self.require_worker(id).await?;
        if patch.changes_credential(&current) {
            self.shared.close_session(id).await;
        }
        let status = self.shared.registry.update(id, &patch).await?;
        if self.is_running() && status.is_active && !status.verified {
            if let Some(config) = self.shared.registry.get(id).await {
                self.shared.check_worker(&config).await;
            }
        }
        self.shared.wake.notify_one();
        Ok(self.current_status(id).await.unwrap_or(status))
    }

    /// Tear the worker's session down, then remove it from the registry.
    pub async fn remove_worker(&self, id: &str) -> Result<WorkerConfig> {
        self.require_worker(id).await?;
        self.shared.close_session(id).await;
        Ok(self.shared.registry.remove(id).await?)
    }

    /// Toggle a worker. Deactivation closes its session.
    pub async fn set_worker_active(&self, id: &str, active: bool) -> Result<WorkerStatus> {
        let config = self.require_worker(id).await?;
        if !active {
            self.shared.close_session(id).await;
        }
        self.shared.registry.set_active(id, active).await?;
        if active && self.is_running() {
            self.shared.check_worker(&config).await;
            self.shared.wake.notify_one();
        }
        self.current_status(id)
            .await
            .ok_or_else(|| RegistryError::UnknownWorker { id: id.to_string() }.into())
    }

    /// Live session check for one worker.
    pub async fn verify_worker(&self, id: &str) -> Result<WorkerStatus> {
        let config = self.require_worker(id).await?;
        if !config.is_active {
            return Err(RegistryError::InvalidWorker {
                id: id.to_string(),
                reason: "worker is inactive".to_string(),
            }
            .into());
        }
        if self.shared.check_worker(&config).await {
            self.shared.wake.notify_one();
        }
        self.current_status(id)
            .await
            .ok_or_else(|| RegistryError::UnknownWorker { id: id.to_string() }.into())
    }

    async fn require_worker(&self, id: &str) -> Result<WorkerConfig> {
        self.shared
            .registry
            .get(id)
            .await
            .ok_or_else(|| RegistryError::UnknownWorker { id: id.to_string() }.into())
    }

    async fn current_status(&self, id: &str) -> Option<WorkerStatus> {
        self.shared.registry.status(id).await
    }

    // ── Manual cycles ───────────────────────────────────────────────────
    //
    // Each runs one iteration of the corresponding loop right now. The loops
    // call the same code; these exist for operators and tests.

    /// One scheduler cycle. Returns how many jobs were assigned.
    pub async fn run_scheduler_cycle(&self) -> Result<usize> {
        let token = match self.shared.loops.lock().await.as_ref() {
            Some(set) => set.tokens.submissions.clone(),
            None => self.shared.idle_submissions.clone(),
        };
        let outcome = scheduler::run_cycle(&self.shared, &token).await?;
        Ok(outcome.assigned)
    }

    pub async fn run_scan_cycle(&self) -> Result<ScanReport> {
        scanner::run_cycle(&self.shared).await
    }

    /// One reaper pass. Returns how many jobs it failed.
    pub async fn run_reaper_cycle(&self) -> Result<usize> {
        reaper::run_cycle(&self.shared).await
    }

    /// One session-health pass. Returns how many workers verified.
    pub async fn run_session_check(&self) -> usize {
        health::run_cycle(&self.shared).await
    }

    /// Wait until no submission task is running, up to `timeout`.
    pub async fn wait_for_submissions(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.shared.submissions.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}
