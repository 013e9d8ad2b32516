//! Completion scanner: read busy workers' sessions and finalize jobs whose
//! results (or failures) have appeared.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{CompleteOutcome, EngineShared, FailOutcome};
use crate::driver::{Observation, ScanItem, with_timeout};
use crate::error::{Error, JobError};

/// Artifacts already acted on, so a result that stays visible across scans
/// is processed once. Cleared wholesale when full or stale.
pub struct SeenArtifacts {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<SeenInner>,
}

struct SeenInner {
    keys: HashSet<String>,
    since: Instant,
}

impl SeenArtifacts {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(SeenInner {
                keys: HashSet::new(),
                since: Instant::now(),
            }),
        }
    }

    pub async fn contains(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().await;
        self.expire(&mut inner);
        inner.keys.contains(key)
    }

    pub async fn insert(&self, key: impl Into<String>) {
        let mut inner = self.inner.lock().await;
        self.expire(&mut inner);
        if inner.keys.len() >= self.capacity {
            debug!(entries = inner.keys.len(), "Seen-artifact set full, clearing");
            inner.keys.clear();
            inner.since = Instant::now();
        }
        inner.keys.insert(key.into());
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.keys.clear();
        inner.since = Instant::now();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.keys.len()
    }

    fn expire(&self, inner: &mut SeenInner) {
        if inner.since.elapsed() >= self.ttl {
            inner.keys.clear();
            inner.since = Instant::now();
        }
    }
}

/// Totals for one scan cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub workers_scanned: usize,
    /// Workers skipped because a submission held them.
    pub workers_busy: usize,
    pub progress_updates: usize,
    pub completed: usize,
    pub failed: usize,
}

pub(crate) async fn run(shared: Arc<EngineShared>, cancel: CancellationToken) {
    info!("Scanner loop started");
    let mut ticker = tokio::time::interval(shared.config.scan_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = run_cycle(&shared).await {
            error!(error = %e, "Scan cycle failed");
        }
    }
    info!("Scanner loop stopped");
}

/// Scan every active worker that has jobs in flight.
pub(crate) async fn run_cycle(shared: &EngineShared) -> Result<ScanReport, Error> {
    let mut report = ScanReport::default();
    let busy: Vec<String> = shared
        .registry
        .snapshot()
        .await
        .into_iter()
        .filter(|w| w.is_active && w.load > 0)
        .map(|w| w.id)
        .collect();

    for worker_id in busy {
        let Some(_guard) = shared.locks.try_lock(&worker_id).await else {
            debug!(worker_id = %worker_id, "Worker busy submitting, skipping scan");
            report.workers_busy += 1;
            continue;
        };

        let items = match with_timeout(
            "scan_for_completion",
            shared.config.call_timeout,
            shared.driver.scan_for_completion(&worker_id),
        )
        .await
        {
            Ok(items) => items,
            Err(e) if e.is_session_invalid() => {
                warn!(worker_id = %worker_id, error = %e, "Session invalid during scan");
                shared.registry.mark_verified(&worker_id, false).await;
                continue;
            }
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "Scan failed");
                continue;
            }
        };

        report.workers_scanned += 1;
        for item in &items {
            if let Err(e) = handle_item(shared, &worker_id, item, &mut report).await {
                error!(worker_id = %worker_id, error = %e, "Failed to apply scan result");
            }
        }
    }

    if report.completed > 0 || report.failed > 0 {
        info!(
            completed = report.completed,
            failed = report.failed,
            scanned = report.workers_scanned,
            "Scan cycle finalized jobs"
        );
    }
    Ok(report)
}

async fn handle_item(
    shared: &EngineShared,
    worker_id: &str,
    item: &ScanItem,
    report: &mut ScanReport,
) -> Result<(), Error> {
    match item.classify() {
        Observation::Ignored => {}
        Observation::Progress(progress) => {
            if let Some(token) = item.token() {
                if shared.store.update_progress(token.job_id(), progress).await? {
                    report.progress_updates += 1;
                }
            }
        }
        Observation::Finished { artifact } => {
            if shared.seen.contains(&artifact).await {
                return Ok(());
            }
            let Some(token) = item.token() else {
                debug!(worker_id, artifact = %artifact, "Artifact without tracking token, ignoring");
                shared.seen.insert(artifact).await;
                return Ok(());
            };
            match shared.finalizer.complete_job(token.job_id(), &artifact).await {
                Ok(CompleteOutcome::Completed) => report.completed += 1,
                Ok(CompleteOutcome::NotStarted) => {
                    warn!(job_id = %token.job_id(), worker_id, "Result seen for a job that was never claimed");
                }
                Ok(_) => {}
                Err(Error::Job(JobError::NotFound { id })) => {
                    debug!(job_id = %id, worker_id, "Result for unknown job, ignoring");
                }
                Err(e) => return Err(e),
            }
            shared.seen.insert(artifact).await;
        }
        Observation::Failed { reason } => {
            let Some(token) = item.token() else {
                return Ok(());
            };
            let key = format!("failed:{}", token.job_id());
            if shared.seen.contains(&key).await {
                return Ok(());
            }
            let reason = format!("generation failed: {reason}");
            match shared.finalizer.fail_job(token.job_id(), &reason).await {
                Ok(FailOutcome::Failed { .. }) => report.failed += 1,
                Ok(_) => {}
                Err(Error::Job(JobError::NotFound { id })) => {
                    debug!(job_id = %id, worker_id, "Failure for unknown job, ignoring");
                }
                Err(e) => return Err(e),
            }
            shared.seen.insert(key).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seen_set_remembers_until_full() {
        let seen = SeenArtifacts::new(2, Duration::from_secs(3600));
        seen.insert("a").await;
        seen.insert("b").await;
        assert!(seen.contains("a").await);
        assert!(seen.contains("b").await);

        seen.insert("c").await;
        assert!(!seen.contains("a").await);
        assert!(seen.contains("c").await);
        assert_eq!(seen.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn seen_set_expires_after_ttl() {
        let seen = SeenArtifacts::new(100, Duration::from_secs(60));
        seen.insert("a").await;
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(seen.contains("a").await);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!seen.contains("a").await);
    }

    #[tokio::test]
    async fn clear_empties_the_set() {
        let seen = SeenArtifacts::new(10, Duration::from_secs(60));
        seen.insert("a").await;
        seen.clear().await;
        assert_eq!(seen.len().await, 0);
    }
}
