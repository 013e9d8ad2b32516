//! Session health loop: periodically re-verify every active worker.

use std::sync::Arc;

use futures::future::join_all;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::EngineShared;
use crate::workers::WorkerConfig;

pub(crate) async fn run(shared: Arc<EngineShared>, cancel: CancellationToken) {
    info!("Session health loop started");
    let mut ticker = tokio::time::interval(shared.config.session_check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Sessions were just established by start or rebuild.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let verified = run_cycle(&shared).await;
        if verified > 0 {
            // A worker may have come back; pending jobs can move again.
            shared.wake.notify_one();
        }
    }
    info!("Session health loop stopped");
}

/// Check every active worker not currently submitting. Returns how many
/// checks succeeded.
pub(crate) async fn run_cycle(shared: &EngineShared) -> usize {
    let workers = shared.registry.active_configs().await;
    let results = join_all(workers.iter().map(|w| check_idle_worker(shared, w))).await;
    let checked = results.iter().filter(|r| r.is_some()).count();
    let verified = results.into_iter().flatten().filter(|ok| *ok).count();
    debug!(active = workers.len(), checked, verified, "Session health pass done");
    verified
}

async fn check_idle_worker(shared: &EngineShared, worker: &WorkerConfig) -> Option<bool> {
    let Some(_guard) = shared.locks.try_lock(&worker.id).await else {
        debug!(worker_id = %worker.id, "Worker busy submitting, skipping health check");
        return None;
    };
    Some(shared.check_worker(worker).await)
}
