//! Watchdog: restart loops that died and periodically rebuild the pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{EngineShared, LoopKind};

/// Whether a periodic full restart should happen now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    NotDue,
    /// Due, but submissions are in flight and the grace period has not run out.
    Defer,
    Restart,
}

/// Decide on a periodic restart. `deferred_for` is how long a due restart
/// has already been waiting on in-flight submissions.
pub fn restart_decision(
    uptime: Duration,
    interval: Duration,
    in_flight: usize,
    deferred_for: Option<Duration>,
    grace: Duration,
) -> RestartDecision {
    if interval.is_zero() || uptime < interval {
        return RestartDecision::NotDue;
    }
    if in_flight == 0 {
        return RestartDecision::Restart;
    }
    match deferred_for {
        Some(waited) if waited >= grace => RestartDecision::Restart,
        _ => RestartDecision::Defer,
    }
}

pub(crate) async fn run(shared: Arc<EngineShared>, shutdown: CancellationToken) {
    info!("Watchdog started");
    let mut ticker = tokio::time::interval(shared.config.watchdog_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut deferred_since: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        restart_dead_loops(&shared).await;

        if !shared.config.restarts_enabled() {
            continue;
        }
        let Some(uptime) = shared.uptime().await else {
            continue;
        };
        let in_flight = shared.submissions.len();
        let decision = restart_decision(
            uptime,
            shared.config.restart_interval,
            in_flight,
            deferred_since.map(|t| t.elapsed()),
            shared.config.restart_grace,
        );

        match decision {
            RestartDecision::NotDue => deferred_since = None,
            RestartDecision::Defer => {
                if deferred_since.is_none() {
                    info!(in_flight, "Restart due, waiting for in-flight submissions");
                    deferred_since = Some(Instant::now());
                }
            }
            RestartDecision::Restart => {
                deferred_since = None;
                if in_flight > 0 {
                    warn!(in_flight, "Restart grace period over, abandoning submissions");
                }
                if let Err(e) = shared.rebuild(&shutdown).await {
                    error!(error = %e, "Worker pool rebuild failed");
                }
            }
        }
    }
    info!("Watchdog stopped");
}

/// Respawn any loop whose task has exited. A cancelled loop set is left
/// alone; it is being shut down on purpose.
async fn restart_dead_loops(shared: &Arc<EngineShared>) {
    let mut loops = shared.loops.lock().await;
    let Some(set) = loops.as_mut() else {
        return;
    };
    if set.tokens.cancel.is_cancelled() {
        return;
    }

    for (kind, handle) in LoopKind::ALL.into_iter().zip(set.handles.iter_mut()) {
        if !handle.is_finished() {
            continue;
        }
        match (&mut *handle).await {
            Ok(()) => warn!(task = kind.name(), "Loop exited unexpectedly, restarting"),
            Err(e) => error!(task = kind.name(), error = %e, "Loop crashed, restarting"),
        }
        *handle = kind.spawn(shared, &set.tokens);
        shared.record_loop_restart(kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);
    const GRACE: Duration = Duration::from_secs(300);

    #[test]
    fn not_due_before_interval() {
        let d = restart_decision(Duration::from_secs(10), HOUR, 0, None, GRACE);
        assert_eq!(d, RestartDecision::NotDue);
    }

    #[test]
    fn zero_interval_never_restarts() {
        let d = restart_decision(HOUR * 100, Duration::ZERO, 0, None, GRACE);
        assert_eq!(d, RestartDecision::NotDue);
    }

    #[test]
    fn restarts_immediately_when_idle() {
        let d = restart_decision(HOUR, HOUR, 0, None, GRACE);
        assert_eq!(d, RestartDecision::Restart);
    }

    #[test]
    fn defers_while_submissions_in_flight() {
        assert_eq!(
            restart_decision(HOUR, HOUR, 2, None, GRACE),
            RestartDecision::Defer
        );
        assert_eq!(
            restart_decision(HOUR, HOUR, 2, Some(Duration::from_secs(299)), GRACE),
            RestartDecision::Defer
        );
    }

    #[test]
    fn restarts_once_grace_runs_out() {
        let d = restart_decision(HOUR, HOUR, 2, Some(GRACE), GRACE);
        assert_eq!(d, RestartDecision::Restart);
    }
}
