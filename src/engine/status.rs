//! System status snapshot.

use std::time::Duration;

use serde::Serialize;

use crate::workers::WorkerStatus;

/// Coarse utilization bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadLevel {
    Idle,
    Normal,
    Busy,
    Saturated,
}

impl LoadLevel {
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization < 0.3 {
            Self::Idle
        } else if utilization < 0.6 {
            Self::Normal
        } else if utilization < 0.8 {
            Self::Busy
        } else {
            Self::Saturated
        }
    }
}

/// How often the watchdog has restarted each loop, and the whole pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopRestartCounts {
    pub scheduler: u64,
    pub scanner: u64,
    pub session_health: u64,
    pub reaper: u64,
    pub full_restarts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub running: bool,
    /// Jobs in `processing` or `generating`.
    pub active_jobs: usize,
    pub pending_jobs: usize,
    pub worker_count: usize,
    pub active_workers: usize,
    pub verified_workers: usize,
    /// Sum of `max_concurrent` over active workers.
    pub total_capacity: u64,
    pub total_load: u64,
    /// `total_load / total_capacity`, 0 when there is no capacity.
    pub utilization: f64,
    pub load_level: LoadLevel,
    pub uptime_secs: Option<u64>,
    pub in_flight_submissions: usize,
    pub loop_restarts: LoopRestartCounts,
}

impl SystemStatus {
    pub(crate) fn build(
        running: bool,
        active_jobs: usize,
        pending_jobs: usize,
        workers: &[WorkerStatus],
        uptime: Option<Duration>,
        in_flight_submissions: usize,
        loop_restarts: LoopRestartCounts,
    ) -> Self {
        let active: Vec<&WorkerStatus> = workers.iter().filter(|w| w.is_active).collect();
        let total_capacity: u64 = active.iter().map(|w| u64::from(w.capacity)).sum();
        let total_load: u64 = active.iter().map(|w| u64::from(w.load)).sum();
        let utilization = if total_capacity == 0 {
            0.0
        } else {
            total_load as f64 / total_capacity as f64
        };

        Self {
            running,
            active_jobs,
            pending_jobs,
            worker_count: workers.len(),
            active_workers: active.len(),
            verified_workers: active.iter().filter(|w| w.verified).count(),
            total_capacity,
            total_load,
            utilization,
            load_level: LoadLevel::from_utilization(utilization),
            uptime_secs: uptime.map(|d| d.as_secs()),
            in_flight_submissions,
            loop_restarts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::{WorkerConfig, WorkerState};

    fn worker(id: &str, capacity: u32, load: u32, active: bool) -> WorkerStatus {
        let mut config = WorkerConfig::new(id, format!("cred-{id}"), 5).with_capacity(capacity);
        config.is_active = active;
        let state = WorkerState {
            current_load: load,
            session_verified: active,
            remaining_credits: None,
        };
        WorkerStatus::from_parts(&config, &state)
    }

    #[test]
    fn load_level_thresholds() {
        assert_eq!(LoadLevel::from_utilization(0.0), LoadLevel::Idle);
        assert_eq!(LoadLevel::from_utilization(0.29), LoadLevel::Idle);
        assert_eq!(LoadLevel::from_utilization(0.3), LoadLevel::Normal);
        assert_eq!(LoadLevel::from_utilization(0.6), LoadLevel::Busy);
        assert_eq!(LoadLevel::from_utilization(0.8), LoadLevel::Saturated);
        assert_eq!(LoadLevel::from_utilization(1.0), LoadLevel::Saturated);
    }

    #[test]
    fn utilization_counts_active_workers_only() {
        let workers = vec![
            worker("a", 4, 2, true),
            worker("b", 4, 4, true),
            worker("c", 10, 0, false),
        ];
        let status = SystemStatus::build(
            true,
            6,
            1,
            &workers,
            Some(Duration::from_secs(90)),
            0,
            LoopRestartCounts::default(),
        );
        assert_eq!(status.worker_count, 3);
        assert_eq!(status.active_workers, 2);
        assert_eq!(status.verified_workers, 2);
        assert_eq!(status.total_capacity, 8);
        assert_eq!(status.total_load, 6);
        assert!((status.utilization - 0.75).abs() < f64::EPSILON);
        assert_eq!(status.load_level, LoadLevel::Busy);
        assert_eq!(status.uptime_secs, Some(90));
    }

    #[test]
    fn huge_capacities_do_not_overflow() {
        let workers = vec![
            worker("a", u32::MAX, u32::MAX, true),
            worker("b", u32::MAX, 0, true),
        ];
        let status = SystemStatus::build(true, 0, 0, &workers, None, 0, LoopRestartCounts::default());
        assert_eq!(status.total_capacity, 2 * u64::from(u32::MAX));
        assert_eq!(status.total_load, u64::from(u32::MAX));
        assert!((status.utilization - 0.5).abs() < f64::EPSILON);
        assert_eq!(status.load_level, LoadLevel::Normal);
    }

    #[test]
    fn no_capacity_means_idle() {
        let status = SystemStatus::build(false, 0, 3, &[], None, 0, LoopRestartCounts::default());
        assert_eq!(status.utilization, 0.0);
        assert_eq!(status.load_level, LoadLevel::Idle);
        assert_eq!(status.uptime_secs, None);
    }
}
