//! Simulated driver: deterministic in-process stand-in for the sidecar.
//!
//! Submissions "generate" on a timer: an item stays queued for `queue_time`,
//! reports a growing percentage for `generation_time`, then exposes an
//! artifact link. Finished items keep being rendered on every scan, the
//! way the real history page does, so completion detection is exercised
//! against repeated observations. Only the newest [`FINISHED_HISTORY`]
//! finished items are kept.
//!
//! Used for dry-run mode and as the test double for the engine.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::driver::{ScanItem, SessionDriver, SessionStatus, Submission, SubmitReceipt};
use crate::error::DriverError;
use crate::workers::WorkerConfig;

/// Finished generations kept per session; older ones drop off the page.
pub const FINISHED_HISTORY: usize = 32;

/// Accepted submissions remembered per session for inspection.
const SUBMISSION_LOG: usize = 256;

struct Generation {
    submission: Submission,
    submitted_at: Instant,
}

struct SimSession {
    open: bool,
    /// Set to false to make the account look logged out.
    valid: bool,
    credits: Option<u32>,
    generations: Vec<Generation>,
    injected: Vec<ScanItem>,
    scripted_failures: VecDeque<DriverError>,
    submissions: VecDeque<Submission>,
    active_submits: u32,
    max_active_submits: u32,
    close_calls: u32,
    panic_next_scan: bool,
}

impl SimSession {
    /// Drop the oldest finished generations beyond [`FINISHED_HISTORY`].
    /// Generations share one duration, so finished ones form a prefix.
    fn trim_history(&mut self, now: Instant, finished_after: Duration) {
        let finished = self
            .generations
            .iter()
            .take_while(|g| now.saturating_duration_since(g.submitted_at) >= finished_after)
            .count();
        if finished > FINISHED_HISTORY {
            self.generations.drain(..finished - FINISHED_HISTORY);
        }
    }
}

impl Default for SimSession {
    fn default() -> Self {
        Self {
            open: false,
            valid: true,
            credits: None,
            generations: Vec::new(),
            injected: Vec::new(),
            scripted_failures: VecDeque::new(),
            submissions: VecDeque::new(),
            active_submits: 0,
            max_active_submits: 0,
            close_calls: 0,
            panic_next_scan: false,
        }
    }
}

/// In-process [`SessionDriver`].
pub struct SimulatedDriver {
    queue_time: Duration,
    generation_time: Duration,
    submit_delay: Duration,
    sessions: Mutex<HashMap<String, SimSession>>,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(20))
    }
}

impl SimulatedDriver {
    pub fn new(queue_time: Duration, generation_time: Duration) -> Self {
        Self {
            queue_time,
            generation_time,
            submit_delay: Duration::ZERO,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Generations finish on the first scan after submission.
    pub fn instant() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Hold each submission open for `delay` (exposes interleaving).
    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    /// Artifact link the driver renders for a finished job.
    pub fn artifact_for(worker_id: &str, submission: &Submission) -> String {
        format!("sim://{}/{}.mp4", worker_id, submission.job_id.simple())
    }

    // ── Test hooks ──────────────────────────────────────────────────────

    pub async fn set_session_valid(&self, worker_id: &str, valid: bool) {
        self.sessions
            .lock()
            .await
            .entry(worker_id.to_string())
            .or_default()
            .valid = valid;
    }

    pub async fn set_credits(&self, worker_id: &str, credits: Option<u32>) {
        self.sessions
            .lock()
            .await
            .entry(worker_id.to_string())
            .or_default()
            .credits = credits;
    }

    /// The next `count` submissions on this worker fail with `error`.
    pub async fn fail_next_submissions(&self, worker_id: &str, count: usize, error: DriverError) {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(worker_id.to_string()).or_default();
        session
            .scripted_failures
            .extend(std::iter::repeat_n(error, count));
    }

    /// Crash the caller's task on the next scan of this worker.
    pub async fn panic_on_next_scan(&self, worker_id: &str) {
        self.sessions
            .lock()
            .await
            .entry(worker_id.to_string())
            .or_default()
            .panic_next_scan = true;
    }

    /// Render an extra item on every subsequent scan of this worker.
    pub async fn inject_item(&self, worker_id: &str, item: ScanItem) {
        self.sessions
            .lock()
            .await
            .entry(worker_id.to_string())
            .or_default()
            .injected
            .push(item);
    }

    /// Accepted submissions, oldest first, up to the most recent 256.
    pub async fn submissions(&self, worker_id: &str) -> Vec<Submission> {
        self.sessions
            .lock()
            .await
            .get(worker_id)
            .map(|s| s.submissions.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Highest number of submissions ever in flight at once on this worker.
    pub async fn max_concurrent_submits(&self, worker_id: &str) -> u32 {
        self.sessions
            .lock()
            .await
            .get(worker_id)
            .map(|s| s.max_active_submits)
            .unwrap_or(0)
    }

    pub async fn is_open(&self, worker_id: &str) -> bool {
        self.sessions
            .lock()
            .await
            .get(worker_id)
            .is_some_and(|s| s.open)
    }

    pub async fn close_calls(&self, worker_id: &str) -> u32 {
        self.sessions
            .lock()
            .await
            .get(worker_id)
            .map(|s| s.close_calls)
            .unwrap_or(0)
    }

    fn render(&self, worker_id: &str, generation: &Generation, now: Instant) -> ScanItem {
        let elapsed = now.saturating_duration_since(generation.submitted_at);
        let text = generation.submission.prompt.clone();

        if elapsed < self.queue_time {
            return ScanItem {
                text,
                queued_upstream: true,
                ..Default::default()
            };
        }
        let running = elapsed - self.queue_time;
        if running < self.generation_time {
            let percent = (running.as_secs_f64() / self.generation_time.as_secs_f64() * 100.0)
                .clamp(0.0, 99.0) as u8;
            return ScanItem {
                text,
                progress_indicator: true,
                percent: Some(percent),
                ..Default::default()
            };
        }
        ScanItem {
            text,
            artifact: Some(Self::artifact_for(worker_id, &generation.submission)),
            ..Default::default()
        }
    }
}

#[async_trait]
impl SessionDriver for SimulatedDriver {
    async fn ensure_session(&self, worker: &WorkerConfig) -> Result<SessionStatus, DriverError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(worker.id.clone()).or_default();
        session.open = true;
        if session.valid {
            Ok(SessionStatus::Authenticated)
        } else {
            Ok(SessionStatus::NeedsAuthentication)
        }
    }

    async fn submit_job(
        &self,
        worker_id: &str,
        submission: &Submission,
    ) -> Result<SubmitReceipt, DriverError> {
        {
            let mut sessions = self.sessions.lock().await;
            let session = match sessions.get_mut(worker_id) {
                Some(s) if s.open => s,
                _ => {
                    return Err(DriverError::NoSession {
                        worker_id: worker_id.to_string(),
                    });
                }
            };
            if !session.valid {
                return Err(DriverError::SessionInvalid {
                    worker_id: worker_id.to_string(),
                });
            }
            session.active_submits += 1;
            session.max_active_submits = session.max_active_submits.max(session.active_submits);
        }

        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }

        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(worker_id) else {
            return Err(DriverError::NoSession {
                worker_id: worker_id.to_string(),
            });
        };
        session.active_submits = session.active_submits.saturating_sub(1);

        if let Some(error) = session.scripted_failures.pop_front() {
            debug!(worker_id, job_id = %submission.job_id, %error, "Simulated submission failure");
            return Err(error);
        }

        if session.submissions.len() >= SUBMISSION_LOG {
            session.submissions.pop_front();
        }
        session.submissions.push_back(submission.clone());
        session.generations.push(Generation {
            submission: submission.clone(),
            submitted_at: Instant::now(),
        });
        if let Some(credits) = session.credits.as_mut() {
            *credits = credits.saturating_sub(1);
        }
        Ok(SubmitReceipt {
            external_ref: Some(format!("sim-{}", submission.job_id.simple())),
        })
    }

    async fn scan_for_completion(&self, worker_id: &str) -> Result<Vec<ScanItem>, DriverError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(worker_id) {
            if std::mem::take(&mut session.panic_next_scan) {
                drop(sessions);
                panic!("simulated scan crash for worker {worker_id}");
            }
        }
        let session = match sessions.get_mut(worker_id) {
            Some(s) if s.open => s,
            _ => {
                return Err(DriverError::NoSession {
                    worker_id: worker_id.to_string(),
                });
            }
        };
        if !session.valid {
            return Err(DriverError::SessionInvalid {
                worker_id: worker_id.to_string(),
            });
        }

        let now = Instant::now();
        session.trim_history(now, self.queue_time + self.generation_time);
        let mut items: Vec<ScanItem> = session
            .generations
            .iter()
            .map(|g| self.render(worker_id, g, now))
            .collect();
        items.extend(session.injected.iter().cloned());
        Ok(items)
    }

    async fn remaining_credits(&self, worker_id: &str) -> Result<Option<u32>, DriverError> {
        let sessions = self.sessions.lock().await;
        match sessions.get(worker_id) {
            Some(s) if s.open => Ok(s.credits),
            _ => Err(DriverError::NoSession {
                worker_id: worker_id.to_string(),
            }),
        }
    }

    async fn close(&self, worker_id: &str) -> Result<(), DriverError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(worker_id) {
            session.open = false;
            session.active_submits = 0;
            session.close_calls += 1;
        }
        Ok(())
    }
}
