//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Weights for the worker assignment score.
///
/// `score = priority * priority_weight - load_ratio * load_weight + affinity`,
/// where affinity adds `credit_affinity` for a worker known to hold credits
/// and `model_affinity` for a worker that explicitly lists the job's model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub priority: f64,
    pub load: f64,
    pub credit_affinity: f64,
    pub model_affinity: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            priority: 10.0,
            load: 100.0,
            credit_affinity: 15.0,
            model_affinity: 10.0,
        }
    }
}

/// Orchestration engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Persisted worker configuration file.
    pub workers_file: PathBuf,
    /// Maximum pending jobs pulled per scheduler cycle.
    pub batch_size: usize,
    /// Scheduler wait between cycles while there is load or pending work.
    pub busy_interval: Duration,
    /// Idle backoff grows by this step per consecutive idle cycle.
    pub idle_backoff_step: Duration,
    /// Upper bound for the idle backoff.
    pub idle_backoff_cap: Duration,
    /// Submission attempts before a job is failed.
    pub submit_attempts: u32,
    /// Base delay between submission attempts (multiplied by the attempt number).
    pub submit_backoff: Duration,
    /// Timeout for session, scan, credit and close calls.
    pub call_timeout: Duration,
    /// Timeout for a single submission call.
    pub submit_timeout: Duration,
    /// Completion scanner interval.
    pub scan_interval: Duration,
    /// Session health-check interval.
    pub session_check_interval: Duration,
    /// Stuck-job reaper interval.
    pub reaper_interval: Duration,
    /// A `generating` job older than this is failed by the reaper.
    pub generation_timeout: Duration,
    /// A `processing` job older than this is failed by the reaper.
    pub submission_timeout: Duration,
    /// Watchdog check interval.
    pub watchdog_interval: Duration,
    /// Uptime after which the whole pool is rebuilt (zero disables).
    pub restart_interval: Duration,
    /// Longest a due restart may wait for in-flight submissions.
    pub restart_grace: Duration,
    /// Seen-artifact set is cleared once it holds this many entries.
    pub seen_artifact_capacity: usize,
    /// Seen-artifact set is cleared at least this often.
    pub seen_artifact_ttl: Duration,
    /// Attempts at recording a refund before giving up and logging.
    pub refund_attempts: u32,
    /// Assignment score weights.
    pub weights: ScoreWeights,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers_file: PathBuf::from("./data/workers.json"),
            batch_size: 10,
            busy_interval: Duration::from_secs(2),
            idle_backoff_step: Duration::from_secs(5),
            idle_backoff_cap: Duration::from_secs(30),
            submit_attempts: 3,
            submit_backoff: Duration::from_secs(2),
            call_timeout: Duration::from_secs(30),
            submit_timeout: Duration::from_secs(90),
            scan_interval: Duration::from_secs(10),
            session_check_interval: Duration::from_secs(300), // 5 minutes
            reaper_interval: Duration::from_secs(60),
            generation_timeout: Duration::from_secs(30 * 60),
            submission_timeout: Duration::from_secs(10 * 60),
            watchdog_interval: Duration::from_secs(30),
            restart_interval: Duration::from_secs(3600), // 1 hour
            restart_grace: Duration::from_secs(300),
            seen_artifact_capacity: 1000,
            seen_artifact_ttl: Duration::from_secs(3600),
            refund_attempts: 3,
            weights: ScoreWeights::default(),
        }
    }
}

impl EngineConfig {
    /// Build config from `GENPOOL_*` environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let workers_file = std::env::var("GENPOOL_WORKERS_FILE")
            .map(PathBuf::from)
            .unwrap_or(defaults.workers_file);

        let weights = ScoreWeights {
            priority: env_parse("GENPOOL_WEIGHT_PRIORITY").unwrap_or(defaults.weights.priority),
            load: env_parse("GENPOOL_WEIGHT_LOAD").unwrap_or(defaults.weights.load),
            credit_affinity: env_parse("GENPOOL_WEIGHT_CREDIT")
                .unwrap_or(defaults.weights.credit_affinity),
            model_affinity: env_parse("GENPOOL_WEIGHT_MODEL")
                .unwrap_or(defaults.weights.model_affinity),
        };

        Self {
            workers_file,
            batch_size: env_parse("GENPOOL_BATCH_SIZE").unwrap_or(defaults.batch_size),
            busy_interval: env_secs("GENPOOL_BUSY_INTERVAL_SECS").unwrap_or(defaults.busy_interval),
            idle_backoff_step: env_secs("GENPOOL_IDLE_BACKOFF_STEP_SECS")
                .unwrap_or(defaults.idle_backoff_step),
            idle_backoff_cap: env_secs("GENPOOL_IDLE_BACKOFF_CAP_SECS")
                .unwrap_or(defaults.idle_backoff_cap),
            submit_attempts: env_parse("GENPOOL_SUBMIT_ATTEMPTS").unwrap_or(defaults.submit_attempts),
            submit_backoff: env_secs("GENPOOL_SUBMIT_BACKOFF_SECS").unwrap_or(defaults.submit_backoff),
            call_timeout: env_secs("GENPOOL_CALL_TIMEOUT_SECS").unwrap_or(defaults.call_timeout),
            submit_timeout: env_secs("GENPOOL_SUBMIT_TIMEOUT_SECS").unwrap_or(defaults.submit_timeout),
            scan_interval: env_secs("GENPOOL_SCAN_INTERVAL_SECS").unwrap_or(defaults.scan_interval),
            session_check_interval: env_secs("GENPOOL_SESSION_CHECK_SECS")
                .unwrap_or(defaults.session_check_interval),
            reaper_interval: env_secs("GENPOOL_REAPER_INTERVAL_SECS")
                .unwrap_or(defaults.reaper_interval),
            generation_timeout: env_secs("GENPOOL_GENERATION_TIMEOUT_SECS")
                .unwrap_or(defaults.generation_timeout),
            submission_timeout: env_secs("GENPOOL_SUBMISSION_TIMEOUT_SECS")
                .unwrap_or(defaults.submission_timeout),
            watchdog_interval: env_secs("GENPOOL_WATCHDOG_INTERVAL_SECS")
                .unwrap_or(defaults.watchdog_interval),
            restart_interval: env_secs("GENPOOL_RESTART_INTERVAL_SECS")
                .unwrap_or(defaults.restart_interval),
            restart_grace: env_secs("GENPOOL_RESTART_GRACE_SECS").unwrap_or(defaults.restart_grace),
            seen_artifact_capacity: env_parse("GENPOOL_SEEN_ARTIFACT_CAPACITY")
                .unwrap_or(defaults.seen_artifact_capacity),
            seen_artifact_ttl: env_secs("GENPOOL_SEEN_ARTIFACT_TTL_SECS")
                .unwrap_or(defaults.seen_artifact_ttl),
            refund_attempts: env_parse("GENPOOL_REFUND_ATTEMPTS").unwrap_or(defaults.refund_attempts),
            weights,
        }
    }

    /// Reject values that would stall or spin the loops.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be at least 1"));
        }
        if self.submit_attempts == 0 {
            return Err(invalid("submit_attempts", "must be at least 1"));
        }
        if self.refund_attempts == 0 {
            return Err(invalid("refund_attempts", "must be at least 1"));
        }
        if self.idle_backoff_cap < self.busy_interval {
            return Err(invalid(
                "idle_backoff_cap",
                "must not be shorter than busy_interval",
            ));
        }
        for (key, value) in [
            ("busy_interval", self.busy_interval),
            ("call_timeout", self.call_timeout),
            ("submit_timeout", self.submit_timeout),
            ("scan_interval", self.scan_interval),
            ("session_check_interval", self.session_check_interval),
            ("reaper_interval", self.reaper_interval),
            ("watchdog_interval", self.watchdog_interval),
        ] {
            if value.is_zero() {
                return Err(invalid(key, "must be greater than zero"));
            }
        }
        if self.submission_timeout <= self.submit_retry_budget() {
            return Err(invalid(
                "submission_timeout",
                "must exceed one job's submit retry budget \
                 (submit_attempts x submit_timeout plus backoff)",
            ));
        }
        if self.seen_artifact_capacity == 0 {
            return Err(invalid("seen_artifact_capacity", "must be at least 1"));
        }
        Ok(())
    }

    /// Longest one job's own submit retries can keep it in `processing`:
    /// every attempt timing out plus the largest backoff between them.
    /// Time spent waiting for the worker's submission lock is not included.
    pub fn submit_retry_budget(&self) -> Duration {
        let attempts = self.submit_attempts.max(1);
        let steps = u64::from(attempts) * u64::from(attempts - 1) / 2;
        let backoff_steps = u32::try_from(steps).unwrap_or(u32::MAX);
        let backoff = self.submit_backoff.saturating_mul(backoff_steps);
        self.submit_timeout
            .saturating_mul(attempts)
            .saturating_add(backoff)
            .saturating_add(backoff / 5)
    }

    /// Whether periodic full restarts are enabled.
    pub fn restarts_enabled(&self) -> bool {
        !self.restart_interval.is_zero()
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.submit_attempts, 3);
        assert_eq!(config.generation_timeout, Duration::from_secs(1800));
        assert_eq!(config.submission_timeout, Duration::from_secs(600));
        assert!(config.restarts_enabled());
    }

    #[test]
    fn zero_batch_rejected() {
        let config = EngineConfig {
            batch_size: 0,
            ..EngineConfig::default()
        };
        match config.validate() {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, "batch_size"),
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn retry_budget_covers_every_attempt_and_backoff() {
        let config = EngineConfig::default();
        // 3 x 90s attempts, 2s + 4s backoff, 20% jitter on the backoff.
        assert_eq!(config.submit_retry_budget(), Duration::from_millis(277_200));
    }

    #[test]
    fn submission_timeout_must_exceed_retry_budget() {
        // Longer than one attempt, shorter than all three.
        let config = EngineConfig {
            submission_timeout: Duration::from_secs(200),
            ..EngineConfig::default()
        };
        match config.validate() {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, "submission_timeout"),
            other => panic!("expected InvalidValue, got {other:?}"),
        }

        let config = EngineConfig {
            submission_timeout: Duration::from_secs(278),
            ..EngineConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_restart_interval_disables_restarts() {
        let config = EngineConfig {
            restart_interval: Duration::ZERO,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_ok());
        assert!(!config.restarts_enabled());
    }
}
