//! Error types for genpool.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the orchestration engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid job transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

/// Errors raised by a session driver call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("Driver call {op} timed out after {timeout:?}")]
    Timeout { op: String, timeout: Duration },

    #[error("External service temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Session for worker {worker_id} is not authenticated")]
    SessionInvalid { worker_id: String },

    #[error("No open session for worker {worker_id}")]
    NoSession { worker_id: String },

    #[error("Submission rejected: {0}")]
    Rejected(String),

    #[error("Driver transport error: {0}")]
    Transport(String),
}

impl DriverError {
    /// Transient failures worth another attempt within the retry bound.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Unavailable(_) | Self::Transport(_) | Self::NoSession { .. }
        )
    }

    /// The worker's credential session has expired and needs re-authentication.
    pub fn is_session_invalid(&self) -> bool {
        matches!(self, Self::SessionInvalid { .. })
    }
}

/// Worker registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Worker {id} not found")]
    UnknownWorker { id: String },

    #[error("Worker {id} already exists")]
    DuplicateWorker { id: String },

    #[error("Invalid worker {id}: {reason}")]
    InvalidWorker { id: String, reason: String },

    #[error("Failed to parse worker configuration: {0}")]
    Parse(String),

    #[error("Failed to persist worker configuration: {0}")]
    Persist(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} kept changing state under contention, gave up after {attempts} attempts")]
    Contended { id: Uuid, attempts: u32 },

    #[error("Invalid job request: {0}")]
    InvalidRequest(String),
}

/// Billing ledger errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Refund rejected: {0}")]
    Rejected(String),

    #[error("Ledger storage error: {0}")]
    Storage(String),
}

/// Engine lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine is not running")]
    NotRunning,

    #[error("Engine is already running")]
    AlreadyRunning,

    #[error("No active workers configured; engine cannot start")]
    NoActiveWorkers,
}

/// Result type alias for genpool.
pub type Result<T> = std::result::Result<T, Error>;
