//! Jobs: request payloads, status state machine, and tracking tokens.

pub mod model;
pub mod tracking;

pub use model::{DEFAULT_JOB_COST, Job, JobRequest, JobStatus, JobUpdate, NewJob, Progress};
pub use tracking::TrackingToken;
