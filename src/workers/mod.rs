//! Worker pool: configuration, live state and assignment scoring.

pub mod model;
pub mod registry;
pub mod scoring;

pub use model::{WorkerConfig, WorkerPatch, WorkerState, WorkerStatus};
pub use registry::{LoadReport, RejectedEntry, WorkerRegistry};
