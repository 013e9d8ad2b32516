//! genpool: worker-pool orchestration for a credit-metered generation service.

pub mod admin;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod store;
pub mod workers;

pub use config::{EngineConfig, ScoreWeights};
pub use engine::Engine;
pub use error::{Error, Result};
