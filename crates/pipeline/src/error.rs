//! Error types for the taxi pipeline.

use taxi_quality::QualityError;
use thiserror::Error;

use crate::client::JobError;
use crate::engine::TransitionError;

/// Pipeline-level errors.
///
/// Data-quality violations are not errors: they are quarantined records.
/// Transient job failures are retried inside the orchestrator and only reach
/// this type when surfaced to a caller outside a run.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed trigger input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Job or task service error
    #[error("Job error: {0}")]
    Job(#[from] JobError),

    /// Storage read/write error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Notification delivery error
    #[error("Notification error: {0}")]
    Notify(String),

    /// Illegal state machine transition
    #[error("State machine error: {0}")]
    Transition(#[from] TransitionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rule set error
    #[error("Quality error: {0}")]
    Quality(#[from] QualityError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using PipelineError.
pub type PipelineResult<T> = Result<T, PipelineError>;

impl From<envy::Error> for PipelineError {
    fn from(err: envy::Error) -> Self {
        PipelineError::Config(err.to_string())
    }
}
