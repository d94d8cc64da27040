//! Transition table for pipeline runs.

use thiserror::Error;

use super::state::PipelineState;
use crate::client::TerminalStatus;

/// Something that happened during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    InputAccepted,
    InputRejected { reason: String },
    TransformCompleted {
        job_run_id: String,
        status: TerminalStatus,
        message: Option<String>,
    },
    /// The transform job could not be run, after retries.
    TransformErrored { error: String },
    CatalogCompleted,
    CatalogErrored { error: String },
    /// Leave a pass-through state.
    Advance,
    /// The status message was sent (or its delivery failed).
    Notified,
    Cancel,
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InputAccepted => "input_accepted",
            Self::InputRejected { .. } => "input_rejected",
            Self::TransformCompleted { .. } => "transform_completed",
            Self::TransformErrored { .. } => "transform_errored",
            Self::CatalogCompleted => "catalog_completed",
            Self::CatalogErrored { .. } => "catalog_errored",
            Self::Advance => "advance",
            Self::Notified => "notified",
            Self::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Invalid transition from {from} on {event}")]
    Invalid {
        from: PipelineState,
        event: &'static str,
    },
}

/// Next state for `event` in `state`.
pub fn transition(
    state: PipelineState,
    event: &PipelineEvent,
) -> Result<PipelineState, TransitionError> {
    use PipelineEvent as E;
    use PipelineState as S;

    let next = match (state, event) {
        (S::ValidatingInput, E::InputAccepted) => S::TransformRunning,
        (S::ValidatingInput, E::InputRejected { .. }) => S::ValidationFailed,
        (S::ValidationFailed, E::Advance) => S::NotifyingValidationFailure,

        (S::TransformRunning, E::TransformCompleted { status, .. }) => {
            if status.is_success() {
                S::TransformSucceeded
            } else {
                S::TransformFailed
            }
        }
        (S::TransformRunning, E::TransformErrored { .. }) => S::TransformFailed,
        (S::TransformSucceeded, E::Advance) => S::CatalogRefreshing,
        (S::TransformFailed, E::Advance) => S::NotifyingFailure,

        (S::CatalogRefreshing, E::CatalogCompleted) => S::CatalogReady,
        (S::CatalogRefreshing, E::CatalogErrored { .. }) => S::CatalogFailed,
        (S::CatalogReady, E::Advance) => S::NotifyingSuccess,
        (S::CatalogFailed, E::Advance) => S::NotifyingPartialSuccess,

        (
            S::ValidatingInput
            | S::ValidationFailed
            | S::TransformRunning
            | S::TransformSucceeded
            | S::TransformFailed
            | S::CatalogRefreshing
            | S::CatalogReady
            | S::CatalogFailed,
            E::Cancel,
        ) => S::Cancelled,

        (
            S::NotifyingSuccess
            | S::NotifyingPartialSuccess
            | S::NotifyingFailure
            | S::NotifyingValidationFailure
            | S::Cancelled,
            E::Notified,
        ) => S::Done,

        (from, event) => {
            return Err(TransitionError::Invalid {
                from,
                event: event.name(),
            })
        }
    };
    Ok(next)
}
