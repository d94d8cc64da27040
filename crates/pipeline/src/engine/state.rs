//! Run state tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taxi_quality::RunId;

use super::transitions::{transition, PipelineEvent, TransitionError};
use crate::client::{RunStatus, TaskHandle, TaskState, TerminalStatus};
use crate::trigger::TriggerEvent;

/// Pipeline run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    ValidatingInput,
    ValidationFailed,
    TransformRunning,
    TransformSucceeded,
    TransformFailed,
    CatalogRefreshing,
    CatalogReady,
    CatalogFailed,
    NotifyingSuccess,
    NotifyingPartialSuccess,
    NotifyingFailure,
    NotifyingValidationFailure,
    Cancelled,
    Done,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done)
    }

    /// States whose only work is sending the status message.
    pub fn is_notifying(&self) -> bool {
        self.run_status().is_some()
    }

    /// Status reported by a notifying state.
    pub fn run_status(&self) -> Option<RunStatus> {
        match self {
            PipelineState::NotifyingSuccess => Some(RunStatus::Success),
            PipelineState::NotifyingPartialSuccess => Some(RunStatus::PartialSuccess),
            PipelineState::NotifyingFailure => Some(RunStatus::Failure),
            PipelineState::NotifyingValidationFailure => Some(RunStatus::ValidationFailure),
            PipelineState::Cancelled => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ValidatingInput => "validating_input",
            Self::ValidationFailed => "validation_failed",
            Self::TransformRunning => "transform_running",
            Self::TransformSucceeded => "transform_succeeded",
            Self::TransformFailed => "transform_failed",
            Self::CatalogRefreshing => "catalog_refreshing",
            Self::CatalogReady => "catalog_ready",
            Self::CatalogFailed => "catalog_failed",
            Self::NotifyingSuccess => "notifying_success",
            Self::NotifyingPartialSuccess => "notifying_partial_success",
            Self::NotifyingFailure => "notifying_failure",
            Self::NotifyingValidationFailure => "notifying_validation_failure",
            Self::Cancelled => "cancelled",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Data accumulated while a run progresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: RunId,
    pub trigger: TriggerEvent,
    pub transform_job_run_id: Option<String>,
    pub transform_status: Option<TerminalStatus>,
    pub catalog_task: Option<TaskHandle>,
    pub catalog_state: Option<TaskState>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Current state plus context of one run.
///
/// Owned by the orchestrator driving the run; only [`ExecutionState::apply`]
/// changes the state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    state: PipelineState,
    context: RunContext,
    history: Vec<PipelineState>,
}

impl ExecutionState {
    pub fn new(run_id: RunId, trigger: TriggerEvent, started_at: DateTime<Utc>) -> Self {
        Self {
            state: PipelineState::ValidatingInput,
            context: RunContext {
                run_id,
                trigger,
                transform_job_run_id: None,
                transform_status: None,
                catalog_task: None,
                catalog_state: None,
                error: None,
                started_at,
            },
            history: vec![PipelineState::ValidatingInput],
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn run_id(&self) -> &RunId {
        &self.context.run_id
    }

    /// Every state visited so far, in order.
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    /// Apply an event, recording its payload in the context.
    pub fn apply(&mut self, event: PipelineEvent) -> Result<PipelineState, TransitionError> {
        let next = transition(self.state, &event)?;
        match event {
            PipelineEvent::InputRejected { reason } => self.context.error = Some(reason),
            PipelineEvent::TransformCompleted {
                job_run_id,
                status,
                message,
            } => {
                self.context.transform_job_run_id = Some(job_run_id);
                self.context.transform_status = Some(status);
                if !status.is_success() {
                    self.context.error =
                        Some(message.unwrap_or_else(|| format!("transform job ended {}", status)));
                }
            }
            PipelineEvent::TransformErrored { error } => self.context.error = Some(error),
            PipelineEvent::CatalogCompleted => self.context.catalog_state = Some(TaskState::Ready),
            PipelineEvent::CatalogErrored { error } => {
                self.context.catalog_state = Some(TaskState::Failed {
                    message: error.clone(),
                });
                self.context.error = Some(error);
            }
            PipelineEvent::Cancel => {
                self.context.error = Some(format!("run cancelled during {}", self.state));
            }
            PipelineEvent::InputAccepted | PipelineEvent::Advance | PipelineEvent::Notified => {}
        }
        self.enter(next);
        Ok(next)
    }

    /// Record the catalog task started for this run.
    pub fn set_catalog_task(&mut self, handle: TaskHandle) {
        self.context.catalog_state = Some(TaskState::Running);
        self.context.catalog_task = Some(handle);
    }

    /// Route the run to failure reporting after an illegal transition.
    ///
    /// A run that was already reporting finishes instead, so a broken run
    /// never sends two messages.
    pub fn abort(&mut self, error: String) {
        self.context.error = Some(error);
        let next = if self.state.is_notifying() {
            PipelineState::Done
        } else {
            PipelineState::NotifyingFailure
        };
        self.enter(next);
    }

    fn enter(&mut self, next: PipelineState) {
        self.state = next;
        self.history.push(next);
    }
}
