//! Orchestration engine: state machine, retry policies and the run driver.

pub mod orchestrator;
pub mod retry;
pub mod state;
pub mod transitions;

pub use orchestrator::{OrchestratorConfig, PipelineOrchestrator, RunSummary};
pub use retry::{RetryPolicies, RetryPolicy, RetryScope, RetryTracker};
pub use state::{ExecutionState, PipelineState, RunContext};
pub use transitions::{transition, PipelineEvent, TransitionError};
