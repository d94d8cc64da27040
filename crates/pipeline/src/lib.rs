//! Taxi ETL pipeline orchestration.
//!
//! A run starts from a [`TriggerEvent`] and moves through a fixed state
//! machine: validate the raw object, run the transform job (quality checks,
//! processed and quarantine output), refresh the catalog, and report one
//! status message. Transient job errors are retried per error class with
//! exponential backoff; a failed catalog refresh still counts as partial
//! success because the processed data is already written.

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod transform;
pub mod trigger;

pub use client::{
    ErrorClass, JobClient, JobError, JobParams, JobRunOutcome, LocalJobClient, LocalStorage,
    LogNotifier, Notifier, ObjectFormat, RunStatus, StatusMessage, Storage, TaskHandle, TaskState,
    TerminalStatus, WebhookNotifier,
};
pub use config::PipelineConfig;
pub use engine::{
    OrchestratorConfig, PipelineEvent, PipelineOrchestrator, PipelineState, RetryPolicies,
    RetryPolicy, RunSummary,
};
pub use error::{PipelineError, PipelineResult};
pub use transform::{OutputLayout, TransformJob, TransformSummary};
pub use trigger::{parse_trigger_document, InputValidator, TriggerEvent, ValidationReport};
