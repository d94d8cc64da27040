//! Interfaces to the services the pipeline drives.
//!
//! - [`JobClient`]: runs the transform job and the catalog-refresh task
//! - [`Notifier`]: delivers the terminal status message of a run
//! - [`Storage`]: reads raw partitions and writes processed/quarantine output
//!
//! Local implementations live in [`local`] and [`notifier`].

pub mod local;
pub mod notifier;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taxi_quality::{Record, RunId};
use thiserror::Error;

use crate::engine::PipelineState;
use crate::error::PipelineResult;

pub use local::{LocalJobClient, LocalStorage, ObjectFormat};
pub use notifier::{LogNotifier, WebhookNotifier};

/// Parameters passed to a job or task, rendered as `key=value` arguments.
pub type JobParams = BTreeMap<String, String>;

/// Error classes reported by the job service.
///
/// The orchestrator selects a retry policy by class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Too many concurrent runs of the job.
    ConcurrencyLimitExceeded,
    /// Service-side failure.
    InternalServiceError,
    /// The task is already running.
    AlreadyRunning,
    /// The service call timed out.
    OperationTimeout,
    /// Anything else; never retried.
    Other,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConcurrencyLimitExceeded => write!(f, "concurrency_limit_exceeded"),
            Self::InternalServiceError => write!(f, "internal_service_error"),
            Self::AlreadyRunning => write!(f, "already_running"),
            Self::OperationTimeout => write!(f, "operation_timeout"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Typed error from the job service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{class}: {message}")]
pub struct JobError {
    pub class: ErrorClass,
    pub message: String,
}

impl JobError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

/// Terminal status of a synchronous job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalStatus {
    Succeeded,
    Failed,
    Timeout,
    Stopped,
}

impl TerminalStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TerminalStatus::Succeeded)
    }
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Outcome of [`JobClient::run_sync`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRunOutcome {
    /// Identifier assigned by the job service.
    pub job_run_id: String,
    pub status: TerminalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Handle to an asynchronously started task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_name: String,
    pub task_id: String,
}

/// State reported by [`JobClient::poll`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Running,
    Ready,
    Failed { message: String },
}

/// Job execution service: the transform job and the catalog-refresh task.
#[async_trait]
pub trait JobClient: Send + Sync {
    /// Run a job and wait for its terminal status.
    async fn run_sync(&self, job_name: &str, params: &JobParams) -> Result<JobRunOutcome, JobError>;

    /// Start a task without waiting for it.
    async fn start_async(&self, task_name: &str, params: &JobParams) -> Result<TaskHandle, JobError>;

    /// Query the state of a started task.
    async fn poll(&self, handle: &TaskHandle) -> Result<TaskState, JobError>;

    /// Stop the in-flight run of `job_name` started for `run_id`.
    async fn stop_job(&self, job_name: &str, run_id: &RunId) -> Result<(), JobError>;

    /// Stop a started task.
    async fn stop_task(&self, handle: &TaskHandle) -> Result<(), JobError>;
}

/// Final outcome of a run, as reported to the notification channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    PartialSuccess,
    Failure,
    ValidationFailure,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::PartialSuccess => write!(f, "PARTIAL_SUCCESS"),
            Self::Failure => write!(f, "FAILURE"),
            Self::ValidationFailure => write!(f, "VALIDATION_FAILURE"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Terminal status message for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub run_id: RunId,
    pub status: RunStatus,
    pub final_state: PipelineState,
    pub subject: String,
    /// `bucket/key` of the object that triggered the run.
    pub source: String,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transform_job_run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog_task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// Delivery channel for status messages.
///
/// Errors are returned for logging only; the orchestrator never retries or
/// fails a run because of them.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &StatusMessage) -> PipelineResult<()>;
}

/// Object storage holding raw, processed and quarantine partitions.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Whether `key` exists in `bucket`.
    async fn object_exists(&self, bucket: &str, key: &str) -> PipelineResult<bool>;

    /// Read every record under `location` (a single object or a prefix).
    async fn read_partition(&self, location: &str) -> PipelineResult<Vec<Record>>;

    /// Append `rows` as a new object under `location`.
    async fn write_partition(&self, location: &str, rows: &[serde_json::Value]) -> PipelineResult<()>;
}
