//! Drives one pipeline run from trigger to status message.
//!
//! The orchestrator owns the run's [`ExecutionState`] and performs the work
//! attached to each state: input validation, the synchronous transform job,
//! the catalog refresh with its poll loop, and the final notification. Every
//! wait (job, poll, backoff) races the run's cancellation token; on cancel the
//! in-flight job or task is stopped and a `cancelled` status is reported.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use taxi_quality::RunId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::retry::{RetryPolicies, RetryScope, RetryTracker};
use super::state::{ExecutionState, PipelineState};
use super::transitions::PipelineEvent;
use crate::client::{
    JobClient, JobParams, Notifier, RunStatus, StatusMessage, Storage, TaskHandle, TaskState,
};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::trigger::{InputValidator, TriggerEvent, ValidatorConfig};

/// Settings for [`PipelineOrchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub validator: ValidatorConfig,
    pub transform_job_name: String,
    pub catalog_task_name: String,
    pub processed_prefix: String,
    pub quarantine_prefix: String,
    /// Delay before each catalog poll.
    pub poll_interval: Duration,
    /// Polls after which the catalog refresh counts as failed.
    pub max_polls: u32,
    /// How long a cancelled run waits for an in-flight catalog start, so the
    /// task it may have created can be stopped.
    pub cancel_grace: Duration,
    pub retry: RetryPolicies,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        PipelineConfig::default().orchestrator_config()
    }
}

/// Outcome of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub history: Vec<PipelineState>,
    pub transform_job_run_id: Option<String>,
    pub catalog_task_id: Option<String>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

pub struct PipelineOrchestrator {
    config: OrchestratorConfig,
    validator: InputValidator,
    jobs: Arc<dyn JobClient>,
    notifier: Arc<dyn Notifier>,
    storage: Arc<dyn Storage>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        jobs: Arc<dyn JobClient>,
        notifier: Arc<dyn Notifier>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let validator = InputValidator::new(config.validator.clone());
        Self {
            config,
            validator,
            jobs,
            notifier,
            storage,
        }
    }

    /// Run the pipeline for `trigger` until it reaches `Done`.
    ///
    /// Every call is a new run with a fresh run id.
    pub async fn run(&self, trigger: TriggerEvent, cancel: CancellationToken) -> RunSummary {
        let started = Instant::now();
        let mut exec = ExecutionState::new(RunId::new(), trigger, Utc::now());
        let mut reported = RunStatus::Failure;

        info!(
            run_id = %exec.run_id(),
            source = %exec.context().trigger.location(),
            "Pipeline run started"
        );

        loop {
            let state = exec.state();
            let event = match state {
                PipelineState::ValidatingInput => self.validate_input(&exec, &cancel).await,
                PipelineState::TransformRunning => self.run_transform(&exec, &cancel).await,
                PipelineState::CatalogRefreshing => self.refresh_catalog(&mut exec, &cancel).await,
                PipelineState::ValidationFailed
                | PipelineState::TransformSucceeded
                | PipelineState::TransformFailed
                | PipelineState::CatalogReady
                | PipelineState::CatalogFailed => {
                    if cancel.is_cancelled() {
                        PipelineEvent::Cancel
                    } else {
                        PipelineEvent::Advance
                    }
                }
                PipelineState::NotifyingSuccess
                | PipelineState::NotifyingPartialSuccess
                | PipelineState::NotifyingFailure
                | PipelineState::NotifyingValidationFailure
                | PipelineState::Cancelled => {
                    let status = state.run_status().unwrap_or(RunStatus::Failure);
                    self.notify(&exec, status, started.elapsed()).await;
                    reported = status;
                    PipelineEvent::Notified
                }
                PipelineState::Done => break,
            };

            match exec.apply(event) {
                Ok(next) => debug!(run_id = %exec.run_id(), from = %state, to = %next, "State transition"),
                Err(err) => {
                    let err = PipelineError::from(err);
                    error!(run_id = %exec.run_id(), state = %state, error = %err, "Aborting run");
                    exec.abort(err.to_string());
                }
            }
        }

        let context = exec.context();
        let summary = RunSummary {
            run_id: context.run_id.clone(),
            status: reported,
            history: exec.history().to_vec(),
            transform_job_run_id: context.transform_job_run_id.clone(),
            catalog_task_id: context.catalog_task.as_ref().map(|h| h.task_id.clone()),
            error: context.error.clone(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            target: "taxi_etl.orchestrator",
            run_id = %summary.run_id,
            status = %summary.status,
            states = summary.history.len(),
            duration_ms = summary.elapsed_ms,
            "Pipeline run finished"
        );

        summary
    }

    async fn validate_input(&self, exec: &ExecutionState, cancel: &CancellationToken) -> PipelineEvent {
        let trigger = &exec.context().trigger;
        let report = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PipelineEvent::Cancel,
            report = self.validator.validate(trigger, self.storage.as_ref()) => report,
        };

        if report.is_valid() {
            PipelineEvent::InputAccepted
        } else {
            PipelineEvent::InputRejected {
                reason: report.message(),
            }
        }
    }

    fn transform_params(&self, exec: &ExecutionState) -> JobParams {
        let context = exec.context();
        JobParams::from([
            ("run_id".to_string(), context.run_id.to_string()),
            ("bucket".to_string(), context.trigger.bucket.clone()),
            ("key".to_string(), context.trigger.key.clone()),
            ("processed_prefix".to_string(), self.config.processed_prefix.clone()),
            ("quarantine_prefix".to_string(), self.config.quarantine_prefix.clone()),
        ])
    }

    async fn run_transform(&self, exec: &ExecutionState, cancel: &CancellationToken) -> PipelineEvent {
        let run_id = exec.run_id();
        let job_name = &self.config.transform_job_name;
        let params = self.transform_params(exec);
        let mut retries = RetryTracker::new(RetryScope::Transform, &self.config.retry);

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.stop_transform(run_id).await;
                    return PipelineEvent::Cancel;
                }
                result = self.jobs.run_sync(job_name, &params) => result,
            };

            match result {
                Ok(outcome) => {
                    info!(
                        run_id = %run_id,
                        job_run_id = %outcome.job_run_id,
                        status = %outcome.status,
                        "Transform job finished"
                    );
                    return PipelineEvent::TransformCompleted {
                        job_run_id: outcome.job_run_id,
                        status: outcome.status,
                        message: outcome.error_message,
                    };
                }
                Err(err) => match retries.next_retry(err.class) {
                    Some((attempt, delay)) => {
                        warn!(
                            run_id = %run_id,
                            class = %err.class,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err.message,
                            "Transform job failed, retrying"
                        );
                        if !sleep_or_cancel(delay, cancel).await {
                            return PipelineEvent::Cancel;
                        }
                    }
                    None => {
                        error!(run_id = %run_id, class = %err.class, error = %err.message, "Transform job failed");
                        return PipelineEvent::TransformErrored {
                            error: err.to_string(),
                        };
                    }
                },
            }
        }
    }

    async fn refresh_catalog(&self, exec: &mut ExecutionState, cancel: &CancellationToken) -> PipelineEvent {
        let run_id = exec.run_id().clone();
        let task_name = &self.config.catalog_task_name;
        let params = JobParams::from([
            ("run_id".to_string(), run_id.to_string()),
            ("bucket".to_string(), exec.context().trigger.bucket.clone()),
            ("processed_prefix".to_string(), self.config.processed_prefix.clone()),
        ]);
        let mut retries = RetryTracker::new(RetryScope::Catalog, &self.config.retry);

        let handle = loop {
            let start = self.jobs.start_async(task_name, &params);
            tokio::pin!(start);
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = &mut start => Some(result),
            };

            let Some(result) = result else {
                match tokio::time::timeout(self.config.cancel_grace, start).await {
                    Ok(Ok(handle)) => {
                        info!(run_id = %run_id, task_id = %handle.task_id, "Stopping catalog task started during cancellation");
                        self.stop_task(&handle).await;
                    }
                    Ok(Err(err)) => {
                        debug!(run_id = %run_id, error = %err, "Catalog task start failed during cancellation");
                    }
                    Err(_) => warn!(
                        run_id = %run_id,
                        task = %task_name,
                        grace_ms = self.config.cancel_grace.as_millis() as u64,
                        "Catalog task start still pending after cancel; task may keep running"
                    ),
                }
                return PipelineEvent::Cancel;
            };

            match result {
                Ok(handle) => break handle,
                Err(err) => match retries.next_retry(err.class) {
                    Some((attempt, delay)) => {
                        warn!(
                            run_id = %run_id,
                            class = %err.class,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err.message,
                            "Catalog task start failed, retrying"
                        );
                        if !sleep_or_cancel(delay, cancel).await {
                            return PipelineEvent::Cancel;
                        }
                    }
                    None => {
                        error!(run_id = %run_id, class = %err.class, error = %err.message, "Catalog task start failed");
                        return PipelineEvent::CatalogErrored {
                            error: err.to_string(),
                        };
                    }
                },
            }
        };

        info!(run_id = %run_id, task = %handle.task_name, task_id = %handle.task_id, "Catalog task started");
        exec.set_catalog_task(handle.clone());

        for poll in 1..=self.config.max_polls {
            if !sleep_or_cancel(self.config.poll_interval, cancel).await {
                self.stop_task(&handle).await;
                return PipelineEvent::Cancel;
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.stop_task(&handle).await;
                    return PipelineEvent::Cancel;
                }
                result = self.jobs.poll(&handle) => result,
            };

            match result {
                Ok(TaskState::Running) => {
                    debug!(run_id = %run_id, task_id = %handle.task_id, poll, "Catalog task still running");
                }
                Ok(TaskState::Ready) => {
                    info!(run_id = %run_id, task_id = %handle.task_id, poll, "Catalog refresh completed");
                    return PipelineEvent::CatalogCompleted;
                }
                Ok(TaskState::Failed { message }) => {
                    warn!(run_id = %run_id, task_id = %handle.task_id, error = %message, "Catalog task failed");
                    return PipelineEvent::CatalogErrored {
                        error: format!("catalog task failed: {}", message),
                    };
                }
                Err(err) => match retries.next_retry(err.class) {
                    Some((attempt, delay)) => {
                        warn!(
                            run_id = %run_id,
                            class = %err.class,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err.message,
                            "Catalog poll failed, retrying"
                        );
                        if !sleep_or_cancel(delay, cancel).await {
                            self.stop_task(&handle).await;
                            return PipelineEvent::Cancel;
                        }
                    }
                    None => {
                        self.stop_task(&handle).await;
                        return PipelineEvent::CatalogErrored {
                            error: err.to_string(),
                        };
                    }
                },
            }
        }

        warn!(run_id = %run_id, task_id = %handle.task_id, max_polls = self.config.max_polls, "Catalog refresh timed out");
        self.stop_task(&handle).await;
        PipelineEvent::CatalogErrored {
            error: format!(
                "catalog task still running after {} polls",
                self.config.max_polls
            ),
        }
    }

    async fn stop_transform(&self, run_id: &RunId) {
        let job_name = &self.config.transform_job_name;
        match self.jobs.stop_job(job_name, run_id).await {
            Ok(()) => info!(run_id = %run_id, job = %job_name, "Transform job stopped"),
            Err(e) => warn!(run_id = %run_id, job = %job_name, error = %e, "Failed to stop transform job"),
        }
    }

    async fn stop_task(&self, handle: &TaskHandle) {
        if let Err(e) = self.jobs.stop_task(handle).await {
            warn!(task_id = %handle.task_id, error = %e, "Failed to stop catalog task");
        }
    }

    async fn notify(&self, exec: &ExecutionState, status: RunStatus, elapsed: Duration) {
        let context = exec.context();
        let message = StatusMessage {
            run_id: context.run_id.clone(),
            status,
            final_state: exec.state(),
            subject: subject_for(status).to_string(),
            source: context.trigger.location(),
            elapsed_ms: elapsed.as_millis() as u64,
            transform_job_run_id: context.transform_job_run_id.clone(),
            catalog_task_id: context.catalog_task.as_ref().map(|h| h.task_id.clone()),
            error: context.error.clone(),
            sent_at: Utc::now(),
        };

        if let Err(e) = self.notifier.send(&message).await {
            warn!(run_id = %context.run_id, status = %status, error = %e, "Status notification failed");
        }
    }
}

fn subject_for(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Success => "Taxi ETL pipeline succeeded",
        RunStatus::PartialSuccess => "Taxi ETL pipeline partially succeeded: catalog refresh failed",
        RunStatus::Failure => "Taxi ETL pipeline failed",
        RunStatus::ValidationFailure => "Taxi ETL input validation failed",
        RunStatus::Cancelled => "Taxi ETL pipeline cancelled",
    }
}

/// Sleep for `delay`; returns `false` if cancelled first.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
