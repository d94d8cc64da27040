use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use taxi_pipeline::{
    ErrorClass, JobClient, JobError, JobParams, JobRunOutcome, Notifier, OrchestratorConfig,
    PipelineError, PipelineOrchestrator, PipelineResult, PipelineState, RunStatus, StatusMessage,
    Storage, TaskHandle, TaskState, TerminalStatus, TriggerEvent,
};
use taxi_quality::{Record, RunId};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct ScriptedJobs {
    run_sync_results: Mutex<VecDeque<Result<JobRunOutcome, JobError>>>,
    start_results: Mutex<VecDeque<Result<TaskHandle, JobError>>>,
    poll_results: Mutex<VecDeque<Result<TaskState, JobError>>>,
    hang_run_sync: bool,
    start_delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
    run_sync_at: Mutex<Vec<Instant>>,
    start_at: Mutex<Vec<Instant>>,
    poll_at: Mutex<Vec<Instant>>,
    params: Mutex<Vec<JobParams>>,
}

impl ScriptedJobs {
    fn with_run_sync(self, results: Vec<Result<JobRunOutcome, JobError>>) -> Self {
        *self.run_sync_results.lock().unwrap() = results.into();
        self
    }

    fn with_start(self, results: Vec<Result<TaskHandle, JobError>>) -> Self {
        *self.start_results.lock().unwrap() = results.into();
        self
    }

    fn with_polls(self, results: Vec<Result<TaskState, JobError>>) -> Self {
        *self.poll_results.lock().unwrap() = results.into();
        self
    }

    fn hanging(mut self) -> Self {
        self.hang_run_sync = true;
        self
    }

    fn slow_start(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == name).count()
    }
}

fn succeeded() -> Result<JobRunOutcome, JobError> {
    outcome(TerminalStatus::Succeeded)
}

fn outcome(status: TerminalStatus) -> Result<JobRunOutcome, JobError> {
    Ok(JobRunOutcome {
        job_run_id: "jr_1".to_string(),
        status,
        error_message: None,
    })
}

fn handle() -> TaskHandle {
    TaskHandle {
        task_name: "taxi-processed-crawler".to_string(),
        task_id: "task-1".to_string(),
    }
}

#[async_trait]
impl JobClient for ScriptedJobs {
    async fn run_sync(&self, _job_name: &str, params: &JobParams) -> Result<JobRunOutcome, JobError> {
        self.calls.lock().unwrap().push("run_sync".to_string());
        self.run_sync_at.lock().unwrap().push(Instant::now());
        self.params.lock().unwrap().push(params.clone());
        if self.hang_run_sync {
            std::future::pending::<()>().await;
        }
        let next = self.run_sync_results.lock().unwrap().pop_front();
        next.unwrap_or_else(succeeded)
    }

    async fn start_async(&self, _task_name: &str, _params: &JobParams) -> Result<TaskHandle, JobError> {
        self.calls.lock().unwrap().push("start_async".to_string());
        self.start_at.lock().unwrap().push(Instant::now());
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.start_results.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(handle()))
    }

    async fn poll(&self, _handle: &TaskHandle) -> Result<TaskState, JobError> {
        self.calls.lock().unwrap().push("poll".to_string());
        self.poll_at.lock().unwrap().push(Instant::now());
        let next = self.poll_results.lock().unwrap().pop_front();
        next.unwrap_or(Ok(TaskState::Running))
    }

    async fn stop_job(&self, _job_name: &str, _run_id: &RunId) -> Result<(), JobError> {
        self.calls.lock().unwrap().push("stop_job".to_string());
        Ok(())
    }

    async fn stop_task(&self, _handle: &TaskHandle) -> Result<(), JobError> {
        self.calls.lock().unwrap().push("stop_task".to_string());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    messages: Mutex<Vec<StatusMessage>>,
    fail: bool,
}

impl RecordingNotifier {
    fn failing() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    fn messages(&self) -> Vec<StatusMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &StatusMessage) -> PipelineResult<()> {
        self.messages.lock().unwrap().push(message.clone());
        if self.fail {
            return Err(PipelineError::Notify("channel unavailable".to_string()));
        }
        Ok(())
    }
}

struct PresentObjects;

#[async_trait]
impl Storage for PresentObjects {
    async fn object_exists(&self, _bucket: &str, _key: &str) -> PipelineResult<bool> {
        Ok(true)
    }

    async fn read_partition(&self, _location: &str) -> PipelineResult<Vec<Record>> {
        Ok(Vec::new())
    }

    async fn write_partition(&self, _location: &str, _rows: &[serde_json::Value]) -> PipelineResult<()> {
        Ok(())
    }
}

fn gaps(at: &[Instant]) -> Vec<Duration> {
    at.windows(2).map(|w| w[1] - w[0]).collect()
}

fn trigger() -> TriggerEvent {
    TriggerEvent {
        bucket: "lake".to_string(),
        key: "raw/taxi/yellow_tripdata_2024-01.parquet".to_string(),
        size: 52_428_800,
        content_type: None,
        event_time: Some("2024-01-15T10:30:00.000Z".to_string()),
    }
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        poll_interval: Duration::from_secs(1),
        max_polls: 5,
        ..Default::default()
    }
}

fn orchestrator(
    jobs: Arc<ScriptedJobs>,
    notifier: Arc<RecordingNotifier>,
) -> PipelineOrchestrator {
    PipelineOrchestrator::new(config(), jobs, notifier, Arc::new(PresentObjects))
}

#[tokio::test(start_paused = true)]
async fn successful_run_visits_every_stage() {
    let jobs = Arc::new(ScriptedJobs::default().with_polls(vec![
        Ok(TaskState::Running),
        Ok(TaskState::Ready),
    ]));
    let notifier = Arc::new(RecordingNotifier::default());

    let summary = orchestrator(jobs.clone(), notifier.clone())
        .run(trigger(), CancellationToken::new())
        .await;

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(
        summary.history,
        vec![
            PipelineState::ValidatingInput,
            PipelineState::TransformRunning,
            PipelineState::TransformSucceeded,
            PipelineState::CatalogRefreshing,
            PipelineState::CatalogReady,
            PipelineState::NotifyingSuccess,
            PipelineState::Done,
        ]
    );
    assert_eq!(jobs.calls(), vec!["run_sync", "start_async", "poll", "poll"]);

    let params = jobs.params.lock().unwrap()[0].clone();
    assert_eq!(params.get("run_id").map(String::as_str), Some(summary.run_id.as_str()));
    assert_eq!(params.get("key").map(String::as_str), Some("raw/taxi/yellow_tripdata_2024-01.parquet"));

    let messages = notifier.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, RunStatus::Success);
    assert_eq!(messages[0].run_id, summary.run_id);
    assert_eq!(messages[0].catalog_task_id.as_deref(), Some("task-1"));
    assert_eq!(messages[0].transform_job_run_id.as_deref(), Some("jr_1"));
}

#[tokio::test]
async fn invalid_prefix_never_touches_jobs() {
    let jobs = Arc::new(ScriptedJobs::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let mut event = trigger();
    event.key = "landing/yellow.parquet".to_string();

    let summary = orchestrator(jobs.clone(), notifier.clone())
        .run(event, CancellationToken::new())
        .await;

    assert_eq!(summary.status, RunStatus::ValidationFailure);
    assert!(summary.history.contains(&PipelineState::NotifyingValidationFailure));
    assert!(jobs.calls().is_empty());

    let messages = notifier.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, RunStatus::ValidationFailure);
    assert!(messages[0]
        .error
        .as_deref()
        .unwrap_or_default()
        .starts_with("Validation failed: Invalid prefix"));
}

#[tokio::test]
async fn failed_transform_skips_catalog() {
    let jobs = Arc::new(ScriptedJobs::default().with_run_sync(vec![outcome(TerminalStatus::Failed)]));
    let notifier = Arc::new(RecordingNotifier::default());

    let summary = orchestrator(jobs.clone(), notifier.clone())
        .run(trigger(), CancellationToken::new())
        .await;

    assert_eq!(summary.status, RunStatus::Failure);
    assert!(summary.history.contains(&PipelineState::NotifyingFailure));
    assert_eq!(jobs.count("start_async"), 0);
    assert_eq!(notifier.messages()[0].status, RunStatus::Failure);
}

#[tokio::test(start_paused = true)]
async fn catalog_stuck_running_is_partial_success() {
    let jobs = Arc::new(ScriptedJobs::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let start = Instant::now();

    let summary = orchestrator(jobs.clone(), notifier.clone())
        .run(trigger(), CancellationToken::new())
        .await;

    assert_eq!(summary.status, RunStatus::PartialSuccess);
    assert!(summary.history.contains(&PipelineState::CatalogFailed));
    assert_eq!(jobs.count("poll"), 5);
    assert_eq!(jobs.count("stop_task"), 1);
    assert_eq!(start.elapsed(), Duration::from_secs(5));

    let messages = notifier.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, RunStatus::PartialSuccess);
}

#[tokio::test(start_paused = true)]
async fn catalog_task_failure_is_partial_success() {
    let jobs = Arc::new(ScriptedJobs::default().with_polls(vec![Ok(TaskState::Failed {
        message: "crawler error".to_string(),
    })]));
    let notifier = Arc::new(RecordingNotifier::default());

    let summary = orchestrator(jobs, notifier.clone())
        .run(trigger(), CancellationToken::new())
        .await;

    assert_eq!(summary.status, RunStatus::PartialSuccess);
    assert_eq!(
        summary.error.as_deref(),
        Some("catalog task failed: crawler error")
    );
}

#[tokio::test(start_paused = true)]
async fn concurrency_errors_back_off_geometrically() {
    let busy = || {
        Err(JobError::new(
            ErrorClass::ConcurrencyLimitExceeded,
            "max concurrent runs exceeded",
        ))
    };
    let jobs = Arc::new(
        ScriptedJobs::default()
            .with_run_sync(vec![busy(), busy(), succeeded()])
            .with_polls(vec![Ok(TaskState::Ready)]),
    );
    let notifier = Arc::new(RecordingNotifier::default());

    let summary = orchestrator(jobs.clone(), notifier)
        .run(trigger(), CancellationToken::new())
        .await;

    assert_eq!(summary.status, RunStatus::Success);
    let at = jobs.run_sync_at.lock().unwrap().clone();
    assert_eq!(at.len(), 3);
    assert_eq!(at[1] - at[0], Duration::from_secs(60));
    assert_eq!(at[2] - at[1], Duration::from_secs(90));
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_escalate_to_failure() {
    let internal = || Err(JobError::new(ErrorClass::InternalServiceError, "service error"));
    let jobs = Arc::new(ScriptedJobs::default().with_run_sync(vec![internal(), internal(), internal()]));
    let notifier = Arc::new(RecordingNotifier::default());

    let summary = orchestrator(jobs.clone(), notifier.clone())
        .run(trigger(), CancellationToken::new())
        .await;

    assert_eq!(jobs.count("run_sync"), 3);
    assert_eq!(
        gaps(&jobs.run_sync_at.lock().unwrap()),
        vec![Duration::from_secs(30), Duration::from_secs(60)]
    );
    assert_eq!(summary.status, RunStatus::Failure);
    assert_eq!(
        summary.error.as_deref(),
        Some("internal_service_error: service error")
    );
    assert_eq!(jobs.count("start_async"), 0);
}

#[tokio::test]
async fn unlisted_error_class_is_not_retried() {
    let jobs = Arc::new(ScriptedJobs::default().with_run_sync(vec![Err(JobError::new(
        ErrorClass::Other,
        "access denied",
    ))]));
    let notifier = Arc::new(RecordingNotifier::default());

    let summary = orchestrator(jobs.clone(), notifier)
        .run(trigger(), CancellationToken::new())
        .await;

    assert_eq!(jobs.count("run_sync"), 1);
    assert_eq!(summary.status, RunStatus::Failure);
}

#[tokio::test(start_paused = true)]
async fn catalog_start_retries_when_already_running() {
    let jobs = Arc::new(
        ScriptedJobs::default()
            .with_start(vec![
                Err(JobError::new(ErrorClass::AlreadyRunning, "crawler busy")),
                Ok(handle()),
            ])
            .with_polls(vec![Ok(TaskState::Ready)]),
    );
    let notifier = Arc::new(RecordingNotifier::default());

    let summary = orchestrator(jobs.clone(), notifier)
        .run(trigger(), CancellationToken::new())
        .await;

    assert_eq!(summary.status, RunStatus::Success);
    let at = jobs.start_at.lock().unwrap().clone();
    assert_eq!(at.len(), 2);
    assert_eq!(at[1] - at[0], Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn catalog_start_gives_up_after_already_running_budget() {
    let busy = || Err(JobError::new(ErrorClass::AlreadyRunning, "crawler busy"));
    let jobs = Arc::new(ScriptedJobs::default().with_start(vec![busy(), busy(), busy(), busy()]));
    let notifier = Arc::new(RecordingNotifier::default());

    let summary = orchestrator(jobs.clone(), notifier.clone())
        .run(trigger(), CancellationToken::new())
        .await;

    assert_eq!(jobs.count("start_async"), 4);
    assert_eq!(
        gaps(&jobs.start_at.lock().unwrap()),
        vec![
            Duration::from_secs(60),
            Duration::from_secs(90),
            Duration::from_millis(135_000),
        ]
    );
    assert_eq!(jobs.count("poll"), 0);
    assert_eq!(jobs.count("stop_task"), 0);
    assert!(summary.history.contains(&PipelineState::CatalogFailed));
    assert_eq!(summary.status, RunStatus::PartialSuccess);
    assert_eq!(summary.error.as_deref(), Some("already_running: crawler busy"));
    assert_eq!(notifier.messages()[0].status, RunStatus::PartialSuccess);
}

#[tokio::test(start_paused = true)]
async fn catalog_start_timeouts_back_off_then_give_up() {
    let timeout = || Err(JobError::new(ErrorClass::OperationTimeout, "start timed out"));
    let jobs = Arc::new(ScriptedJobs::default().with_start(vec![timeout(), timeout(), timeout()]));
    let notifier = Arc::new(RecordingNotifier::default());

    let summary = orchestrator(jobs.clone(), notifier)
        .run(trigger(), CancellationToken::new())
        .await;

    assert_eq!(jobs.count("start_async"), 3);
    assert_eq!(
        gaps(&jobs.start_at.lock().unwrap()),
        vec![Duration::from_secs(30), Duration::from_secs(60)]
    );
    assert!(summary.history.contains(&PipelineState::CatalogFailed));
    assert_eq!(summary.status, RunStatus::PartialSuccess);
}

#[tokio::test(start_paused = true)]
async fn catalog_start_recovers_after_timeout() {
    let jobs = Arc::new(
        ScriptedJobs::default()
            .with_start(vec![
                Err(JobError::new(ErrorClass::OperationTimeout, "start timed out")),
                Ok(handle()),
            ])
            .with_polls(vec![Ok(TaskState::Ready)]),
    );
    let notifier = Arc::new(RecordingNotifier::default());

    let summary = orchestrator(jobs.clone(), notifier)
        .run(trigger(), CancellationToken::new())
        .await;

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(
        gaps(&jobs.start_at.lock().unwrap()),
        vec![Duration::from_secs(30)]
    );
}

#[tokio::test(start_paused = true)]
async fn retryable_poll_error_then_ready_succeeds() {
    let jobs = Arc::new(ScriptedJobs::default().with_polls(vec![
        Err(JobError::new(ErrorClass::OperationTimeout, "poll timed out")),
        Ok(TaskState::Ready),
    ]));
    let notifier = Arc::new(RecordingNotifier::default());

    let summary = orchestrator(jobs.clone(), notifier)
        .run(trigger(), CancellationToken::new())
        .await;

    assert_eq!(summary.status, RunStatus::Success);
    assert!(summary.history.contains(&PipelineState::CatalogReady));
    assert_eq!(jobs.count("poll"), 2);
    assert_eq!(jobs.count("stop_task"), 0);

    let start_at = jobs.start_at.lock().unwrap()[0];
    let poll_at = jobs.poll_at.lock().unwrap().clone();
    assert_eq!(poll_at[0] - start_at, Duration::from_secs(1));
    // 30 s backoff, then the regular poll interval.
    assert_eq!(poll_at[1] - poll_at[0], Duration::from_secs(31));
}

#[tokio::test(start_paused = true)]
async fn poll_errors_past_budget_stop_the_task() {
    let timeout = || Err(JobError::new(ErrorClass::OperationTimeout, "poll timed out"));
    let jobs = Arc::new(ScriptedJobs::default().with_polls(vec![timeout(), timeout(), timeout()]));
    let notifier = Arc::new(RecordingNotifier::default());

    let summary = orchestrator(jobs.clone(), notifier)
        .run(trigger(), CancellationToken::new())
        .await;

    assert_eq!(jobs.count("poll"), 3);
    assert_eq!(jobs.count("stop_task"), 1);
    assert_eq!(summary.status, RunStatus::PartialSuccess);
    assert_eq!(summary.error.as_deref(), Some("operation_timeout: poll timed out"));
}

#[tokio::test(start_paused = true)]
async fn cancel_during_catalog_start_stops_started_task() {
    let jobs = Arc::new(ScriptedJobs::default().slow_start(Duration::from_secs(4)));
    let notifier = Arc::new(RecordingNotifier::default());
    let cancel = CancellationToken::new();
    let trigger_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        trigger_cancel.cancel();
    });

    let summary = orchestrator(jobs.clone(), notifier.clone())
        .run(trigger(), cancel)
        .await;

    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(jobs.calls(), vec!["run_sync", "start_async", "stop_task"]);
    assert_eq!(notifier.messages()[0].status, RunStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn cancel_with_hung_catalog_start_gives_up_after_grace() {
    let jobs = Arc::new(ScriptedJobs::default().slow_start(Duration::from_secs(3600)));
    let notifier = Arc::new(RecordingNotifier::default());
    let cancel = CancellationToken::new();
    let trigger_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        trigger_cancel.cancel();
    });
    let start = Instant::now();

    let summary = orchestrator(jobs.clone(), notifier)
        .run(trigger(), cancel)
        .await;

    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(jobs.count("stop_task"), 0);
    assert_eq!(start.elapsed(), Duration::from_secs(2) + config().cancel_grace);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_transform_stops_job() {
    let jobs = Arc::new(ScriptedJobs::default().hanging());
    let notifier = Arc::new(RecordingNotifier::default());
    let cancel = CancellationToken::new();
    let trigger_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger_cancel.cancel();
    });

    let summary = orchestrator(jobs.clone(), notifier.clone())
        .run(trigger(), cancel)
        .await;

    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(
        summary.history,
        vec![
            PipelineState::ValidatingInput,
            PipelineState::TransformRunning,
            PipelineState::Cancelled,
            PipelineState::Done,
        ]
    );
    assert_eq!(jobs.count("stop_job"), 1);

    let messages = notifier.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, RunStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_catalog_poll_stops_task() {
    let jobs = Arc::new(ScriptedJobs::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let cancel = CancellationToken::new();
    let trigger_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        trigger_cancel.cancel();
    });

    let summary = orchestrator(jobs.clone(), notifier.clone())
        .run(trigger(), cancel)
        .await;

    assert_eq!(summary.status, RunStatus::Cancelled);
    assert!(summary.history.contains(&PipelineState::CatalogRefreshing));
    assert_eq!(jobs.count("poll"), 2);
    assert_eq!(jobs.count("stop_task"), 1);
    assert!(notifier
        .messages()
        .iter()
        .all(|m| m.status != RunStatus::Success));
}

#[tokio::test]
async fn cancelled_before_start_runs_nothing() {
    let jobs = Arc::new(ScriptedJobs::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = orchestrator(jobs.clone(), notifier.clone())
        .run(trigger(), cancel)
        .await;

    assert_eq!(summary.status, RunStatus::Cancelled);
    assert!(jobs.calls().is_empty());
    assert_eq!(notifier.messages().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn repeated_triggers_get_new_run_ids() {
    let jobs = Arc::new(ScriptedJobs::default().with_polls(vec![
        Ok(TaskState::Ready),
        Ok(TaskState::Ready),
    ]));
    let notifier = Arc::new(RecordingNotifier::default());
    let orchestrator = orchestrator(jobs.clone(), notifier.clone());

    let first = orchestrator.run(trigger(), CancellationToken::new()).await;
    let second = orchestrator.run(trigger(), CancellationToken::new()).await;

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(jobs.count("run_sync"), 2);
    assert_eq!(notifier.messages().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn notification_failure_does_not_change_outcome() {
    let jobs = Arc::new(ScriptedJobs::default().with_polls(vec![Ok(TaskState::Ready)]));
    let notifier = Arc::new(RecordingNotifier::failing());

    let summary = orchestrator(jobs, notifier.clone())
        .run(trigger(), CancellationToken::new())
        .await;

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.history.last(), Some(&PipelineState::Done));
    assert_eq!(notifier.messages().len(), 1);
}
