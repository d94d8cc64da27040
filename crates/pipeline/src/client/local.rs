//! Filesystem-backed collaborators for local runs.
//!
//! [`LocalStorage`] maps `bucket/key` locations onto a directory tree. Raw
//! objects are read as CSV (plain or gzip) or JSON lines, keyed by extension;
//! partitions are written as JSON-lines files. [`LocalJobClient`] runs the
//! transform job in-process and implements the catalog refresh as a scan of
//! the processed partitions.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taxi_quality::{QualityEngine, Record, RunId};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ErrorClass, JobClient, JobError, JobParams, JobRunOutcome, Storage, TaskHandle, TaskState,
    TerminalStatus,
};
use crate::error::{PipelineError, PipelineResult};
use crate::transform::{OutputLayout, TransformJob};

/// Name of the catalog file written under the processed prefix.
pub const CATALOG_FILE: &str = "_catalog.json";

/// Object encodings [`LocalStorage`] can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectFormat {
    JsonLines,
    Csv,
    CsvGzip,
}

impl ObjectFormat {
    /// Format for a file name or a bare extension such as `.csv.gz`.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        if name.ends_with(".csv.gz") {
            Some(Self::CsvGzip)
        } else if name.ends_with(".csv") {
            Some(Self::Csv)
        } else if name.ends_with(".jsonl") {
            Some(Self::JsonLines)
        } else {
            None
        }
    }

    fn from_path(path: &Path) -> Option<Self> {
        path.file_name()
            .and_then(|name| name.to_str())
            .and_then(Self::from_name)
    }
}

fn storage_error(path: &Path, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Storage(format!("{}: {}", path.display(), err))
}

/// Recover JSON types from an untyped CSV cell. Empty cells are nulls.
fn csv_cell(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    if let Ok(int) = cell.parse::<i64>() {
        return Value::from(int);
    }
    match cell.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
        Some(number) => Value::Number(number),
        None => Value::String(cell.to_string()),
    }
}

fn parse_json_lines(path: &Path, bytes: Vec<u8>) -> PipelineResult<Vec<Record>> {
    let content = String::from_utf8(bytes).map_err(|e| storage_error(path, e))?;
    let mut records = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str::<Record>(line).map_err(|e| {
            PipelineError::Storage(format!("{}:{}: {}", path.display(), index + 1, e))
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Header-first CSV, as published by the TLC.
fn parse_csv(path: &Path, input: impl Read) -> PipelineResult<Vec<Record>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(input);
    let headers = reader.headers().map_err(|e| storage_error(path, e))?.clone();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| storage_error(path, e))?;
        let line = row.position().map(|p| p.line()).unwrap_or_default();
        let fields: serde_json::Map<String, Value> = headers
            .iter()
            .zip(row.iter())
            .map(|(name, cell)| (name.to_string(), csv_cell(cell)))
            .collect();
        let record = serde_json::from_value::<Record>(Value::Object(fields)).map_err(|e| {
            PipelineError::Storage(format!("{}:{}: {}", path.display(), line, e))
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Storage rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, location: &str) -> PathBuf {
        self.root.join(location.trim_start_matches('/'))
    }

    /// Decodable files under `dir`, sorted by path. Files starting with `_`
    /// are metadata and skipped.
    async fn partition_files(dir: &Path) -> PipelineResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().to_string();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if !name.starts_with('_') && ObjectFormat::from_name(&name).is_some() {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }

    async fn read_file(path: &Path) -> PipelineResult<Vec<Record>> {
        let format = ObjectFormat::from_path(path)
            .ok_or_else(|| storage_error(path, "unsupported object format"))?;
        let bytes = tokio::fs::read(path).await?;
        match format {
            ObjectFormat::JsonLines => parse_json_lines(path, bytes),
            ObjectFormat::Csv => parse_csv(path, bytes.as_slice()),
            ObjectFormat::CsvGzip => parse_csv(path, GzDecoder::new(bytes.as_slice())),
        }
    }

    /// `year=/month=` partitions under `prefix` with their record counts.
    pub async fn list_partitions(&self, prefix: &str) -> PipelineResult<BTreeMap<String, usize>> {
        let dir = self.resolve(prefix);
        let mut partitions = BTreeMap::new();
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(partitions);
        }
        for file in Self::partition_files(&dir).await? {
            let Some(parent) = file.parent() else {
                continue;
            };
            let relative = parent
                .strip_prefix(&dir)
                .unwrap_or(parent)
                .to_string_lossy()
                .replace('\\', "/");
            let rows = Self::read_file(&file).await?.len();
            *partitions.entry(relative).or_insert(0) += rows;
        }
        Ok(partitions)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn object_exists(&self, bucket: &str, key: &str) -> PipelineResult<bool> {
        let path = self.resolve(&format!("{}/{}", bucket, key));
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn read_partition(&self, location: &str) -> PipelineResult<Vec<Record>> {
        let path = self.resolve(location);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| PipelineError::Storage(format!("{}: {}", path.display(), e)))?;

        if metadata.is_file() {
            return Self::read_file(&path).await;
        }
        let mut records = Vec::new();
        for file in Self::partition_files(&path).await? {
            records.extend(Self::read_file(&file).await?);
        }
        Ok(records)
    }

    async fn write_partition(&self, location: &str, rows: &[serde_json::Value]) -> PipelineResult<()> {
        let dir = self.resolve(location);
        tokio::fs::create_dir_all(&dir).await?;

        let mut buffer = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut buffer, row)?;
            buffer.push(b'\n');
        }

        let path = dir.join(format!("part-{}.jsonl", Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(&buffer).await?;
        file.flush().await?;
        debug!(path = %path.display(), rows = rows.len(), "Wrote partition file");
        Ok(())
    }
}

/// Catalog contents written by the local catalog refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub prefix: String,
    pub partitions: BTreeMap<String, usize>,
    pub refreshed_at: chrono::DateTime<Utc>,
}

struct CatalogTask {
    task_name: String,
    state: Arc<Mutex<TaskState>>,
    join: JoinHandle<()>,
}

impl CatalogTask {
    fn is_running(&self) -> bool {
        self.state
            .lock()
            .map(|s| *s == TaskState::Running)
            .unwrap_or(false)
    }
}

/// In-process job service backed by [`LocalStorage`].
///
/// Catalog tasks are tracked by task id; at most one task per name runs at a
/// time. Expected parameters: `run_id`, `bucket`, `key`, `processed_prefix` and
/// `quarantine_prefix`.
pub struct LocalJobClient {
    storage: Arc<LocalStorage>,
    engine: QualityEngine,
    transform_job_name: String,
    tasks: Mutex<HashMap<String, CatalogTask>>,
}

impl LocalJobClient {
    pub fn new(storage: Arc<LocalStorage>, engine: QualityEngine, transform_job_name: impl Into<String>) -> Self {
        Self {
            storage,
            engine,
            transform_job_name: transform_job_name.into(),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn param<'a>(params: &'a JobParams, name: &str) -> Result<&'a str, JobError> {
        params
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| JobError::new(ErrorClass::Other, format!("missing parameter '{}'", name)))
    }

    fn lock_tasks(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CatalogTask>>, JobError> {
        self.tasks
            .lock()
            .map_err(|_| JobError::new(ErrorClass::InternalServiceError, "task registry poisoned"))
    }

    async fn refresh_catalog(storage: Arc<LocalStorage>, prefix: String) -> PipelineResult<usize> {
        let partitions = storage.list_partitions(&prefix).await?;
        let count = partitions.len();
        let snapshot = CatalogSnapshot {
            prefix: prefix.clone(),
            partitions,
            refreshed_at: Utc::now(),
        };
        let dir = storage.resolve(&prefix);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(CATALOG_FILE), serde_json::to_vec_pretty(&snapshot)?).await?;
        Ok(count)
    }
}

#[async_trait]
impl JobClient for LocalJobClient {
    async fn run_sync(&self, job_name: &str, params: &JobParams) -> Result<JobRunOutcome, JobError> {
        if job_name != self.transform_job_name {
            return Err(JobError::new(
                ErrorClass::Other,
                format!("unknown job '{}'", job_name),
            ));
        }
        let run_id = RunId::from(Self::param(params, "run_id")?);
        let bucket = Self::param(params, "bucket")?;
        let input = format!("{}/{}", bucket, Self::param(params, "key")?);
        let layout = OutputLayout {
            processed_prefix: format!("{}/{}", bucket, Self::param(params, "processed_prefix")?),
            quarantine_prefix: format!("{}/{}", bucket, Self::param(params, "quarantine_prefix")?),
        };

        let job_run_id = format!("jr_{}", Uuid::new_v4().simple());
        info!(job = %job_name, job_run_id = %job_run_id, run_id = %run_id, "Starting local transform job");

        let job = TransformJob::new(self.engine.clone(), self.storage.clone());
        match job.run(&run_id, &input, &layout, Utc::now()).await {
            Ok(_) => Ok(JobRunOutcome {
                job_run_id,
                status: TerminalStatus::Succeeded,
                error_message: None,
            }),
            Err(e) => {
                warn!(job_run_id = %job_run_id, error = %e, "Local transform job failed");
                Ok(JobRunOutcome {
                    job_run_id,
                    status: TerminalStatus::Failed,
                    error_message: Some(e.to_string()),
                })
            }
        }
    }

    async fn start_async(&self, task_name: &str, params: &JobParams) -> Result<TaskHandle, JobError> {
        let prefix = format!(
            "{}/{}",
            Self::param(params, "bucket")?,
            Self::param(params, "processed_prefix")?
        );

        let mut tasks = self.lock_tasks()?;
        if tasks
            .values()
            .any(|task| task.task_name == task_name && task.is_running())
        {
            return Err(JobError::new(
                ErrorClass::AlreadyRunning,
                format!("task '{}' is already running", task_name),
            ));
        }

        let state = Arc::new(Mutex::new(TaskState::Running));
        let task_state = state.clone();
        let storage = self.storage.clone();
        let name = task_name.to_string();
        let join = tokio::spawn(async move {
            let result = Self::refresh_catalog(storage, prefix).await;
            let next = match result {
                Ok(partitions) => {
                    info!(task = %name, partitions, "Catalog refresh finished");
                    TaskState::Ready
                }
                Err(e) => TaskState::Failed {
                    message: e.to_string(),
                },
            };
            if let Ok(mut guard) = task_state.lock() {
                *guard = next;
            }
        });

        let handle = TaskHandle {
            task_name: task_name.to_string(),
            task_id: Uuid::new_v4().to_string(),
        };
        tasks.insert(
            handle.task_id.clone(),
            CatalogTask {
                task_name: task_name.to_string(),
                state,
                join,
            },
        );
        Ok(handle)
    }

    async fn poll(&self, handle: &TaskHandle) -> Result<TaskState, JobError> {
        let tasks = self.lock_tasks()?;
        let task = tasks
            .get(&handle.task_id)
            .filter(|task| task.task_name == handle.task_name)
            .ok_or_else(|| {
                JobError::new(
                    ErrorClass::Other,
                    format!("unknown task '{}' ({})", handle.task_name, handle.task_id),
                )
            })?;
        let state = task
            .state
            .lock()
            .map_err(|_| JobError::new(ErrorClass::InternalServiceError, "task state poisoned"))?;
        Ok(state.clone())
    }

    async fn stop_job(&self, job_name: &str, run_id: &RunId) -> Result<(), JobError> {
        // The transform runs inside the caller's future; dropping it stops it.
        debug!(job = %job_name, run_id = %run_id, "Local transform stopped with its caller");
        Ok(())
    }

    async fn stop_task(&self, handle: &TaskHandle) -> Result<(), JobError> {
        let tasks = self.lock_tasks()?;
        if let Some(task) = tasks.get(&handle.task_id) {
            task.join.abort();
            if let Ok(mut state) = task.state.lock() {
                if *state == TaskState::Running {
                    *state = TaskState::Failed {
                        message: "stopped".to_string(),
                    };
                }
            }
            info!(task = %handle.task_name, task_id = %handle.task_id, "Catalog task stopped");
        }
        Ok(())
    }
}
