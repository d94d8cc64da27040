//! Pipeline configuration loaded from the environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::client::ObjectFormat;
use crate::engine::{OrchestratorConfig, RetryPolicies};
use crate::error::{PipelineError, PipelineResult};
use crate::trigger::ValidatorConfig;

/// Pipeline configuration.
///
/// Environment variables are prefixed with `TAXI_ETL_`:
/// - `TAXI_ETL_RAW_PREFIX`: prefix raw objects must land under (default: "raw/taxi/")
/// - `TAXI_ETL_ALLOWED_EXTENSIONS`: comma-separated extensions
/// - `TAXI_ETL_CATALOG_POLL_INTERVAL_SECS`: delay between catalog polls (default: 30)
/// - `TAXI_ETL_DATA_DIR`: root directory of the local lake (default: "./data")
/// - `TAXI_ETL_WEBHOOK_URL`: status webhook; status is logged when unset
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_raw_prefix")]
    pub raw_prefix: String,

    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    /// Minimum raw object size in bytes
    #[serde(default = "default_min_file_size")]
    pub min_file_size: u64,

    /// Maximum raw object size in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    #[serde(default = "default_transform_job_name")]
    pub transform_job_name: String,

    #[serde(default = "default_catalog_task_name")]
    pub catalog_task_name: String,

    #[serde(default = "default_processed_prefix")]
    pub processed_prefix: String,

    #[serde(default = "default_quarantine_prefix")]
    pub quarantine_prefix: String,

    #[serde(default = "default_poll_interval")]
    pub catalog_poll_interval_secs: u64,

    /// Polls before the catalog refresh is given up
    #[serde(default = "default_max_polls")]
    pub catalog_max_polls: u32,

    /// Wait for an in-flight catalog start after cancel
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_secs: u64,

    /// YAML rule set; the built-in taxi rules are used when unset
    #[serde(default)]
    pub rules_path: Option<PathBuf>,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_raw_prefix() -> String {
    "raw/taxi/".to_string()
}

fn default_allowed_extensions() -> Vec<String> {
    ValidatorConfig::default().allowed_extensions
}

fn default_min_file_size() -> u64 {
    100
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_transform_job_name() -> String {
    "taxi-transform".to_string()
}

fn default_catalog_task_name() -> String {
    "taxi-processed-crawler".to_string()
}

fn default_processed_prefix() -> String {
    "processed/taxi".to_string()
}

fn default_quarantine_prefix() -> String {
    "quarantine/taxi".to_string()
}

fn default_poll_interval() -> u64 {
    30
}

fn default_max_polls() -> u32 {
    60
}

fn default_cancel_grace() -> u64 {
    10
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl PipelineConfig {
    /// Load configuration from `TAXI_ETL_`-prefixed environment variables.
    pub fn from_env() -> PipelineResult<Self> {
        let config = envy::prefixed("TAXI_ETL_").from_env::<PipelineConfig>()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.catalog_poll_interval_secs == 0 {
            return Err(PipelineError::Config(
                "catalog_poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.catalog_max_polls == 0 {
            return Err(PipelineError::Config(
                "catalog_max_polls must be greater than zero".to_string(),
            ));
        }
        if self.min_file_size > self.max_file_size {
            return Err(PipelineError::Config(format!(
                "min_file_size ({}) exceeds max_file_size ({})",
                self.min_file_size, self.max_file_size
            )));
        }
        if self.allowed_extensions.is_empty() {
            return Err(PipelineError::Config(
                "allowed_extensions must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Narrow `allowed_extensions` to what the local lake can decode, so
    /// undecodable objects fail validation instead of the transform.
    pub fn for_local_lake(mut self) -> PipelineResult<Self> {
        let (decodable, dropped): (Vec<String>, Vec<String>) = self
            .allowed_extensions
            .into_iter()
            .partition(|ext| ObjectFormat::from_name(ext).is_some());
        if !dropped.is_empty() {
            tracing::warn!(extensions = ?dropped, "Extensions not readable by the local lake are rejected");
        }
        if decodable.is_empty() {
            return Err(PipelineError::Config(
                "no allowed extension can be read by the local lake".to_string(),
            ));
        }
        self.allowed_extensions = decodable;
        Ok(self)
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            raw_prefix: self.raw_prefix.clone(),
            allowed_extensions: self.allowed_extensions.clone(),
            min_file_size: self.min_file_size,
            max_file_size: self.max_file_size,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            validator: self.validator_config(),
            transform_job_name: self.transform_job_name.clone(),
            catalog_task_name: self.catalog_task_name.clone(),
            processed_prefix: self.processed_prefix.clone(),
            quarantine_prefix: self.quarantine_prefix.clone(),
            poll_interval: Duration::from_secs(self.catalog_poll_interval_secs),
            max_polls: self.catalog_max_polls,
            cancel_grace: Duration::from_secs(self.cancel_grace_secs),
            retry: RetryPolicies::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            raw_prefix: default_raw_prefix(),
            allowed_extensions: default_allowed_extensions(),
            min_file_size: default_min_file_size(),
            max_file_size: default_max_file_size(),
            transform_job_name: default_transform_job_name(),
            catalog_task_name: default_catalog_task_name(),
            processed_prefix: default_processed_prefix(),
            quarantine_prefix: default_quarantine_prefix(),
            catalog_poll_interval_secs: default_poll_interval(),
            catalog_max_polls: default_max_polls(),
            cancel_grace_secs: default_cancel_grace(),
            rules_path: None,
            data_dir: default_data_dir(),
            webhook_url: None,
        }
    }
}
