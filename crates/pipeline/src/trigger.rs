//! Trigger input and its validation.
//!
//! A run starts from a [`TriggerEvent`] describing a newly landed raw object.
//! [`InputValidator`] checks its shape (prefix, extension, size) and, when
//! those pass, that the object actually exists.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::client::Storage;
use crate::error::{PipelineError, PipelineResult};

/// A newly landed raw object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, alias = "contentType", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, alias = "eventTime", skip_serializing_if = "Option::is_none")]
    pub event_time: Option<String>,
}

impl TriggerEvent {
    /// `bucket/key` location of the object.
    pub fn location(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }

    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// Parse a trigger document.
///
/// Accepts either a single trigger object or an object-store notification
/// (`{"Records": [...]}`), from which every `ObjectCreated` record becomes a
/// trigger.
pub fn parse_trigger_document(value: serde_json::Value) -> PipelineResult<Vec<TriggerEvent>> {
    if value.get("Records").is_none() {
        return Ok(vec![serde_json::from_value(value)?]);
    }
    let records = value["Records"]
        .as_array()
        .ok_or_else(|| PipelineError::Validation("Records must be an array".to_string()))?;

    let mut triggers = Vec::with_capacity(records.len());
    for record in records {
        let event_name = record
            .get("eventName")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if !event_name.starts_with("ObjectCreated") {
            continue;
        }
        let object = &record["s3"]["object"];
        triggers.push(TriggerEvent {
            bucket: record["s3"]["bucket"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            key: object["key"].as_str().unwrap_or_default().to_string(),
            size: object["size"].as_u64().unwrap_or(0),
            content_type: object["contentType"].as_str().map(str::to_string),
            event_time: record["eventTime"].as_str().map(str::to_string),
        });
    }
    Ok(triggers)
}

/// Settings for [`InputValidator`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatorConfig {
    pub raw_prefix: String,
    pub allowed_extensions: Vec<String>,
    pub min_file_size: u64,
    pub max_file_size: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            raw_prefix: "raw/taxi/".to_string(),
            allowed_extensions: vec![
                ".parquet".to_string(),
                ".csv".to_string(),
                ".csv.gz".to_string(),
            ],
            min_file_size: 100,
            max_file_size: 10 * 1024 * 1024 * 1024,
        }
    }
}

/// Result of one validation check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub check: String,
    pub valid: bool,
    pub message: String,
}

impl CheckOutcome {
    fn new(check: &str, valid: bool, message: impl Into<String>) -> Self {
        Self {
            check: check.to_string(),
            valid,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub checks: Vec<CheckOutcome>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.checks.iter().all(|c| c.valid)
    }

    /// Summary message: `"All validations passed"` or the failed check
    /// messages joined as `"Validation failed: a; b"`.
    pub fn message(&self) -> String {
        let failed: Vec<&str> = self
            .checks
            .iter()
            .filter(|c| !c.valid)
            .map(|c| c.message.as_str())
            .collect();
        if failed.is_empty() {
            "All validations passed".to_string()
        } else {
            format!("Validation failed: {}", failed.join("; "))
        }
    }
}

/// Validates trigger events before any job is started.
#[derive(Debug, Clone, Default)]
pub struct InputValidator {
    config: ValidatorConfig,
}

impl InputValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// Run the shape checks, then the existence check if they all pass.
    pub async fn validate(&self, trigger: &TriggerEvent, storage: &dyn Storage) -> ValidationReport {
        if trigger.bucket.is_empty() || trigger.key.is_empty() {
            warn!(bucket = %trigger.bucket, key = %trigger.key, "Trigger is missing bucket or key");
            return ValidationReport {
                checks: vec![CheckOutcome::new(
                    "required_fields",
                    false,
                    "Missing required fields: bucket or key",
                )],
            };
        }

        let mut checks = vec![
            self.check_prefix(&trigger.key),
            self.check_file_type(&trigger.key),
            self.check_file_size(trigger.size),
        ];

        if checks.iter().all(|c| c.valid) {
            checks.push(match storage.object_exists(&trigger.bucket, &trigger.key).await {
                Ok(true) => CheckOutcome::new("file_exists", true, "File exists"),
                Ok(false) => CheckOutcome::new(
                    "file_exists",
                    false,
                    format!("File not found: {}", trigger.location()),
                ),
                Err(e) => CheckOutcome::new(
                    "file_exists",
                    false,
                    format!("Error checking file existence: {}", e),
                ),
            });
        }

        let report = ValidationReport { checks };
        if report.is_valid() {
            info!(location = %trigger.location(), size = trigger.size, "Trigger input validated");
        } else {
            warn!(location = %trigger.location(), reason = %report.message(), "Trigger input rejected");
        }
        report
    }

    fn check_prefix(&self, key: &str) -> CheckOutcome {
        let prefix = &self.config.raw_prefix;
        if key.starts_with(prefix.as_str()) {
            return CheckOutcome::new("prefix", true, format!("Valid prefix: {}", prefix));
        }
        let shown: String = key.chars().take(20).collect();
        CheckOutcome::new(
            "prefix",
            false,
            format!("Invalid prefix. Expected: {}, Got: {}...", prefix, shown),
        )
    }

    fn check_file_type(&self, key: &str) -> CheckOutcome {
        let key_lower = key.to_lowercase();
        match self
            .config
            .allowed_extensions
            .iter()
            .find(|ext| key_lower.ends_with(&ext.to_lowercase()))
        {
            Some(ext) => CheckOutcome::new("file_type", true, format!("Valid file type: {}", ext)),
            None => CheckOutcome::new(
                "file_type",
                false,
                format!(
                    "Unsupported file type. Supported: {}",
                    self.config.allowed_extensions.join(", ")
                ),
            ),
        }
    }

    fn check_file_size(&self, size: u64) -> CheckOutcome {
        let (min, max) = (self.config.min_file_size, self.config.max_file_size);
        if size < min {
            CheckOutcome::new(
                "file_size",
                false,
                format!("File too small: {} bytes (minimum: {} bytes)", size, min),
            )
        } else if size > max {
            CheckOutcome::new(
                "file_size",
                false,
                format!("File too large: {} bytes (maximum: {} bytes)", size, max),
            )
        } else {
            CheckOutcome::new(
                "file_size",
                true,
                format!("File size valid: {:.2} MB", size as f64 / (1024.0 * 1024.0)),
            )
        }
    }
}
