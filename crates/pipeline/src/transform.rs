//! The transform job: raw partition in, processed and quarantine partitions out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use taxi_quality::{QualityEngine, QualityReport, RunId};
use tracing::{debug, info};

use crate::client::Storage;
use crate::error::PipelineResult;

/// Where a transform run writes its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    pub processed_prefix: String,
    pub quarantine_prefix: String,
}

impl OutputLayout {
    pub fn processed_partition(&self, year: i32, month: u32) -> String {
        format!("{}/year={}/month={:02}", self.processed_prefix, year, month)
    }

    pub fn quarantine_partition(&self, year: i32, month: u32, run_id: &RunId) -> String {
        format!(
            "{}/year={}/month={:02}/run_id={}",
            self.quarantine_prefix, year, month, run_id
        )
    }
}

/// Counts and written locations of one transform run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformSummary {
    pub run_id: RunId,
    pub input: String,
    pub records_read: usize,
    pub records_valid: usize,
    pub records_quarantined: usize,
    pub processed_partitions: Vec<String>,
    pub quarantine_partitions: Vec<String>,
    pub report: QualityReport,
}

/// Runs the quality engine over a raw partition and writes both outputs.
#[derive(Clone)]
pub struct TransformJob {
    engine: QualityEngine,
    storage: Arc<dyn Storage>,
}

impl TransformJob {
    pub fn new(engine: QualityEngine, storage: Arc<dyn Storage>) -> Self {
        Self { engine, storage }
    }

    pub async fn run(
        &self,
        run_id: &RunId,
        input: &str,
        layout: &OutputLayout,
        now: DateTime<Utc>,
    ) -> PipelineResult<TransformSummary> {
        let start = Instant::now();
        let records = self.storage.read_partition(input).await?;
        let records_read = records.len();
        info!(run_id = %run_id, input = %input, records = records_read, "Read raw partition");

        let outcome = self.engine.evaluate(records, run_id, now);

        let mut processed: BTreeMap<(i32, u32), Vec<serde_json::Value>> = BTreeMap::new();
        for record in &outcome.valid {
            processed
                .entry((record.year, record.month))
                .or_default()
                .push(serde_json::to_value(record)?);
        }

        let mut quarantine: BTreeMap<(i32, u32), Vec<serde_json::Value>> = BTreeMap::new();
        for record in &outcome.invalid {
            quarantine
                .entry((record.failed_at.year(), record.failed_at.month()))
                .or_default()
                .push(serde_json::to_value(record)?);
        }

        let mut processed_partitions = Vec::with_capacity(processed.len());
        for ((year, month), rows) in &processed {
            let location = layout.processed_partition(*year, *month);
            self.storage.write_partition(&location, rows).await?;
            debug!(run_id = %run_id, location = %location, rows = rows.len(), "Wrote processed partition");
            processed_partitions.push(location);
        }

        let mut quarantine_partitions = Vec::with_capacity(quarantine.len());
        for ((year, month), rows) in &quarantine {
            let location = layout.quarantine_partition(*year, *month, run_id);
            self.storage.write_partition(&location, rows).await?;
            debug!(run_id = %run_id, location = %location, rows = rows.len(), "Wrote quarantine partition");
            quarantine_partitions.push(location);
        }

        for (reason, count) in &outcome.report.violations {
            info!(run_id = %run_id, reason = %reason.as_str(), count, "Quality check failures");
        }

        let summary = TransformSummary {
            run_id: run_id.clone(),
            input: input.to_string(),
            records_read,
            records_valid: outcome.valid.len(),
            records_quarantined: outcome.invalid.len(),
            processed_partitions,
            quarantine_partitions,
            report: outcome.report,
        };

        info!(
            target: "taxi_etl.transform",
            run_id = %run_id,
            records_read = summary.records_read,
            records_valid = summary.records_valid,
            records_quarantined = summary.records_quarantined,
            pass_rate = summary.report.pass_rate(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Transform completed"
        );

        Ok(summary)
    }
}
