//! Per-evaluation quality metrics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::rules::ViolationReason;

/// Counts produced by one quality evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityReport {
    pub records_processed: usize,
    pub records_passed: usize,
    pub records_rejected: usize,
    /// Rejections broken down by failure reason.
    pub violations: BTreeMap<ViolationReason, usize>,
}

impl QualityReport {
    pub(crate) fn record_pass(&mut self) {
        self.records_processed += 1;
        self.records_passed += 1;
    }

    pub(crate) fn record_violation(&mut self, reason: ViolationReason) {
        self.records_processed += 1;
        self.records_rejected += 1;
        *self.violations.entry(reason).or_insert(0) += 1;
    }

    /// Share of records that passed, in `[0, 1]`. An empty batch passes fully.
    pub fn pass_rate(&self) -> f64 {
        if self.records_processed == 0 {
            return 1.0;
        }
        self.records_passed as f64 / self.records_processed as f64
    }

    /// Fold another report into this one (used when a run spans several partitions).
    pub fn merge(&mut self, other: &QualityReport) {
        self.records_processed += other.records_processed;
        self.records_passed += other.records_passed;
        self.records_rejected += other.records_rejected;
        for (reason, count) in &other.violations {
            *self.violations.entry(*reason).or_insert(0) += count;
        }
    }
}
