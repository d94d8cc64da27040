//! Taxi Quality Library
//!
//! Record-level data quality checks for NYC taxi trip data.
//!
//! This crate provides:
//! - [`Record`]: one raw trip row, nulls preserved
//! - [`RuleSet`]: ordered, immutable validation rules with fixed reason codes
//! - [`QualityEngine`]: splits a batch into valid and quarantined records
//! - [`QualityReport`]: per-reason rejection counts
//!
//! Every input record lands in exactly one output: valid records are
//! decorated with derived fields, invalid ones carry a failure reason, a
//! timestamp and the run id that produced them.

pub mod engine;
pub mod error;
pub mod record;
pub mod report;
pub mod rules;

pub use engine::{QualityEngine, QualityOutcome, QuarantinedRecord, ValidRecord};
pub use error::QualityError;
pub use record::{Record, RecordField, RunId};
pub use report::QualityReport;
pub use rules::{DerivedValues, RuleCheck, RuleSet, RuleStage, ValidationRule, ViolationReason};

/// Parse a TLC timestamp (`2024-01-15 10:30:00`, `T` separator accepted).
pub fn parse_timestamp(s: &str) -> Option<chrono::NaiveDateTime> {
    record::timestamp::parse(s)
}
