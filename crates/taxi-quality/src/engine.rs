//! Quality engine: splits a batch into valid and quarantined records.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{Record, RunId};
use crate::report::QualityReport;
use crate::rules::{DerivedValues, RuleSet, RuleStage, ViolationReason};

/// Columns added to quarantine rows.
pub const QUARANTINE_FIELDS: [&str; 3] = ["failure_reason", "failed_at", "run_id"];

/// Columns added to valid rows.
pub const DERIVED_FIELDS: [&str; 5] = [
    "trip_duration_minutes",
    "tip_percentage",
    "quality_check_timestamp",
    "year",
    "month",
];

/// Drop source columns that collide with columns the engine writes.
fn strip_reserved(record: &mut Record, reserved: &[&str]) {
    for key in reserved {
        record.extra_fields.remove(*key);
    }
}

/// A record that passed every rule, decorated with derived fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidRecord {
    #[serde(flatten)]
    pub record: Record,
    pub trip_duration_minutes: f64,
    pub tip_percentage: f64,
    pub quality_check_timestamp: DateTime<Utc>,
    /// Partition keys taken from the pickup timestamp.
    pub year: i32,
    pub month: u32,
}

/// A record that failed a rule. This is the quarantine row schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedRecord {
    #[serde(flatten)]
    pub record: Record,
    pub failure_reason: ViolationReason,
    pub failed_at: DateTime<Utc>,
    pub run_id: RunId,
}

/// Result of one evaluation. `valid.len() + invalid.len()` equals the input size.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QualityOutcome {
    pub valid: Vec<ValidRecord>,
    pub invalid: Vec<QuarantinedRecord>,
    pub report: QualityReport,
}

/// Applies a shared [`RuleSet`] to batches of records.
///
/// The engine holds no mutable state, so one instance can serve concurrent
/// runs.
#[derive(Debug, Clone)]
pub struct QualityEngine {
    rules: Arc<RuleSet>,
}

impl Default for QualityEngine {
    fn default() -> Self {
        Self::new(Arc::new(RuleSet::taxi_default()))
    }
}

impl QualityEngine {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Run the rules against one record.
    ///
    /// Returns the derived values when every rule passed, otherwise the
    /// reason of the first violated rule.
    pub fn classify(&self, record: &Record) -> Result<DerivedValues, ViolationReason> {
        let mut derived: Option<DerivedValues> = None;

        for rule in self.rules.rules() {
            let values = match rule.stage() {
                RuleStage::Derived => *derived.get_or_insert_with(|| DerivedValues::compute(record)),
                // Earlier stages never read derived values.
                _ => DerivedValues {
                    trip_duration_minutes: None,
                    tip_percentage: 0.0,
                },
            };

            if let Some(reason) = rule.check(record, &values) {
                return Err(reason);
            }
        }

        Ok(derived.unwrap_or_else(|| DerivedValues::compute(record)))
    }

    /// Partition `records` into valid and quarantined outputs.
    ///
    /// `now` stamps `quality_check_timestamp` and `failed_at`; it is a
    /// parameter so identical inputs give identical outputs.
    pub fn evaluate(&self, records: Vec<Record>, run_id: &RunId, now: DateTime<Utc>) -> QualityOutcome {
        let start = Instant::now();
        let mut outcome = QualityOutcome::default();

        for mut record in records {
            let classified = self.classify(&record).and_then(|derived| {
                match (derived.trip_duration_minutes, record.pickup_partition()) {
                    (Some(minutes), Some(partition)) => Ok((minutes, derived.tip_percentage, partition)),
                    // Rule sets always require both timestamps; kept total regardless.
                    _ => Err(ViolationReason::NullInRequiredField),
                }
            });

            match classified {
                Ok((trip_duration_minutes, tip_percentage, (year, month))) => {
                    strip_reserved(&mut record, &QUARANTINE_FIELDS);
                    strip_reserved(&mut record, &DERIVED_FIELDS);
                    outcome.report.record_pass();
                    outcome.valid.push(ValidRecord {
                        record,
                        trip_duration_minutes,
                        tip_percentage,
                        quality_check_timestamp: now,
                        year,
                        month,
                    });
                }
                Err(reason) => {
                    strip_reserved(&mut record, &QUARANTINE_FIELDS);
                    outcome.report.record_violation(reason);
                    outcome.invalid.push(QuarantinedRecord {
                        record,
                        failure_reason: reason,
                        failed_at: now,
                        run_id: run_id.clone(),
                    });
                }
            }
        }

        let report = &outcome.report;
        tracing::info!(
            target: "taxi_etl.quality",
            run_id = %run_id,
            records_processed = report.records_processed,
            records_passed = report.records_passed,
            records_rejected = report.records_rejected,
            duration_ms = %start.elapsed().as_millis(),
            "Quality evaluation complete"
        );
        for (reason, count) in &report.violations {
            tracing::debug!(
                target: "taxi_etl.quality",
                run_id = %run_id,
                reason = %reason,
                count,
                "Rejection breakdown"
            );
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::timestamp;
    use crate::rules::{RuleCheck, ValidationRule};
    use crate::RecordField;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 6, 0, 0).unwrap()
    }

    fn trip() -> Record {
        Record {
            tpep_pickup_datetime: timestamp::parse("2024-01-15 10:30:00"),
            tpep_dropoff_datetime: timestamp::parse("2024-01-15 10:42:00"),
            passenger_count: Some(2),
            trip_distance: Some(3.5),
            fare_amount: Some(15.0),
            tip_amount: Some(3.0),
            total_amount: Some(19.3),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_trip_is_decorated() {
        let engine = QualityEngine::default();
        let outcome = engine.evaluate(vec![trip()], &RunId::from("run-1"), now());

        assert!(outcome.invalid.is_empty());
        let valid = &outcome.valid[0];
        assert_eq!(valid.trip_duration_minutes, 12.0);
        assert!((valid.tip_percentage - 20.0).abs() < 1e-9);
        assert_eq!(valid.quality_check_timestamp, now());
        assert_eq!((valid.year, valid.month), (2024, 1));
    }

    #[test]
    fn test_zero_passengers_is_range_violation() {
        let engine = QualityEngine::default();
        let mut record = trip();
        record.passenger_count = Some(0);

        let outcome = engine.evaluate(vec![record], &RunId::from("run-1"), now());
        assert!(outcome.valid.is_empty());
        let quarantined = &outcome.invalid[0];
        assert_eq!(quarantined.failure_reason, ViolationReason::NumericRangeViolation);
        assert_eq!(quarantined.failed_at, now());
        assert_eq!(quarantined.run_id.as_str(), "run-1");
    }

    #[test]
    fn test_first_violation_wins() {
        let engine = QualityEngine::default();

        // Null fare and inverted timestamps: completeness runs first.
        let mut record = trip();
        record.fare_amount = None;
        record.tpep_dropoff_datetime = timestamp::parse("2024-01-15 10:00:00");
        assert_eq!(
            engine.classify(&record),
            Err(ViolationReason::NullInRequiredField)
        );

        // Out-of-range distance and inverted timestamps: range runs before temporal.
        let mut record = trip();
        record.trip_distance = Some(250.0);
        record.tpep_dropoff_datetime = timestamp::parse("2024-01-15 10:00:00");
        assert_eq!(
            engine.classify(&record),
            Err(ViolationReason::NumericRangeViolation)
        );
    }

    #[test]
    fn test_zero_fare_fails_range_before_tip_percentage() {
        // fare = 0 would make tip % undefined; the fare range rule rejects the
        // record first so the derived check never sees it.
        let engine = QualityEngine::default();
        let mut record = trip();
        record.fare_amount = Some(0.0);
        record.tip_amount = Some(50.0);
        assert_eq!(
            engine.classify(&record),
            Err(ViolationReason::NumericRangeViolation)
        );
    }

    #[test]
    fn test_derived_checks() {
        let engine = QualityEngine::default();

        let mut long_trip = trip();
        long_trip.tpep_dropoff_datetime = timestamp::parse("2024-01-15 16:00:00");
        assert_eq!(
            engine.classify(&long_trip),
            Err(ViolationReason::TripDurationOutOfRange)
        );

        let mut generous = trip();
        generous.tip_amount = Some(16.0);
        assert_eq!(
            engine.classify(&generous),
            Err(ViolationReason::TipPercentageOutOfRange)
        );
    }

    #[test]
    fn test_dropoff_one_second_after_pickup_passes_temporal_check() {
        let engine = QualityEngine::default();
        let mut record = trip();
        record.tpep_dropoff_datetime = timestamp::parse("2024-01-15 10:30:01");

        // Ordering holds; the one-second trip is then caught by the duration floor.
        assert_eq!(
            engine.classify(&record),
            Err(ViolationReason::TripDurationOutOfRange)
        );

        let ordering_only = RuleSet::new(vec![
            ValidationRule::new(
                "required",
                RuleCheck::Required {
                    fields: vec![RecordField::PickupDatetime, RecordField::DropoffDatetime],
                },
            ),
            ValidationRule::new("order", RuleCheck::TemporalOrder),
        ])
        .unwrap();
        let engine = QualityEngine::new(Arc::new(ordering_only));
        assert!(engine.classify(&record).is_ok());
    }

    #[test]
    fn test_report_counts() {
        let engine = QualityEngine::default();
        let mut bad = trip();
        bad.passenger_count = Some(9);
        let mut null = trip();
        null.total_amount = None;

        let outcome = engine.evaluate(vec![trip(), bad, null, trip()], &RunId::new(), now());
        assert_eq!(outcome.report.records_processed, 4);
        assert_eq!(outcome.report.records_passed, 2);
        assert_eq!(outcome.report.records_rejected, 2);
        assert_eq!(
            outcome.report.violations[&ViolationReason::NumericRangeViolation],
            1
        );
        assert_eq!(
            outcome.report.violations[&ViolationReason::NullInRequiredField],
            1
        );
    }

    #[test]
    fn test_quarantine_row_schema() {
        let engine = QualityEngine::default();
        let mut record = trip();
        record.passenger_count = Some(7);
        record
            .extra_fields
            .insert("VendorID".to_string(), serde_json::json!(2));

        let outcome = engine.evaluate(vec![record], &RunId::from("abc"), now());
        let row = serde_json::to_value(&outcome.invalid[0]).unwrap();
        assert_eq!(row["failure_reason"], "numeric_range_violation");
        assert_eq!(row["run_id"], "abc");
        assert_eq!(row["failed_at"], "2024-02-01T06:00:00Z");
        assert_eq!(row["passenger_count"], 7);
        assert_eq!(row["VendorID"], 2);
        assert!(row.get("trip_duration_minutes").is_none());
    }

    #[test]
    fn test_source_columns_cannot_shadow_output_columns() {
        let engine = QualityEngine::default();
        let mut clean = trip();
        for (key, value) in [
            ("failure_reason", serde_json::json!("numeric_range_violation")),
            ("run_id", serde_json::json!("upstream-run")),
            ("year", serde_json::json!(1999)),
            ("VendorID", serde_json::json!(1)),
        ] {
            clean.extra_fields.insert(key.to_string(), value);
        }
        let mut bad = clean.clone();
        bad.passenger_count = Some(9);

        let outcome = engine.evaluate(vec![clean, bad], &RunId::from("run-7"), now());

        let valid = serde_json::to_value(&outcome.valid[0]).unwrap();
        assert!(valid.get("failure_reason").is_none());
        assert!(valid.get("run_id").is_none());
        assert_eq!(valid["year"], 2024);
        assert_eq!(valid["VendorID"], 1);

        let quarantined = serde_json::to_value(&outcome.invalid[0]).unwrap();
        assert_eq!(quarantined["run_id"], "run-7");
        assert_eq!(quarantined["failure_reason"], "numeric_range_violation");
        assert_eq!(quarantined["year"], 1999);
    }

    #[test]
    fn test_valid_row_has_no_failure_fields() {
        let engine = QualityEngine::default();
        let outcome = engine.evaluate(vec![trip()], &RunId::new(), now());
        let row = serde_json::to_value(&outcome.valid[0]).unwrap();
        assert!(row.get("failure_reason").is_none());
        assert!(row.get("failed_at").is_none());
        assert!(row.get("run_id").is_none());
        assert_eq!(row["year"], 2024);
        assert_eq!(row["month"], 1);
    }
}
