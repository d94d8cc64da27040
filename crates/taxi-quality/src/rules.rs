//! Validation rules and rule sets.
//!
//! A [`RuleSet`] is an ordered list of [`ValidationRule`]s. Rules run in stage
//! order (completeness, range, temporal, derived) and the first violated rule
//! decides the record's failure reason. Later stages assume earlier ones
//! passed: derived values are only computed for records with both timestamps
//! and an in-range fare.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::QualityError;
use crate::record::{Record, RecordField};

/// Fixed failure reason codes written to quarantine output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationReason {
    NullInRequiredField,
    NumericRangeViolation,
    InvalidDatetimeOrder,
    TripDurationOutOfRange,
    TipPercentageOutOfRange,
}

impl ViolationReason {
    /// Every reason code, in rule-stage order.
    pub const ALL: [ViolationReason; 5] = [
        ViolationReason::NullInRequiredField,
        ViolationReason::NumericRangeViolation,
        ViolationReason::InvalidDatetimeOrder,
        ViolationReason::TripDurationOutOfRange,
        ViolationReason::TipPercentageOutOfRange,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NullInRequiredField => "null_in_required_field",
            Self::NumericRangeViolation => "numeric_range_violation",
            Self::InvalidDatetimeOrder => "invalid_datetime_order",
            Self::TripDurationOutOfRange => "trip_duration_out_of_range",
            Self::TipPercentageOutOfRange => "tip_percentage_out_of_range",
        }
    }
}

impl std::fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evaluation stage. Rules are sorted by stage when a rule set is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RuleStage {
    Completeness,
    Range,
    Temporal,
    Derived,
}

/// Values computed from a record once the non-derived stages passed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedValues {
    /// Minutes between pickup and dropoff; `None` when a timestamp is missing.
    pub trip_duration_minutes: Option<f64>,
    /// `tip / fare * 100`; `0.0` when the fare is not positive or the tip is absent.
    pub tip_percentage: f64,
}

impl DerivedValues {
    pub fn compute(record: &Record) -> Self {
        let trip_duration_minutes = match (record.tpep_pickup_datetime, record.tpep_dropoff_datetime)
        {
            (Some(pickup), Some(dropoff)) => {
                Some((dropoff - pickup).num_milliseconds() as f64 / 60_000.0)
            }
            _ => None,
        };

        let tip = record.tip_amount.unwrap_or(0.0);
        let tip_percentage = match record.fare_amount {
            Some(fare) if fare > 0.0 => tip * 100.0 / fare,
            _ => 0.0,
        };

        Self {
            trip_duration_minutes,
            tip_percentage,
        }
    }
}

/// The predicate a rule applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCheck {
    /// All listed fields must be non-null.
    Required { fields: Vec<RecordField> },
    /// Field must lie in `[min, max]` when present.
    Range { field: RecordField, min: f64, max: f64 },
    /// Dropoff strictly after pickup.
    TemporalOrder,
    /// Derived trip duration in `[min_minutes, max_minutes]`.
    TripDuration { min_minutes: f64, max_minutes: f64 },
    /// Derived tip percentage in `[min, max]`.
    TipPercentage { min: f64, max: f64 },
}

impl RuleCheck {
    pub fn stage(&self) -> RuleStage {
        match self {
            Self::Required { .. } => RuleStage::Completeness,
            Self::Range { .. } => RuleStage::Range,
            Self::TemporalOrder => RuleStage::Temporal,
            Self::TripDuration { .. } | Self::TipPercentage { .. } => RuleStage::Derived,
        }
    }

    pub fn reason(&self) -> ViolationReason {
        match self {
            Self::Required { .. } => ViolationReason::NullInRequiredField,
            Self::Range { .. } => ViolationReason::NumericRangeViolation,
            Self::TemporalOrder => ViolationReason::InvalidDatetimeOrder,
            Self::TripDuration { .. } => ViolationReason::TripDurationOutOfRange,
            Self::TipPercentage { .. } => ViolationReason::TipPercentageOutOfRange,
        }
    }
}

/// A named predicate over record fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub name: String,
    pub check: RuleCheck,
}

impl ValidationRule {
    pub fn new(name: impl Into<String>, check: RuleCheck) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }

    pub fn stage(&self) -> RuleStage {
        self.check.stage()
    }

    pub fn reason(&self) -> ViolationReason {
        self.check.reason()
    }

    /// Evaluate the rule. Returns the violation reason when the record fails.
    ///
    /// Total over every input: absent values are handled explicitly.
    pub fn check(&self, record: &Record, derived: &DerivedValues) -> Option<ViolationReason> {
        let passed = match &self.check {
            RuleCheck::Required { fields } => fields.iter().all(|f| record.is_present(*f)),
            RuleCheck::Range { field, min, max } => match record.numeric(*field) {
                Some(value) => value >= *min && value <= *max,
                None => true,
            },
            RuleCheck::TemporalOrder => {
                match (record.tpep_pickup_datetime, record.tpep_dropoff_datetime) {
                    (Some(pickup), Some(dropoff)) => dropoff > pickup,
                    _ => false,
                }
            }
            RuleCheck::TripDuration {
                min_minutes,
                max_minutes,
            } => match derived.trip_duration_minutes {
                Some(minutes) => minutes >= *min_minutes && minutes <= *max_minutes,
                None => false,
            },
            RuleCheck::TipPercentage { min, max } => {
                derived.tip_percentage >= *min && derived.tip_percentage <= *max
            }
        };

        if passed {
            None
        } else {
            Some(self.reason())
        }
    }

    fn validate(&self) -> Result<(), QualityError> {
        if self.name.trim().is_empty() {
            return Err(QualityError::invalid_rule("<unnamed>", "rule name is empty"));
        }

        let bounds = match &self.check {
            RuleCheck::Required { fields } => {
                if fields.is_empty() {
                    return Err(QualityError::invalid_rule(&self.name, "no required fields"));
                }
                None
            }
            RuleCheck::Range { field, min, max } => {
                if !field.is_numeric() {
                    return Err(QualityError::invalid_rule(
                        &self.name,
                        format!("range check on non-numeric field {}", field),
                    ));
                }
                Some((*min, *max))
            }
            RuleCheck::TemporalOrder => None,
            RuleCheck::TripDuration {
                min_minutes,
                max_minutes,
            } => Some((*min_minutes, *max_minutes)),
            RuleCheck::TipPercentage { min, max } => Some((*min, *max)),
        };

        if let Some((min, max)) = bounds {
            if !min.is_finite() || !max.is_finite() {
                return Err(QualityError::invalid_rule(&self.name, "bounds must be finite"));
            }
            if min > max {
                return Err(QualityError::invalid_rule(
                    &self.name,
                    format!("min {} greater than max {}", min, max),
                ));
            }
        }

        Ok(())
    }
}

/// Ordered, immutable collection of validation rules.
///
/// Build once and share behind an `Arc`; evaluation never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleSet {
    rules: Vec<ValidationRule>,
}

#[derive(Deserialize)]
struct RuleSetDocument {
    rules: Vec<ValidationRule>,
}

impl RuleSet {
    /// Build a rule set, validating each rule and sorting by stage.
    ///
    /// Sorting is stable, so rules within a stage keep their given order.
    /// Both timestamps must be required by some completeness rule: partition
    /// keys and derived values depend on them.
    pub fn new(mut rules: Vec<ValidationRule>) -> Result<Self, QualityError> {
        let mut names = HashSet::new();
        for rule in &rules {
            rule.validate()?;
            if !names.insert(rule.name.as_str()) {
                return Err(QualityError::invalid_rule(&rule.name, "duplicate rule name"));
            }
        }

        for timestamp in [RecordField::PickupDatetime, RecordField::DropoffDatetime] {
            let covered = rules.iter().any(|r| match &r.check {
                RuleCheck::Required { fields } => fields.contains(&timestamp),
                _ => false,
            });
            if !covered {
                return Err(QualityError::invalid_rule(
                    "<rule set>",
                    format!("{} must be a required field", timestamp),
                ));
            }
        }

        rules.sort_by_key(|r| r.stage());
        Ok(Self { rules })
    }

    /// The default NYC taxi rule set.
    pub fn taxi_default() -> Self {
        let range = |field: RecordField, min: f64, max: f64| {
            ValidationRule::new(
                format!("{}_range", field.as_str()),
                RuleCheck::Range { field, min, max },
            )
        };

        let rules = vec![
            ValidationRule::new(
                "required_fields",
                RuleCheck::Required {
                    fields: vec![
                        RecordField::PickupDatetime,
                        RecordField::DropoffDatetime,
                        RecordField::PassengerCount,
                        RecordField::TripDistance,
                        RecordField::FareAmount,
                        RecordField::TotalAmount,
                    ],
                },
            ),
            range(RecordField::PassengerCount, 1.0, 6.0),
            range(RecordField::TripDistance, 0.1, 100.0),
            range(RecordField::FareAmount, 0.01, 500.0),
            range(RecordField::TotalAmount, 0.01, 1000.0),
            range(RecordField::TipAmount, 0.0, 200.0),
            range(RecordField::TollsAmount, 0.0, 100.0),
            range(RecordField::Extra, 0.0, 10.0),
            range(RecordField::MtaTax, 0.0, 1.0),
            ValidationRule::new("dropoff_after_pickup", RuleCheck::TemporalOrder),
            ValidationRule::new(
                "trip_duration",
                RuleCheck::TripDuration {
                    min_minutes: 1.0,
                    max_minutes: 300.0,
                },
            ),
            ValidationRule::new(
                "tip_percentage",
                RuleCheck::TipPercentage {
                    min: 0.0,
                    max: 100.0,
                },
            ),
        ];

        Self { rules }
    }

    /// Parse a rule set from a YAML document with a top-level `rules` list.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, QualityError> {
        let document: RuleSetDocument = serde_yaml::from_str(yaml)?;
        Self::new(document.rules)
    }

    /// Load a rule set from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, QualityError> {
        let yaml = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&yaml)
    }

    pub fn rules(&self) -> &[ValidationRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::taxi_default()
    }
}
