//! Trip record model.
//!
//! A [`Record`] is one row of a raw NYC TLC trip partition. Every field the
//! quality rules look at is optional so that a null in the source is a value
//! the rules can see, not a parse failure.

use chrono::{Datelike, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};

/// Opaque identifier correlating one trigger event with one pipeline run.
///
/// Also used as a partition key for quarantine output so that concurrent or
/// repeated runs never write to the same location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh run id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One trip observation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default, with = "timestamp")]
    pub tpep_pickup_datetime: Option<NaiveDateTime>,

    #[serde(default, with = "timestamp")]
    pub tpep_dropoff_datetime: Option<NaiveDateTime>,

    #[serde(default, deserialize_with = "lenient_integer")]
    pub passenger_count: Option<i64>,

    #[serde(default)]
    pub trip_distance: Option<f64>,

    #[serde(default)]
    pub fare_amount: Option<f64>,

    #[serde(default)]
    pub tip_amount: Option<f64>,

    #[serde(default)]
    pub tolls_amount: Option<f64>,

    #[serde(default)]
    pub extra: Option<f64>,

    #[serde(default)]
    pub mta_tax: Option<f64>,

    #[serde(default)]
    pub total_amount: Option<f64>,

    #[serde(default, deserialize_with = "lenient_integer")]
    pub payment_type: Option<i64>,

    /// Source columns the rules do not inspect (vendor, locations, ...).
    /// Carried through untouched so quarantine rows keep the full field set.
    #[serde(flatten)]
    pub extra_fields: serde_json::Map<String, serde_json::Value>,
}

/// Addressable record fields, named as in the source schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordField {
    #[serde(rename = "tpep_pickup_datetime")]
    PickupDatetime,
    #[serde(rename = "tpep_dropoff_datetime")]
    DropoffDatetime,
    PassengerCount,
    TripDistance,
    FareAmount,
    TipAmount,
    TollsAmount,
    Extra,
    MtaTax,
    TotalAmount,
    PaymentType,
}

impl RecordField {
    /// Source column name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PickupDatetime => "tpep_pickup_datetime",
            Self::DropoffDatetime => "tpep_dropoff_datetime",
            Self::PassengerCount => "passenger_count",
            Self::TripDistance => "trip_distance",
            Self::FareAmount => "fare_amount",
            Self::TipAmount => "tip_amount",
            Self::TollsAmount => "tolls_amount",
            Self::Extra => "extra",
            Self::MtaTax => "mta_tax",
            Self::TotalAmount => "total_amount",
            Self::PaymentType => "payment_type",
        }
    }

    /// Returns true for fields that hold a number.
    pub fn is_numeric(&self) -> bool {
        !matches!(self, Self::PickupDatetime | Self::DropoffDatetime)
    }
}

impl std::fmt::Display for RecordField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Record {
    /// Whether the field holds a value.
    pub fn is_present(&self, field: RecordField) -> bool {
        match field {
            RecordField::PickupDatetime => self.tpep_pickup_datetime.is_some(),
            RecordField::DropoffDatetime => self.tpep_dropoff_datetime.is_some(),
            other => self.numeric(other).is_some(),
        }
    }

    /// Numeric value of a field, widened to `f64`.
    ///
    /// Returns `None` for absent values and for timestamp fields.
    pub fn numeric(&self, field: RecordField) -> Option<f64> {
        match field {
            RecordField::PickupDatetime | RecordField::DropoffDatetime => None,
            RecordField::PassengerCount => self.passenger_count.map(|v| v as f64),
            RecordField::TripDistance => self.trip_distance,
            RecordField::FareAmount => self.fare_amount,
            RecordField::TipAmount => self.tip_amount,
            RecordField::TollsAmount => self.tolls_amount,
            RecordField::Extra => self.extra,
            RecordField::MtaTax => self.mta_tax,
            RecordField::TotalAmount => self.total_amount,
            RecordField::PaymentType => self.payment_type.map(|v| v as f64),
        }
    }

    /// `(year, month)` partition keys derived from the pickup timestamp.
    pub fn pickup_partition(&self) -> Option<(i32, u32)> {
        self.tpep_pickup_datetime
            .map(|ts| (ts.date().year(), ts.date().month()))
    }
}

/// Integer columns occasionally arrive as `2.0` in the source files.
fn lenient_integer<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    match value {
        None => Ok(None),
        Some(v) if v.fract() == 0.0 && v.is_finite() => Ok(Some(v as i64)),
        Some(v) => Err(serde::de::Error::custom(format!(
            "expected an integer, got {}",
            v
        ))),
    }
}

/// TLC timestamp format (`2024-01-15 10:30:00`), with `T` separator and
/// fractional seconds accepted on input.
pub(crate) mod timestamp {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";
    const INPUT_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

    pub fn serialize<S>(value: &Option<NaiveDateTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_str(&ts.format(FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => parse(s).map(Some).ok_or_else(|| {
                serde::de::Error::custom(format!("invalid timestamp: {}", s))
            }),
        }
    }

    pub fn parse(s: &str) -> Option<NaiveDateTime> {
        let s = s.trim_end_matches('Z');
        INPUT_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
    }
}
