//! Record types exchanged over the bus and persisted in the store.
//!
//! Field names on the wire follow the device firmware's JSON: a sample is
//! `{"id", "type", "name", "unit", "min", "max", "time", "value"}`, an event
//! is `{"id", "message", "priority", "time", ...}` and a rollup is
//! `{"max", "min", "avg", "n"}`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unix timestamp of Go's zero `time.Time` (0001-01-01T00:00:00Z).
///
/// Some firmware serializes an unset time this way instead of omitting it.
const ZERO_TIME_SECS: i64 = -62_135_596_800;

/// Returns `time` if it carries a real instant, otherwise `now`.
///
/// A timestamp counts as unset when it is absent, the Unix epoch, or the
/// zero time some firmware emits.
pub fn effective_time(time: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match time {
        Some(t) if t.timestamp() != 0 && t.timestamp() != ZERO_TIME_SECS => t,
        _ => now,
    }
}

/// A network-attached telemetry source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Stable device identifier; also the device's telemetry topic.
    pub id: String,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Firmware or protocol version.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Sensors this device reports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub out: Vec<ValueDescriptor>,
    /// Commands this device accepts on `<id>-call`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<Method>,
}

impl Device {
    /// Looks up the declared output with the given sensor id.
    pub fn declared_output(&self, sensor_id: &str) -> Option<&ValueDescriptor> {
        self.out.iter().find(|o| o.id == sensor_id)
    }

    /// Returns `true` if the device declares a method with this name.
    pub fn declares_method(&self, name: &str) -> bool {
        self.methods.iter().any(|m| m.name == name)
    }
}

/// Declaration of one sensor output in a discovery message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueDescriptor {
    /// Sensor id.
    pub id: String,
    /// Value type, e.g. `"number"`, `"bool"`, `"string"`.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Unit of measure.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unit: String,
    /// Lower bound of the sensor range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<Payload>,
    /// Upper bound of the sensor range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<Payload>,
}

/// A command a device accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Method {
    /// Method name.
    pub name: String,
    /// Declared parameters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
}

/// A declared method parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    /// Parameter name.
    pub name: String,
    /// Parameter type.
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Scalar carried by a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// `true` / `false`.
    Bool(bool),
    /// Any JSON number.
    Number(f64),
    /// Any JSON string.
    Text(String),
}

impl Payload {
    /// Coerces the payload to a number for aggregation.
    ///
    /// Numbers pass through, strings are parsed after trimming, booleans and
    /// non-finite values yield `None`.
    pub fn as_f64(&self) -> Option<f64> {
        let value = match self {
            Self::Number(n) => *n,
            Self::Text(s) => s.trim().parse::<f64>().ok()?,
            Self::Bool(_) => return None,
        };
        value.is_finite().then_some(value)
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// One timestamped sensor reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    /// Sensor id, unique within its device.
    pub id: String,
    /// Value type; empty means numeric.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Unit of measure.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unit: String,
    /// Lower bound of the sensor range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<Payload>,
    /// Upper bound of the sensor range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<Payload>,
    /// Sample time; stamped with the ingestion time when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// The reading.
    #[serde(rename = "value", default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

impl Value {
    /// Creates a numeric sample with no metadata.
    pub fn number(sensor_id: impl Into<String>, reading: f64, time: DateTime<Utc>) -> Self {
        Self {
            id: sensor_id.into(),
            kind: String::new(),
            name: String::new(),
            unit: String::new(),
            min: None,
            max: None,
            time: Some(time),
            payload: Some(Payload::Number(reading)),
        }
    }
}

/// Severity of an [`Event`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    /// Informational.
    #[default]
    Ok,
    /// Needs attention.
    Warning,
    /// Failure.
    Error,
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, String> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Warning),
            2 => Ok(Self::Error),
            other => Err(format!("unknown priority {other} (expected 0, 1 or 2)")),
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        match priority {
            Priority::Ok => 0,
            Priority::Warning => 1,
            Priority::Error => 2,
        }
    }
}

/// A timestamped, prioritized notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event source identifier (a device id or a system component).
    pub id: String,
    /// Human-readable text.
    #[serde(default)]
    pub message: String,
    /// Severity.
    #[serde(default)]
    pub priority: Priority,
    /// Event time; stamped with the ingestion time when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Any other attributes the publisher attached.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Rolling summary of one sensor over one period window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// Largest sample.
    pub max: f64,
    /// Smallest sample.
    pub min: f64,
    /// Arithmetic mean.
    pub avg: f64,
    /// Number of samples summarized.
    pub n: u64,
}

/// Rollup granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    /// Clock hour.
    Hour,
    /// Calendar day.
    Day,
    /// ISO week starting Monday.
    Week,
    /// Calendar month.
    Month,
}

impl PeriodKind {
    /// Every kind, finest first.
    pub const ALL: [PeriodKind; 4] = [Self::Hour, Self::Day, Self::Week, Self::Month];

    /// Name used in meta keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }
}

impl fmt::Display for PeriodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeriodKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            other => Err(format!("unknown period '{other}' (use hour, day, week or month)")),
        }
    }
}

/// A device-directed command published on `<device>-call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Method to invoke.
    pub method: String,
    /// Named arguments.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}
