//! Recognition event records: decoding, normalization and validation.
//!
//! Terminal exports are loosely typed: the same field may arrive as a string,
//! a number or a Mongo extended-JSON wrapper, and several fields have legacy
//! aliases. Everything is folded into the fixed [`Record`] schema here.

use chrono::{DateTime, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::Sex;

/// Normalized timestamp layout.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Additional layouts accepted for naive timestamps.
const NAIVE_TIMESTAMP_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
];
/// String values that exporters use in place of a missing value.
const NULL_MARKERS: [&str; 4] = ["null", "none", "nan", "undefined"];
const MAX_PLAUSIBLE_AGE: u32 = 150;
const MAX_SCORE: f64 = 100.0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordParseError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("record is not a JSON object (found {0})")]
    NotAnObject(&'static str),
    #[error("record truncated at end of input")]
    Truncated,
}

/// A structural problem with a decoded record.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum ValidationIssue {
    #[error("missing required field `{field}`")]
    MissingField { field: &'static str },
    #[error("image URL is not http(s): {url}")]
    InvalidImageUrl { url: String },
    #[error("age {age} is out of range")]
    AgeOutOfRange { age: u32 },
    #[error("comparison score {score} is out of range")]
    ScoreOutOfRange { score: f64 },
}

/// One decoded face-recognition event.
///
/// Optional fields are `None` when the source omitted them or used a null
/// marker. Immutable once parsed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Event time normalized to `YYYY-MM-DD HH:MM:SS`, or the raw text when
    /// it could not be understood.
    pub timestamp: Option<String>,
    pub device_id: Option<String>,
    pub user_name: Option<String>,
    /// Sex as it appeared in the source (`eva_sex`, falling back to `sex`).
    pub sex_raw: Option<String>,
    pub sex: Sex,
    pub age: Option<u32>,
    /// Comparison score in percent.
    pub score: Option<f64>,
    pub image_url: Option<String>,
    pub face_id: Option<String>,
    pub company_id: Option<String>,
    pub event_type: Option<String>,
    pub user_list: Option<String>,
    pub ip_address: Option<String>,
    pub user_id: Option<String>,
    /// Mongo document id (`_id.$oid`) when the export carries one.
    pub mongo_id: Option<String>,
}

impl Record {
    /// Decode a record from raw JSON bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, RecordParseError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| RecordParseError::InvalidJson(e.to_string()))?;
        Self::from_value(&value)
    }

    /// Decode a record from an already-parsed JSON value.
    ///
    /// Unknown fields are ignored.
    pub fn from_value(value: &Value) -> Result<Self, RecordParseError> {
        let obj = match value {
            Value::Object(map) => map,
            other => return Err(RecordParseError::NotAnObject(json_type_name(other))),
        };

        let sex_raw = scalar(obj.get("eva_sex")).or_else(|| scalar(obj.get("sex")));
        let sex = sex_raw.as_deref().map(Sex::from_raw).unwrap_or_default();

        Ok(Self {
            timestamp: timestamp_field(obj.get("timestamp")),
            device_id: scalar(obj.get("device_id")),
            user_name: scalar(obj.get("user_name")),
            sex_raw,
            sex,
            age: scalar(obj.get("eva_age")).as_deref().and_then(parse_age),
            score: scalar(obj.get("comp_score")).as_deref().and_then(parse_score),
            image_url: scalar(obj.get("image")),
            face_id: scalar(obj.get("face_id")),
            company_id: scalar(obj.get("company_id")),
            event_type: scalar(obj.get("event_type")),
            user_list: scalar(obj.get("user_list")),
            ip_address: scalar(obj.get("IP")).or_else(|| scalar(obj.get("device_ip"))),
            user_id: scalar(obj.get("user_id")),
            mongo_id: mongo_id(obj),
        })
    }

    /// Run the structural validation pass. An empty result means valid.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        for (field, value) in [
            ("timestamp", &self.timestamp),
            ("device_id", &self.device_id),
            ("user_name", &self.user_name),
        ] {
            if value.is_none() {
                issues.push(ValidationIssue::MissingField { field });
            }
        }

        if let Some(url) = &self.image_url {
            let lower = url.to_ascii_lowercase();
            if !(lower.starts_with("http://") || lower.starts_with("https://")) {
                issues.push(ValidationIssue::InvalidImageUrl { url: url.clone() });
            }
        }

        if let Some(age) = self.age {
            if age > MAX_PLAUSIBLE_AGE {
                issues.push(ValidationIssue::AgeOutOfRange { age });
            }
        }

        if let Some(score) = self.score {
            if !(0.0..=MAX_SCORE).contains(&score) {
                issues.push(ValidationIssue::ScoreOutOfRange { score });
            }
        }

        issues
    }

    /// Hour of day (0–23) of the event, when the timestamp was understood.
    pub fn hour(&self) -> Option<u32> {
        let ts = self.timestamp.as_deref()?;
        NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT)
            .ok()
            .map(|dt| dt.hour())
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Read a scalar field as trimmed text, treating null markers as absent.
fn scalar(value: Option<&Value>) -> Option<String> {
    let text = match value? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => return None,
    };
    if text.is_empty() || NULL_MARKERS.contains(&text.to_lowercase().as_str()) {
        None
    } else {
        Some(text)
    }
}

fn timestamp_field(value: Option<&Value>) -> Option<String> {
    match value? {
        // Mongo extended JSON: {"$date": "..."} or {"$date": {"$numberLong": "..."}}
        Value::Object(map) => match map.get("$date")? {
            Value::Object(inner) => scalar(inner.get("$numberLong"))
                .and_then(|ms| ms.parse::<i64>().ok())
                .and_then(epoch_millis_to_string),
            Value::Number(n) => n.as_i64().and_then(epoch_millis_to_string),
            other => scalar(Some(other)).map(|raw| normalize_timestamp(&raw)),
        },
        other => scalar(Some(other)).map(|raw| normalize_timestamp(&raw)),
    }
}

fn epoch_millis_to_string(ms: i64) -> Option<String> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.format(TIMESTAMP_FORMAT).to_string())
}

/// Normalize a timestamp to `YYYY-MM-DD HH:MM:SS`.
///
/// RFC 3339 values keep their local wall-clock time; unrecognized values are
/// returned unchanged.
pub fn normalize_timestamp(raw: &str) -> String {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return dt.naive_local().format(TIMESTAMP_FORMAT).to_string();
    }
    let naive = raw.trim_end_matches('Z');
    for fmt in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, fmt) {
            return dt.format(TIMESTAMP_FORMAT).to_string();
        }
    }
    raw.to_string()
}

fn parse_age(raw: &str) -> Option<u32> {
    let age: f64 = raw.parse().ok()?;
    if age.is_finite() && age >= 0.0 {
        Some(age.trunc() as u32)
    } else {
        None
    }
}

/// Extract a percentage from values like `"87.5"`, `"87.5%"` or `87.5`.
fn parse_score(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|s| s.is_finite())
}

fn mongo_id(obj: &Map<String, Value>) -> Option<String> {
    match obj.get("_id")? {
        Value::Object(map) => scalar(map.get("$oid")),
        other => scalar(Some(other)),
    }
}
