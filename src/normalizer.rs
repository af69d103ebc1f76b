//! Parsing of telemetry payload text into typed records.
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{ParseError, StorageError};
use crate::model::{to_row, Collection, FeedingDiagnostics, FeedingRecord, HealthRecord, Row};

/// Telemetry classes, one per subscribed topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryClass {
    Health,
    Feeding,
}

impl TelemetryClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryClass::Health => "health",
            TelemetryClass::Feeding => "feeding",
        }
    }
}

/// A parsed message ready for insertion.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Health(HealthRecord),
    Feeding(FeedingRecord),
}

impl Normalized {
    pub fn collection(&self) -> Collection {
        match self {
            Normalized::Health(_) => Collection::HealthRecords,
            Normalized::Feeding(_) => Collection::FeedingRecords,
        }
    }

    pub fn pet_id(&self) -> Option<&str> {
        match self {
            Normalized::Health(r) => Some(&r.pet_id),
            Normalized::Feeding(r) => r.pet_id.as_deref(),
        }
    }

    pub fn to_row(&self) -> Result<Row, StorageError> {
        let row = match self {
            Normalized::Health(r) => to_row(r),
            Normalized::Feeding(r) => to_row(r),
        };
        row.map_err(StorageError::Encode)
    }
}

/// Parse `text` according to `class`.
pub fn normalize(
    class: TelemetryClass,
    topic: &str,
    text: &str,
    received_at: DateTime<Utc>,
) -> Result<Normalized, ParseError> {
    match class {
        TelemetryClass::Health => parse_health(text).map(Normalized::Health),
        TelemetryClass::Feeding => parse_feeding(topic, text, received_at).map(Normalized::Feeding),
    }
}

/// Parse a vitals payload. `pet_id` is mandatory; every vital is optional, and
/// a vital that is not numeric is stored as absent.
/// `recorded_at` is the parse time, not any timestamp inside the payload.
pub fn parse_health(text: &str) -> Result<HealthRecord, ParseError> {
    let doc = parse_object(text)?;
    let pet_id = pet_id(&doc)?.ok_or(ParseError::MissingField("pet_id"))?;

    Ok(HealthRecord {
        pet_id,
        temperature: vital(&doc, "temperature"),
        heart_rate: vital(&doc, "heart_rate"),
        oxygen_level: vital(&doc, "oxygen_level"),
        recorded_at: Utc::now(),
    })
}

/// Parse a feeding payload. The text is kept verbatim in `feeding_data`; only
/// `pet_id` is extracted for indexing, and the sensor sub-fields are read for
/// diagnostics.
pub fn parse_feeding(
    topic: &str,
    text: &str,
    received_at: DateTime<Utc>,
) -> Result<FeedingRecord, ParseError> {
    let doc = parse_object(text)?;
    let pet_id = pet_id(&doc).unwrap_or_else(|e| {
        warn!(error = %e, "ignoring unusable pet_id in feeding payload");
        None
    });

    Ok(FeedingRecord {
        pet_id,
        timestamp: received_at,
        topic: topic.to_string(),
        feeding_data: text.to_string(),
        diagnostics: FeedingDiagnostics {
            angle: loose_number(&doc, "angle"),
            weight: loose_number(&doc, "weight"),
            laser_distance: loose_number(&doc, "laser_distance"),
        },
    })
}

fn parse_object(text: &str) -> Result<Map<String, Value>, ParseError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => Ok(map),
        _ => Err(ParseError::NotAnObject),
    }
}

/// Identifiers arrive as strings or bare numbers; both are stored as text.
fn pet_id(doc: &Map<String, Value>) -> Result<Option<String>, ParseError> {
    match doc.get("pet_id") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(ParseError::InvalidField {
            field: "pet_id",
            reason: format!("must be a string or number, got {other}"),
        }),
    }
}

fn vital(doc: &Map<String, Value>, field: &'static str) -> Option<f64> {
    match doc.get(field) {
        None | Some(Value::Null) => None,
        Some(value) => {
            let parsed = number(value);
            if parsed.is_none() {
                warn!(field, %value, "non-numeric vital stored as absent");
            }
            parsed
        }
    }
}

fn loose_number(doc: &Map<String, Value>, field: &str) -> Option<f64> {
    doc.get(field).and_then(number)
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
