use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Named collections in the shared store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Collection {
    HealthRecords,
    FeedingRecords,
    ReminderLogs,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::HealthRecords => "health_records",
            Collection::FeedingRecords => "feeding_records",
            Collection::ReminderLogs => "reminder_logs",
        }
    }
}

/// A field→value mapping handed to the store.
pub type Row = Map<String, Value>;

/// An inbound broker message, alive for one handler invocation.
#[derive(Debug, Clone)]
pub struct TelemetryMessage<'a> {
    pub topic: &'a str,
    pub raw_payload: &'a [u8],
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub pet_id: String,
    pub temperature: Option<f64>,
    pub heart_rate: Option<f64>,
    pub oxygen_level: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// Optional sensor readings carried inside a feeding payload. Only logged.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FeedingDiagnostics {
    pub angle: Option<f64>,
    pub weight: Option<f64>,
    pub laser_distance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedingRecord {
    pub pet_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    /// The payload text exactly as received.
    pub feeding_data: String,
    #[serde(skip)]
    pub diagnostics: FeedingDiagnostics,
}

/// Serialize a record into the mapping stored in its collection.
pub fn to_row<T: Serialize>(record: &T) -> Result<Row, serde_json::Error> {
    match serde_json::to_value(record)? {
        Value::Object(map) => Ok(map),
        other => Err(serde::ser::Error::custom(format!(
            "record serialized to {other}, expected an object"
        ))),
    }
}

/// A care reminder as configured by the owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderConfig {
    pub id: String,
    pub pet_id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub description: Option<String>,
    /// "HH:MM", possibly with trailing seconds.
    pub scheduled_time: String,
    /// Weekdays 0-6, Monday first. Empty or absent means every day.
    #[serde(default)]
    pub repeat_days: Option<Vec<u8>>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl ReminderConfig {
    /// The `HH:MM` part of the scheduled time.
    pub fn scheduled_hhmm(&self) -> &str {
        self.scheduled_time.get(..5).unwrap_or(&self.scheduled_time)
    }

    pub fn repeats_on(&self, weekday: u8) -> bool {
        match &self.repeat_days {
            None => true,
            Some(days) => days.is_empty() || days.contains(&weekday),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PetContact {
    #[serde(rename = "name")]
    pub pet_name: String,
    #[serde(default)]
    pub owner_email: Option<String>,
}

/// A reminder row joined with the contact details of its pet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveReminder {
    #[serde(flatten)]
    pub reminder: ReminderConfig,
    #[serde(rename = "pets")]
    pub contact: PetContact,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReminderLogStatus {
    Pending,
    Missed,
}

impl ReminderLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderLogStatus::Pending => "pending",
            ReminderLogStatus::Missed => "missed",
        }
    }
}

/// Audit entry written once per dispatched reminder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderLog {
    pub reminder_id: String,
    pub status: ReminderLogStatus,
    pub executed_at: DateTime<Utc>,
}
