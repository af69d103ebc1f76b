use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row as _, SqlitePool};
use std::str::FromStr;
use tracing::{debug, instrument};

use super::{RecordStore, ReminderRow};
use crate::error::{InvalidReminder, StorageError};
use crate::model::{ActiveReminder, Collection, PetContact, ReminderConfig, Row};

static COLUMN_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid column regex"));

/// Local SQLite backend with the same tables as the hosted store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let normalized = prepare_sqlite_url(database_url);
        let options = SqliteConnectOptions::from_str(&normalized)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        if !normalized.starts_with("sqlite::memory") {
            sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(())
    }
}

/// Expand a leading `~/` in file-backed SQLite URLs and make sure the parent
/// directory exists. In-memory and non-sqlite URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{path}?{q}"),
        None => format!("sqlite://{path}"),
    }
}

fn reminder_from_row(row: &SqliteRow) -> ReminderRow {
    decode_reminder(row).map_err(|e| InvalidReminder {
        reminder_id: row
            .try_get::<String, _>("id")
            .unwrap_or_else(|_| "<unknown>".to_string()),
        reason: e.to_string(),
    })
}

fn decode_reminder(row: &SqliteRow) -> Result<ActiveReminder, StorageError> {
    let repeat_days: Option<String> = row.try_get("repeat_days")?;
    let repeat_days = match repeat_days.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(text) => Some(serde_json::from_str::<Vec<u8>>(text)?),
    };
    Ok(ActiveReminder {
        reminder: ReminderConfig {
            id: row.try_get("id")?,
            pet_id: row.try_get("pet_id")?,
            title: row.try_get("title")?,
            kind: row.try_get("type")?,
            description: row.try_get("description")?,
            scheduled_time: row.try_get("scheduled_time")?,
            repeat_days,
            active: row.try_get("active")?,
        },
        contact: PetContact {
            pet_name: row.try_get("name")?,
            owner_email: row.try_get("owner_email")?,
        },
    })
}

#[async_trait]
impl RecordStore for SqliteStore {
    #[instrument(skip_all, fields(collection = collection.as_str()))]
    async fn insert(&self, collection: Collection, mut row: Row) -> Result<(), StorageError> {
        if !row.contains_key("id") {
            row.insert("id".into(), Value::String(uuid::Uuid::new_v4().to_string()));
        }
        if let Some(bad) = row.keys().find(|k| !COLUMN_NAME.is_match(k)) {
            return Err(StorageError::InvalidColumn(bad.clone()));
        }

        let columns: Vec<&str> = row.keys().map(String::as_str).collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            collection.as_str(),
            columns.join(", "),
            placeholders
        );

        let mut query = sqlx::query(&sql);
        for value in row.values() {
            query = match value {
                Value::Null => query.bind(None::<String>),
                Value::Bool(b) => query.bind(*b),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => query.bind(i),
                    None => query.bind(n.as_f64()),
                },
                Value::String(s) => query.bind(s.clone()),
                other => query.bind(other.to_string()),
            };
        }
        query.execute(&self.pool).await?;
        debug!(sql = %sql, "row inserted");
        Ok(())
    }

    #[instrument(skip_all)]
    async fn active_reminders(&self) -> Result<Vec<ReminderRow>, StorageError> {
        // Orphaned reminders come back with a NULL name and fail per row.
        let rows = sqlx::query(
            "SELECT r.id, r.pet_id, r.title, r.type, r.description, r.scheduled_time,
                    r.repeat_days, r.active, p.name, p.owner_email
             FROM reminders r
             LEFT JOIN pets p ON p.id = r.pet_id
             WHERE r.active = 1
             ORDER BY r.id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(reminder_from_row).collect())
    }
}
