use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde_json::Value;
use std::fmt;
use tracing::{debug, instrument, warn};

use super::{RecordStore, ReminderRow};
use crate::error::{InvalidReminder, StorageError};
use crate::model::{ActiveReminder, Collection, Row};

const REMINDER_SELECT: &str = "*,pets(name,owner_email)";

/// Client for a Supabase project's PostgREST endpoint.
#[derive(Clone)]
pub struct SupabaseStore {
    http: Client,
    rest_url: Url,
    api_key: String,
}

impl fmt::Debug for SupabaseStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupabaseStore")
            .field("rest_url", &self.rest_url)
            .finish_non_exhaustive()
    }
}

impl SupabaseStore {
    pub fn new(project_url: &str, api_key: String) -> Result<Self, StorageError> {
        let base = if project_url.ends_with('/') {
            project_url.to_string()
        } else {
            format!("{project_url}/")
        };
        let rest_url = Url::parse(&base)
            .and_then(|u| u.join("rest/v1/"))
            .map_err(|e| StorageError::InvalidUrl(format!("{project_url}: {e}")))?;
        let http = Client::builder()
            .user_agent("petcare-relay/0.1")
            .build()?;
        Ok(Self {
            http,
            rest_url,
            api_key,
        })
    }

    fn table_url(&self, table: &str) -> Result<Url, StorageError> {
        self.rest_url
            .join(table)
            .map_err(|e| StorageError::InvalidUrl(format!("{table}: {e}")))
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    pub fn build_insert(&self, collection: Collection, row: &Row) -> Result<reqwest::Request, StorageError> {
        let url = self.table_url(collection.as_str())?;
        Ok(self
            .request(Method::POST, url)
            .header("Content-Type", "application/json")
            .header("Prefer", "return=minimal")
            .json(row)
            .build()?)
    }

    pub fn build_active_reminders(&self) -> Result<reqwest::Request, StorageError> {
        let url = self.table_url("reminders")?;
        Ok(self
            .request(Method::GET, url)
            .query(&[("select", REMINDER_SELECT), ("active", "eq.true")])
            .build()?)
    }

    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, StorageError> {
        debug!(method = %request.method(), url = %request.url(), "sending store request");
        let res = self.http.execute(request).await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            warn!(status, %body, "store request rejected");
            return Err(StorageError::Status { status, body });
        }
        Ok(res)
    }
}

/// Decode a PostgREST reminder listing. The body must be a JSON array; each
/// element is decoded on its own.
pub fn parse_reminder_rows(body: &str) -> Result<Vec<ReminderRow>, StorageError> {
    let rows: Vec<Value> = serde_json::from_str(body)?;
    Ok(rows.into_iter().map(reminder_from_value).collect())
}

fn reminder_from_value(value: Value) -> ReminderRow {
    let reminder_id = match value.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "<unknown>".to_string(),
    };
    serde_json::from_value::<ActiveReminder>(value).map_err(|e| InvalidReminder {
        reminder_id,
        reason: e.to_string(),
    })
}

#[async_trait]
impl RecordStore for SupabaseStore {
    #[instrument(skip_all, fields(collection = collection.as_str()))]
    async fn insert(&self, collection: Collection, row: Row) -> Result<(), StorageError> {
        let request = self.build_insert(collection, &row)?;
        self.execute(request).await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn active_reminders(&self) -> Result<Vec<ReminderRow>, StorageError> {
        let request = self.build_active_reminders()?;
        let body = self.execute(request).await?.text().await?;
        parse_reminder_rows(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> SupabaseStore {
        SupabaseStore::new("https://demo.supabase.co", "secret".into()).unwrap()
    }

    fn header<'a>(request: &'a reqwest::Request, name: &str) -> &'a str {
        request
            .headers()
            .get(name)
            .and_then(|h| h.to_str().ok())
            .unwrap()
    }

    #[test]
    fn insert_request_targets_collection_with_auth_headers() {
        let mut row = Row::new();
        row.insert("pet_id".into(), json!("p-1"));
        let request = store().build_insert(Collection::HealthRecords, &row).unwrap();

        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.url().as_str(), "https://demo.supabase.co/rest/v1/health_records");
        assert_eq!(header(&request, "apikey"), "secret");
        assert_eq!(header(&request, "Authorization"), "Bearer secret");
        assert_eq!(header(&request, "Prefer"), "return=minimal");
        assert_eq!(header(&request, "Content-Type"), "application/json");

        let body = request.body().and_then(|b| b.as_bytes()).unwrap();
        let sent: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(sent, json!({ "pet_id": "p-1" }));
    }

    #[test]
    fn reminder_query_filters_active_and_joins_pets() {
        let store = SupabaseStore::new("https://demo.supabase.co/", "secret".into()).unwrap();
        let request = store.build_active_reminders().unwrap();
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.url().path(), "/rest/v1/reminders");
        let pairs: Vec<(String, String)> = request
            .url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("select".to_string(), REMINDER_SELECT.to_string()),
                ("active".to_string(), "eq.true".to_string()),
            ]
        );
    }

    #[test]
    fn invalid_project_url_is_rejected() {
        let err = SupabaseStore::new("not a url", "k".into()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidUrl(_)));
    }

    #[test]
    fn reminder_rows_deserialize_from_postgrest_shape() {
        let body = r#"[{
            "id": "r-1", "user_id": "u-1", "pet_id": "p-1", "type": "feeding",
            "title": "Breakfast", "description": null, "scheduled_time": "09:00:00",
            "repeat_days": [1, 3], "active": true,
            "pets": { "name": "Mochi", "owner_email": "owner@example.com" }
        }]"#;
        let rows = parse_reminder_rows(body).unwrap();
        assert_eq!(rows.len(), 1);
        let row = rows[0].as_ref().unwrap();
        assert_eq!(row.reminder.scheduled_hhmm(), "09:00");
        assert_eq!(row.reminder.repeat_days, Some(vec![1, 3]));
        assert_eq!(row.contact.pet_name, "Mochi");
    }

    #[test]
    fn bad_reminder_row_does_not_hide_its_neighbours() {
        let body = r#"[
            {"id": "r-1", "pet_id": "p-1", "type": "feeding", "title": "Breakfast",
             "scheduled_time": "09:00", "repeat_days": null, "active": true,
             "pets": {"name": "Mochi", "owner_email": "owner@example.com"}},
            {"id": "r-2", "pet_id": "p-2", "type": "medicine", "title": "Pills",
             "scheduled_time": "09:00", "repeat_days": [], "active": true, "pets": null},
            {"id": 3, "pet_id": "p-1", "type": "feeding", "title": "Dinner",
             "scheduled_time": "18:00", "repeat_days": [300], "active": true,
             "pets": {"name": "Mochi", "owner_email": null}}
        ]"#;
        let rows = parse_reminder_rows(body).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].as_ref().unwrap().reminder.id, "r-1");
        let bad = rows[1].as_ref().unwrap_err();
        assert_eq!(bad.reminder_id, "r-2");
        assert!(bad.reason.contains("PetContact"));
        assert_eq!(rows[2].as_ref().unwrap_err().reminder_id, "3");
    }

    #[test]
    fn non_array_reminder_body_is_a_storage_error() {
        let err = parse_reminder_rows(r#"{"message": "JWT expired"}"#).unwrap_err();
        assert!(matches!(err, StorageError::InvalidResponse(_)));
    }
}
