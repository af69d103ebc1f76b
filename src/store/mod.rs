//! Storage gateway: typed access to the shared record store.
//!
//! Two backends implement [`RecordStore`]:
//! - `supabase`: the hosted PostgREST API used in production.
//! - `sqlite`: a local database with the same tables, for development and tests.
//!
//! Workers and the reminder dispatcher only ever hold an `Arc<dyn RecordStore>`.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::StoreConfig;
use crate::error::{InvalidReminder, StorageError};
use crate::model::{ActiveReminder, Collection, Row};

pub mod sqlite;
pub mod supabase;

pub use sqlite::SqliteStore;
pub use supabase::SupabaseStore;

/// One reminder row as read from the store. A row that cannot be decoded is
/// reported on its own instead of failing the whole query.
pub type ReminderRow = Result<ActiveReminder, InvalidReminder>;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a single row into `collection`.
    async fn insert(&self, collection: Collection, row: Row) -> Result<(), StorageError>;

    /// All reminders with `active = true`, joined with their pet's contact details.
    async fn active_reminders(&self) -> Result<Vec<ReminderRow>, StorageError>;
}

/// Build the backend selected in configuration.
pub async fn connect(cfg: &StoreConfig) -> Result<Arc<dyn RecordStore>, StorageError> {
    match cfg {
        StoreConfig::Supabase { url, api_key } => {
            Ok(Arc::new(SupabaseStore::new(url, api_key.clone())?))
        }
        StoreConfig::Sqlite { database_url } => {
            let store = SqliteStore::connect(database_url).await?;
            store.run_migrations().await?;
            Ok(Arc::new(store))
        }
    }
}
