pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::models::{
    ClassificationUpdate, HistoryEntry, NewReturn, ReturnRecord, ReturnStatus, ReturnSummary,
    StatusChange,
};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("return record {0} not found")]
    NotFound(i64),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        Self::Database(value.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

/// Persistence for return records.
#[async_trait]
pub trait ReturnStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn insert(&self, record: NewReturn) -> Result<ReturnRecord, StoreError>;

    async fn get(&self, id: i64) -> Result<Option<ReturnRecord>, StoreError>;

    /// Newest first.
    async fn list(
        &self,
        status: Option<ReturnStatus>,
        limit: usize,
    ) -> Result<Vec<ReturnRecord>, StoreError>;

    async fn find_by_order(
        &self,
        order_id: &str,
        product_id: &str,
    ) -> Result<Option<ReturnRecord>, StoreError>;

    /// Pending or processing records with no classification attached.
    async fn fetch_unclassified(&self, limit: usize) -> Result<Vec<ReturnRecord>, StoreError>;

    /// All updates land together or none do. An unknown id fails the commit.
    async fn commit_classifications(
        &self,
        updates: &[ClassificationUpdate],
    ) -> Result<(), StoreError>;

    /// Applies the status and resale price. A changed status writes one
    /// history entry in the same step, and a move to `completed` stamps
    /// `processed_at`.
    async fn update_status(
        &self,
        id: i64,
        change: &StatusChange,
        created_by: Option<&str>,
    ) -> Result<ReturnRecord, StoreError>;

    /// Free-form note recorded against the record's current status.
    async fn add_history(
        &self,
        id: i64,
        notes: &str,
        created_by: Option<&str>,
    ) -> Result<HistoryEntry, StoreError>;

    /// Newest first. Unknown ids are `NotFound`, not an empty list.
    async fn history(&self, id: i64) -> Result<Vec<HistoryEntry>, StoreError>;

    async fn summary(&self) -> Result<ReturnSummary, StoreError>;
}

/// `memory` selects the in-process store; anything else is a SQLite URL.
pub async fn open(database_url: &str) -> Result<Arc<dyn ReturnStore>, StoreError> {
    let store: Arc<dyn ReturnStore> = if database_url.trim().eq_ignore_ascii_case("memory") {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(SqliteStore::connect(database_url).await?)
    };
    info!(target = "gemiturn.store", backend = store.name(), "return_store_ready");
    Ok(store)
}
