use super::{ReturnStore, StoreError};
use crate::classify::ClassificationResult;
use crate::models::{
    ClassificationUpdate, HistoryEntry, NewReturn, ReturnRecord, ReturnStatus, ReturnSummary,
    StatusChange, SummaryTotals,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    Row,
    sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow},
};
use std::time::Duration;
use tracing::{debug, info};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS return_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    order_id TEXT NOT NULL,
    product_id TEXT NOT NULL,
    product_name TEXT NOT NULL,
    product_category TEXT NOT NULL DEFAULT '',
    return_reason TEXT,
    customer_description TEXT NOT NULL DEFAULT '',
    customer_email TEXT,
    image_urls TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'pending',
    original_price REAL,
    resale_price REAL,
    ai_category TEXT,
    ai_reason TEXT,
    ai_recommendation TEXT,
    ai_confidence REAL,
    tags TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    processed_at TEXT
)
"#;

const CREATE_HISTORY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS return_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    return_id INTEGER NOT NULL REFERENCES return_items (id),
    status TEXT NOT NULL,
    notes TEXT,
    created_by TEXT,
    created_at TEXT NOT NULL
)
"#;

const CREATE_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_return_items_status ON return_items (status)";
const CREATE_ORDER_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_return_items_order ON return_items (order_id, product_id)";
const CREATE_HISTORY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_return_history_return ON return_history (return_id)";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let in_memory = database_url.contains(":memory:");
        // An in-memory database lives and dies with its single connection.
        let options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(10))
        };
        let pool = options.connect(database_url).await?;
        let store = Self { pool };
        store.ensure_table().await?;
        info!(target = "gemiturn.store", in_memory, "sqlite_store_connected");
        Ok(store)
    }

    async fn ensure_table(&self) -> Result<(), StoreError> {
        for statement in [
            CREATE_TABLE,
            CREATE_STATUS_INDEX,
            CREATE_ORDER_INDEX,
            CREATE_HISTORY_TABLE,
            CREATE_HISTORY_INDEX,
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn current_status<'c, E>(executor: E, id: i64) -> Result<ReturnStatus, StoreError>
    where
        E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
    {
        let status = sqlx::query_scalar::<_, String>("SELECT status FROM return_items WHERE id = ?")
            .bind(id)
            .fetch_optional(executor)
            .await?;
        status
            .map(|status| ReturnStatus::from_str(&status).unwrap_or_default())
            .ok_or(StoreError::NotFound(id))
    }

    async fn label_counts(&self, sql: &str) -> Result<Vec<(String, u64)>, StoreError> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<(String, u64), StoreError> {
                let label: String = row.try_get("label")?;
                let count: i64 = row.try_get("count")?;
                Ok((label, count.max(0) as u64))
            })
            .collect()
    }
}

#[async_trait]
impl ReturnStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn insert(&self, record: NewReturn) -> Result<ReturnRecord, StoreError> {
        let now = Utc::now();
        let image_urls = serde_json::to_string(&record.image_urls)?;
        let tags = serde_json::to_string(&record.tags)?;
        let classification = record.classification.as_ref();
        let done = sqlx::query(
            "INSERT INTO return_items (order_id, product_id, product_name, product_category, \
             return_reason, customer_description, customer_email, image_urls, status, \
             original_price, ai_category, ai_reason, ai_recommendation, ai_confidence, tags, \
             created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.order_id)
        .bind(&record.product_id)
        .bind(&record.product_name)
        .bind(&record.product_category)
        .bind(&record.return_reason)
        .bind(&record.customer_description)
        .bind(&record.customer_email)
        .bind(image_urls)
        .bind(record.status.as_str())
        .bind(record.original_price)
        .bind(classification.map(|c| c.category.clone()))
        .bind(classification.map(|c| c.reason.clone()))
        .bind(classification.map(|c| c.recommendation.clone()))
        .bind(classification.map(|c| c.confidence))
        .bind(tags)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = done.last_insert_rowid();
        debug!(target = "gemiturn.store", id, order_id = %record.order_id, "return_inserted");
        self.get(id).await?.ok_or(StoreError::NotFound(id))
    }

    async fn get(&self, id: i64) -> Result<Option<ReturnRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM return_items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn list(
        &self,
        status: Option<ReturnStatus>,
        limit: usize,
    ) -> Result<Vec<ReturnRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM return_items WHERE (?1 IS NULL OR status = ?1) ORDER BY id DESC LIMIT ?2",
        )
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn find_by_order(
        &self,
        order_id: &str,
        product_id: &str,
    ) -> Result<Option<ReturnRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM return_items WHERE order_id = ? AND product_id = ? LIMIT 1",
        )
        .bind(order_id)
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn fetch_unclassified(&self, limit: usize) -> Result<Vec<ReturnRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM return_items \
             WHERE status IN ('pending', 'processing') AND ai_category IS NULL \
             ORDER BY id LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn commit_classifications(
        &self,
        updates: &[ClassificationUpdate],
    ) -> Result<(), StoreError> {
        // Returning early drops `tx`, which rolls the whole batch back.
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        for update in updates {
            let done = sqlx::query(
                "UPDATE return_items SET ai_category = ?, ai_reason = ?, ai_recommendation = ?, \
                 ai_confidence = ?, updated_at = ? WHERE id = ?",
            )
            .bind(&update.result.category)
            .bind(&update.result.reason)
            .bind(&update.result.recommendation)
            .bind(update.result.confidence)
            .bind(now)
            .bind(update.id)
            .execute(&mut *tx)
            .await?;
            if done.rows_affected() == 0 {
                return Err(StoreError::NotFound(update.id));
            }
        }
        tx.commit().await?;
        debug!(target = "gemiturn.store", updates = updates.len(), "classifications_committed");
        Ok(())
    }

    async fn update_status(
        &self,
        id: i64,
        change: &StatusChange,
        created_by: Option<&str>,
    ) -> Result<ReturnRecord, StoreError> {
        let mut tx = self.pool.begin().await?;
        let previous = Self::current_status(&mut *tx, id).await?;
        let changed = previous != change.status;
        let now = Utc::now();
        let processed_at = (changed && change.status == ReturnStatus::Completed).then_some(now);
        sqlx::query(
            "UPDATE return_items SET status = ?, resale_price = COALESCE(?, resale_price), \
             processed_at = COALESCE(?, processed_at), updated_at = ? WHERE id = ?",
        )
        .bind(change.status.as_str())
        .bind(change.resale_price)
        .bind(processed_at)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if changed {
            sqlx::query(
                "INSERT INTO return_history (return_id, status, notes, created_by, created_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(change.status.as_str())
            .bind(change.history_note(previous))
            .bind(created_by)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(
            target = "gemiturn.store",
            id,
            from = previous.as_str(),
            to = change.status.as_str(),
            "return_status_updated"
        );
        self.get(id).await?.ok_or(StoreError::NotFound(id))
    }

    async fn add_history(
        &self,
        id: i64,
        notes: &str,
        created_by: Option<&str>,
    ) -> Result<HistoryEntry, StoreError> {
        let status = Self::current_status(&self.pool, id).await?;
        let now = Utc::now();
        let done = sqlx::query(
            "INSERT INTO return_history (return_id, status, notes, created_by, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(notes)
        .bind(created_by)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(HistoryEntry {
            id: done.last_insert_rowid(),
            return_id: id,
            status,
            notes: Some(notes.to_string()),
            created_by: created_by.map(str::to_string),
            created_at: now,
        })
    }

    async fn history(&self, id: i64) -> Result<Vec<HistoryEntry>, StoreError> {
        Self::current_status(&self.pool, id).await?;
        let rows = sqlx::query("SELECT * FROM return_history WHERE return_id = ? ORDER BY id DESC")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(history_from_row).collect()
    }

    async fn summary(&self) -> Result<ReturnSummary, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
             COALESCE(SUM(original_price), 0.0) AS amount, \
             COALESCE(SUM(resale_price), 0.0) AS recovered \
             FROM return_items",
        )
        .fetch_one(&self.pool)
        .await?;
        let spans = sqlx::query(
            "SELECT created_at, processed_at FROM return_items \
             WHERE status = 'completed' AND processed_at IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| -> Result<_, StoreError> {
            Ok((
                row.try_get::<DateTime<Utc>, _>("created_at")?,
                row.try_get::<DateTime<Utc>, _>("processed_at")?,
            ))
        })
        .collect::<Result<Vec<_>, StoreError>>()?;
        let totals = SummaryTotals {
            total_returns: row.try_get::<i64, _>("total")?.max(0) as u64,
            total_amount: row.try_get("amount")?,
            recovered_amount: row.try_get("recovered")?,
            processing_spans: spans,
        };
        let categories = self
            .label_counts(
                "SELECT product_category AS label, COUNT(*) AS count FROM return_items \
                 GROUP BY product_category",
            )
            .await?;
        let reasons = self
            .label_counts(
                "SELECT ai_reason AS label, COUNT(*) AS count FROM return_items \
                 WHERE ai_reason IS NOT NULL AND ai_reason <> '' GROUP BY ai_reason",
            )
            .await?;
        Ok(ReturnSummary::new(totals, categories, reasons))
    }
}

fn history_from_row(row: &SqliteRow) -> Result<HistoryEntry, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(HistoryEntry {
        id: row.try_get("id")?,
        return_id: row.try_get("return_id")?,
        status: ReturnStatus::from_str(&status).unwrap_or_default(),
        notes: row.try_get("notes")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

fn record_from_row(row: &SqliteRow) -> Result<ReturnRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let image_urls: String = row.try_get("image_urls")?;
    let tags: String = row.try_get("tags")?;
    let category: Option<String> = row.try_get("ai_category")?;
    let classification = match category {
        Some(category) => Some(ClassificationResult {
            category,
            reason: row.try_get::<Option<String>, _>("ai_reason")?.unwrap_or_default(),
            recommendation: row
                .try_get::<Option<String>, _>("ai_recommendation")?
                .unwrap_or_default(),
            confidence: row.try_get::<Option<f64>, _>("ai_confidence")?.unwrap_or(0.0),
        }),
        None => None,
    };
    Ok(ReturnRecord {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        product_id: row.try_get("product_id")?,
        product_name: row.try_get("product_name")?,
        product_category: row.try_get("product_category")?,
        return_reason: row.try_get("return_reason")?,
        customer_description: row.try_get("customer_description")?,
        customer_email: row.try_get("customer_email")?,
        image_urls: serde_json::from_str(&image_urls)?,
        status: ReturnStatus::from_str(&status).unwrap_or_default(),
        original_price: row.try_get("original_price")?,
        resale_price: row.try_get("resale_price")?,
        classification,
        tags: serde_json::from_str(&tags)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        processed_at: row.try_get::<Option<DateTime<Utc>>, _>("processed_at")?,
    })
}
