use super::{ReturnStore, StoreError};
use crate::models::{
    ClassificationUpdate, HistoryEntry, NewReturn, ReturnRecord, ReturnStatus, ReturnSummary,
    StatusChange, SummaryTotals,
};
use async_trait::async_trait;
use chrono::Utc;
#[cfg(test)]
use std::sync::atomic::AtomicUsize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicBool, Ordering},
};
use tokio::sync::Mutex;

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_commits: AtomicBool,
    #[cfg(test)]
    commits: AtomicUsize,
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    records: BTreeMap<i64, ReturnRecord>,
    next_history_id: i64,
    history: Vec<HistoryEntry>,
}

impl MemoryState {
    fn push_history(
        &mut self,
        return_id: i64,
        status: ReturnStatus,
        notes: String,
        created_by: Option<&str>,
    ) -> HistoryEntry {
        self.next_history_id += 1;
        let entry = HistoryEntry {
            id: self.next_history_id,
            return_id,
            status,
            notes: Some(notes),
            created_by: created_by.map(str::to_string),
            created_at: Utc::now(),
        };
        self.history.push(entry.clone());
        entry
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following commit fail with a database error.
    #[cfg(test)]
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Calls to `commit_classifications`, failed ones included.
    #[cfg(test)]
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReturnStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn insert(&self, record: NewReturn) -> Result<ReturnRecord, StoreError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let now = Utc::now();
        let stored = ReturnRecord {
            id: state.next_id,
            order_id: record.order_id,
            product_id: record.product_id,
            product_name: record.product_name,
            product_category: record.product_category,
            return_reason: record.return_reason,
            customer_description: record.customer_description,
            customer_email: record.customer_email,
            image_urls: record.image_urls,
            status: record.status,
            original_price: record.original_price,
            resale_price: None,
            classification: record.classification,
            tags: record.tags,
            created_at: now,
            updated_at: now,
            processed_at: None,
        };
        state.records.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: i64) -> Result<Option<ReturnRecord>, StoreError> {
        Ok(self.state.lock().await.records.get(&id).cloned())
    }

    async fn list(
        &self,
        status: Option<ReturnStatus>,
        limit: usize,
    ) -> Result<Vec<ReturnRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .rev()
            .filter(|record| status.is_none_or(|wanted| record.status == wanted))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_by_order(
        &self,
        order_id: &str,
        product_id: &str,
    ) -> Result<Option<ReturnRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .find(|record| record.order_id == order_id && record.product_id == product_id)
            .cloned())
    }

    async fn fetch_unclassified(&self, limit: usize) -> Result<Vec<ReturnRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|record| record.status.awaits_triage() && record.classification.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn commit_classifications(
        &self,
        updates: &[ClassificationUpdate],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        #[cfg(test)]
        self.commits.fetch_add(1, Ordering::SeqCst);
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StoreError::Database("commit rejected".into()));
        }
        if let Some(missing) = updates
            .iter()
            .find(|update| !state.records.contains_key(&update.id))
        {
            return Err(StoreError::NotFound(missing.id));
        }
        let now = Utc::now();
        for update in updates {
            if let Some(record) = state.records.get_mut(&update.id) {
                record.classification = Some(update.result.clone());
                record.updated_at = now;
            }
        }
        Ok(())
    }

    async fn update_status(
        &self,
        id: i64,
        change: &StatusChange,
        created_by: Option<&str>,
    ) -> Result<ReturnRecord, StoreError> {
        let mut state = self.state.lock().await;
        let record = state.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let previous = record.status;
        let now = Utc::now();
        record.status = change.status;
        if let Some(price) = change.resale_price {
            record.resale_price = Some(price);
        }
        if previous != change.status && change.status == ReturnStatus::Completed {
            record.processed_at = Some(now);
        }
        record.updated_at = now;
        let updated = record.clone();
        if previous != change.status {
            state.push_history(id, change.status, change.history_note(previous), created_by);
        }
        Ok(updated)
    }

    async fn add_history(
        &self,
        id: i64,
        notes: &str,
        created_by: Option<&str>,
    ) -> Result<HistoryEntry, StoreError> {
        let mut state = self.state.lock().await;
        let status = state
            .records
            .get(&id)
            .map(|record| record.status)
            .ok_or(StoreError::NotFound(id))?;
        Ok(state.push_history(id, status, notes.to_string(), created_by))
    }

    async fn history(&self, id: i64) -> Result<Vec<HistoryEntry>, StoreError> {
        let state = self.state.lock().await;
        if !state.records.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        Ok(state
            .history
            .iter()
            .rev()
            .filter(|entry| entry.return_id == id)
            .cloned()
            .collect())
    }

    async fn summary(&self) -> Result<ReturnSummary, StoreError> {
        let state = self.state.lock().await;
        let mut totals = SummaryTotals::default();
        let mut categories: HashMap<String, u64> = HashMap::new();
        let mut reasons: HashMap<String, u64> = HashMap::new();
        for record in state.records.values() {
            totals.total_returns += 1;
            totals.total_amount += record.original_price.unwrap_or(0.0);
            totals.recovered_amount += record.resale_price.unwrap_or(0.0);
            if record.status == ReturnStatus::Completed
                && let Some(processed) = record.processed_at
            {
                totals.processing_spans.push((record.created_at, processed));
            }
            *categories.entry(record.product_category.clone()).or_default() += 1;
            if let Some(result) = &record.classification
                && !result.reason.is_empty()
            {
                *reasons.entry(result.reason.clone()).or_default() += 1;
            }
        }
        Ok(ReturnSummary::new(totals, categories, reasons))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ClassificationResult;

    fn new_return(order: &str, status: ReturnStatus) -> NewReturn {
        NewReturn {
            order_id: order.into(),
            product_id: format!("P-{order}"),
            product_name: "Kettle".into(),
            product_category: "Home".into(),
            return_reason: Some("Quality Issues".into()),
            customer_description: "Leaks from the base".into(),
            customer_email: None,
            image_urls: Vec::new(),
            status,
            original_price: Some(39.0),
            classification: None,
            tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn unclassified_filter_checks_status_and_classification() {
        let store = MemoryStore::new();
        let pending = store.insert(new_return("A", ReturnStatus::Pending)).await.unwrap();
        store.insert(new_return("B", ReturnStatus::Completed)).await.unwrap();
        let mut classified = new_return("C", ReturnStatus::Processing);
        classified.classification = Some(ClassificationResult::fallback());
        store.insert(classified).await.unwrap();
        let processing = store.insert(new_return("D", ReturnStatus::Processing)).await.unwrap();

        let ids: Vec<i64> = store
            .fetch_unclassified(10)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![pending.id, processing.id]);
        assert_eq!(store.fetch_unclassified(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_id_aborts_whole_commit() {
        let store = MemoryStore::new();
        let record = store.insert(new_return("A", ReturnStatus::Pending)).await.unwrap();
        let err = store
            .commit_classifications(&[
                ClassificationUpdate {
                    id: record.id,
                    result: ClassificationResult::fallback(),
                },
                ClassificationUpdate {
                    id: 999,
                    result: ClassificationResult::fallback(),
                },
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(999)));
        let reloaded = store.get(record.id).await.unwrap().unwrap();
        assert!(reloaded.classification.is_none());
    }

    #[tokio::test]
    async fn status_change_writes_history_and_stamps_completion() {
        let store = MemoryStore::new();
        let record = store.insert(new_return("A", ReturnStatus::Pending)).await.unwrap();

        let updated = store
            .update_status(
                record.id,
                &StatusChange {
                    resale_price: Some(20.0),
                    ..StatusChange::new(ReturnStatus::Completed)
                },
                Some("ops"),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, ReturnStatus::Completed);
        assert_eq!(updated.resale_price, Some(20.0));
        assert!(updated.processed_at.is_some());

        // Same status again: price moves, no new history entry.
        store
            .update_status(
                record.id,
                &StatusChange {
                    resale_price: Some(25.0),
                    ..StatusChange::new(ReturnStatus::Completed)
                },
                None,
            )
            .await
            .unwrap();
        store.add_history(record.id, "Customer called", None).await.unwrap();

        let history = store.history(record.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].notes.as_deref(), Some("Customer called"));
        assert_eq!(history[0].status, ReturnStatus::Completed);
        assert_eq!(
            history[1].notes.as_deref(),
            Some("Status changed from pending to completed")
        );
        assert_eq!(history[1].created_by.as_deref(), Some("ops"));
        assert_eq!(
            store.get(record.id).await.unwrap().unwrap().resale_price,
            Some(25.0)
        );
    }

    #[tokio::test]
    async fn lifecycle_calls_reject_unknown_ids() {
        let store = MemoryStore::new();
        let change = StatusChange::new(ReturnStatus::Rejected);
        assert!(matches!(
            store.update_status(7, &change, None).await,
            Err(StoreError::NotFound(7))
        ));
        assert!(matches!(store.history(7).await, Err(StoreError::NotFound(7))));
        assert!(matches!(
            store.add_history(7, "x", None).await,
            Err(StoreError::NotFound(7))
        ));
    }

    #[tokio::test]
    async fn summary_counts_categories_and_model_reasons() {
        let store = MemoryStore::new();
        let mut classified = new_return("A", ReturnStatus::Pending);
        classified.classification = Some(ClassificationResult {
            category: "Quality Issues".into(),
            reason: "leaking seal".into(),
            recommendation: "Return to Supplier".into(),
            confidence: 0.8,
        });
        let a = store.insert(classified).await.unwrap();
        let mut fallback = new_return("B", ReturnStatus::Pending);
        fallback.classification = Some(ClassificationResult::fallback());
        store.insert(fallback).await.unwrap();
        let mut toy = new_return("C", ReturnStatus::Pending);
        toy.product_category = "Toys".into();
        store.insert(toy).await.unwrap();
        store
            .update_status(
                a.id,
                &StatusChange {
                    resale_price: Some(39.0),
                    ..StatusChange::new(ReturnStatus::Completed)
                },
                None,
            )
            .await
            .unwrap();

        let summary = store.summary().await.unwrap();
        assert_eq!(summary.total_returns, 3);
        assert_eq!(summary.total_amount, 117.0);
        assert_eq!(summary.recovered_amount, 39.0);
        assert!((summary.recovery_rate - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.categories[0].label, "Home");
        assert_eq!(summary.categories[0].count, 2);
        assert_eq!(summary.reasons.len(), 1);
        assert_eq!(summary.reasons[0].label, "leaking seal");
        assert_eq!(summary.reasons[0].percentage, 100.0);
    }

    #[tokio::test]
    async fn list_is_newest_first_and_filters_status() {
        let store = MemoryStore::new();
        store.insert(new_return("A", ReturnStatus::Pending)).await.unwrap();
        store.insert(new_return("B", ReturnStatus::Rejected)).await.unwrap();
        store.insert(new_return("C", ReturnStatus::Pending)).await.unwrap();
        let all = store.list(None, 10).await.unwrap();
        assert_eq!(all[0].order_id, "C");
        let pending = store.list(Some(ReturnStatus::Pending), 10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(store.find_by_order("B", "P-B").await.unwrap().is_some());
        assert!(store.find_by_order("B", "P-A").await.unwrap().is_none());
    }
}
