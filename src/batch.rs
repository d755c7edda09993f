use crate::{
    classify::{ClassificationRequest, Classifier},
    models::ClassificationUpdate,
    store::{ReturnStore, StoreError},
};
use serde::Serialize;
use std::{sync::Arc, time::Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub attempted: usize,
    /// Records that received a real model classification.
    pub succeeded: usize,
    /// Records that fell back to the default result.
    pub failed: usize,
    pub record_ids: Vec<i64>,
    pub elapsed_ms: u64,
}

impl BatchReport {
    fn empty(batch_id: Uuid) -> Self {
        Self {
            batch_id,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            record_ids: Vec::new(),
            elapsed_ms: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("batch {batch_id} rolled back: {source}")]
    Store {
        batch_id: Uuid,
        #[source]
        source: StoreError,
    },
}

impl BatchError {
    pub fn batch_id(&self) -> Uuid {
        match self {
            BatchError::Store { batch_id, .. } => *batch_id,
        }
    }
}

/// Classifies unclassified records one at a time and commits every result in
/// a single store transaction. Clones share one run lock, so the sync route
/// and the job worker never select the same records at once.
#[derive(Clone)]
pub struct BatchDriver {
    classifier: Arc<Classifier>,
    store: Arc<dyn ReturnStore>,
    default_limit: usize,
    max_limit: usize,
    running: Arc<Mutex<()>>,
}

impl BatchDriver {
    pub fn new(
        classifier: Arc<Classifier>,
        store: Arc<dyn ReturnStore>,
        default_limit: usize,
        max_limit: usize,
    ) -> Self {
        Self {
            classifier,
            store,
            default_limit: default_limit.min(max_limit),
            max_limit,
            running: Arc::new(Mutex::new(())),
        }
    }

    pub fn effective_limit(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.default_limit).min(self.max_limit)
    }

    pub async fn classify_batch(&self, limit: Option<usize>) -> Result<BatchReport, BatchError> {
        let batch_id = Uuid::new_v4();
        let limit = self.effective_limit(limit);
        if limit == 0 {
            return Ok(BatchReport::empty(batch_id));
        }

        // Held from selection through commit.
        let _running = self.running.lock().await;
        let started = Instant::now();
        let store_err = |source| BatchError::Store { batch_id, source };
        let records = self
            .store
            .fetch_unclassified(limit)
            .await
            .map_err(store_err)?;
        info!(
            target = "gemiturn.batch",
            batch_id = %batch_id,
            selected = records.len(),
            limit,
            "batch_started"
        );

        let mut updates = Vec::with_capacity(records.len());
        let mut succeeded = 0;
        let mut failed = 0;
        for record in &records {
            let description = record.classification_description();
            let product = record.product_metadata();
            let classification = self
                .classifier
                .classify_request(ClassificationRequest {
                    description: &description,
                    product: &product,
                    images: &[],
                })
                .await;
            if classification.outcome.is_fallback() {
                failed += 1;
            } else {
                succeeded += 1;
            }
            updates.push(ClassificationUpdate {
                id: record.id,
                result: classification.result,
            });
        }

        if let Err(err) = self.store.commit_classifications(&updates).await {
            error!(
                target = "gemiturn.batch",
                batch_id = %batch_id,
                error = %err,
                "batch_rolled_back"
            );
            return Err(store_err(err));
        }

        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::batch_completed(records.len(), succeeded, failed, elapsed_ms);
        info!(
            target = "gemiturn.batch",
            batch_id = %batch_id,
            attempted = records.len(),
            succeeded,
            failed,
            elapsed_ms = elapsed_ms as u64,
            "batch_committed"
        );

        Ok(BatchReport {
            batch_id,
            attempted: records.len(),
            succeeded,
            failed,
            record_ids: updates.iter().map(|update| update.id).collect(),
            elapsed_ms: elapsed_ms as u64,
        })
    }
}
