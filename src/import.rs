use crate::{
    classify::{ClassificationRequest, ClassificationResult, Classifier},
    llm::ImageBlob,
    models::{ProductMetadata, ReturnRecord, ReturnStatus, classification_text},
    platform::{ImportFilter, PlatformApi, PlatformError, PlatformReturn},
    store::{ReturnStore, StoreError},
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ImportReport {
    pub imported: usize,
    /// Requests whose (order_id, product_id) pair was already stored.
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub record_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessedReturn {
    pub external_id: String,
    pub classification: ClassificationResult,
    pub tags: Vec<String>,
    pub images_analyzed: usize,
    pub status_synced: bool,
}

/// Pulls return requests from the platform, classifies them and stores them.
#[derive(Clone)]
pub struct ImportService {
    platform: Arc<dyn PlatformApi>,
    classifier: Arc<Classifier>,
    store: Arc<dyn ReturnStore>,
}

struct Analysis {
    classification: ClassificationResult,
    tags: Vec<String>,
    images: usize,
}

impl ImportService {
    pub fn new(
        platform: Arc<dyn PlatformApi>,
        classifier: Arc<Classifier>,
        store: Arc<dyn ReturnStore>,
    ) -> Self {
        Self {
            platform,
            classifier,
            store,
        }
    }

    pub async fn import_returns(&self, filter: &ImportFilter) -> ImportReport {
        let mut report = ImportReport::default();
        if let Err(err) = self.platform.authenticate().await {
            error!(target = "gemiturn.import", error = %err, "import_auth_failed");
            report.errors.push(err.to_string());
            return report;
        }

        let requests = match self.platform.fetch_returns(filter).await {
            Ok(requests) => requests,
            Err(err) => {
                error!(target = "gemiturn.import", error = %err, "import_fetch_failed");
                report.errors.push(err.to_string());
                return report;
            }
        };
        info!(
            target = "gemiturn.import",
            platform = self.platform.name(),
            fetched = requests.len(),
            "import_started"
        );

        for request in requests {
            let external_id = request.id.clone();
            match self.import_one(request).await {
                Ok(Some(record)) => {
                    report.imported += 1;
                    report.record_ids.push(record.id);
                }
                Ok(None) => report.skipped += 1,
                Err(err) => {
                    warn!(
                        target = "gemiturn.import",
                        external_id = %external_id,
                        error = %err,
                        "import_request_failed"
                    );
                    report.failed += 1;
                    report.errors.push(format!("{external_id}: {err}"));
                }
            }
        }

        info!(
            target = "gemiturn.import",
            imported = report.imported,
            skipped = report.skipped,
            failed = report.failed,
            "import_finished"
        );
        report
    }

    async fn import_one(&self, request: PlatformReturn) -> Result<Option<ReturnRecord>, ImportError> {
        if self
            .store
            .find_by_order(&request.order_id, &request.product_id)
            .await?
            .is_some()
        {
            info!(
                target = "gemiturn.import",
                order_id = %request.order_id,
                product_id = %request.product_id,
                "import_request_exists"
            );
            return Ok(None);
        }

        let image_urls = self.platform.fetch_image_urls(&request.id).await?;
        let analysis = self.analyze(&request, &image_urls).await;
        let mut new_return = request.into_new_return(image_urls);
        new_return.classification = Some(analysis.classification);
        new_return.tags = analysis.tags;
        let record = self.store.insert(new_return).await?;
        info!(
            target = "gemiturn.import",
            id = record.id,
            order_id = %record.order_id,
            images = analysis.images,
            "return_imported"
        );
        Ok(Some(record))
    }

    /// Classifies one platform return without storing it. With `sync_status`
    /// the platform is told the return is now processing.
    pub async fn process_single(
        &self,
        external_id: &str,
        sync_status: bool,
    ) -> Result<ProcessedReturn, ImportError> {
        let request = self.platform.fetch_return(external_id).await?;
        let image_urls = self.platform.fetch_image_urls(external_id).await?;
        let analysis = self.analyze(&request, &image_urls).await;

        if sync_status {
            self.platform
                .update_status(
                    external_id,
                    ReturnStatus::Processing,
                    Some(&analysis.classification.recommendation),
                )
                .await?;
        }

        info!(
            target = "gemiturn.import",
            external_id,
            category = %analysis.classification.category,
            sync_status,
            "return_processed"
        );
        Ok(ProcessedReturn {
            external_id: external_id.to_string(),
            classification: analysis.classification,
            tags: analysis.tags,
            images_analyzed: analysis.images,
            status_synced: sync_status,
        })
    }

    async fn analyze(&self, request: &PlatformReturn, image_urls: &[String]) -> Analysis {
        let images = self.download_images(image_urls).await;
        let product = ProductMetadata {
            product_id: Some(request.product_id.clone()),
            name: request.product_name.clone(),
            category: request.product_category.clone(),
            price: request.original_price,
        };
        let description = classification_text(
            &request.customer_description,
            request.return_reason.as_deref(),
        );
        let classification = self
            .classifier
            .classify_request(ClassificationRequest {
                description: &description,
                product: &product,
                images: &images,
            })
            .await
            .result;
        let tags = self
            .classifier
            .generate_tags(&request.customer_description, &images)
            .await;
        Analysis {
            classification,
            tags,
            images: images.len(),
        }
    }

    /// A failed download is logged and left out.
    async fn download_images(&self, urls: &[String]) -> Vec<ImageBlob> {
        let mut images = Vec::with_capacity(urls.len());
        for url in urls {
            match self.platform.download_image(url).await {
                Ok(bytes) if !bytes.is_empty() => images.push(ImageBlob::new(bytes)),
                Ok(_) => warn!(target = "gemiturn.import", url = %url, "image_empty"),
                Err(err) => {
                    warn!(target = "gemiturn.import", url = %url, error = %err, "image_download_failed")
                }
            }
        }
        images
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        llm::{LlmError, scripted::ScriptedBackend},
        models::NewReturn,
        platform::MockPlatform,
        store::MemoryStore,
    };

    const REPLY: &str = r#"{"category":"Quality Issues","reason":"worn out","recommendation":"Discount and Resell","confidence":0.75}"#;

    fn script(records: usize) -> Vec<Result<String, LlmError>> {
        (0..records)
            .flat_map(|_| [Ok(REPLY.to_string()), Ok("worn, faded, fabric".to_string())])
            .collect()
    }

    fn service(
        backend: Arc<ScriptedBackend>,
        platform: Arc<MockPlatform>,
        store: Arc<MemoryStore>,
    ) -> ImportService {
        ImportService::new(platform, Arc::new(Classifier::new(backend)), store)
    }

    #[tokio::test]
    async fn imports_with_vision_and_skips_existing_pairs() {
        let backend = Arc::new(ScriptedBackend::new(script(2)));
        let platform = Arc::new(MockPlatform::new());
        let store = Arc::new(MemoryStore::new());
        store
            .insert(NewReturn {
                order_id: "ORD00002".into(),
                product_id: "PROD00003".into(),
                product_name: "Test Product 1".into(),
                product_category: String::new(),
                return_reason: None,
                customer_description: String::new(),
                customer_email: None,
                image_urls: Vec::new(),
                status: ReturnStatus::Pending,
                original_price: None,
                classification: None,
                tags: Vec::new(),
            })
            .await
            .unwrap();

        let report = service(backend.clone(), platform.clone(), store.clone())
            .import_returns(&ImportFilter {
                limit: 3,
                ..ImportFilter::default()
            })
            .await;

        assert!(platform.is_authenticated());
        assert_eq!(report.imported, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);
        let calls = backend.calls();
        assert_eq!(calls.len(), 4);
        assert!(calls.iter().all(|call| call.vision && call.image_count == 2));

        let stored = store.get(report.record_ids[0]).await.unwrap().unwrap();
        assert_eq!(stored.order_id, "ORD00004");
        assert_eq!(stored.tags, vec!["worn", "faded", "fabric"]);
        assert_eq!(
            stored.classification.map(|c| c.category),
            Some("Quality Issues".to_string())
        );
        assert_eq!(stored.image_urls.len(), 2);
    }

    #[tokio::test]
    async fn backend_failure_still_imports_with_fallback() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(LlmError::Status {
                status: 503,
                message: "overloaded".into(),
            }),
            Err(LlmError::Http("timeout".into())),
        ]));
        let store = Arc::new(MemoryStore::new());
        let report = service(backend, Arc::new(MockPlatform::new()), store.clone())
            .import_returns(&ImportFilter {
                limit: 1,
                ..ImportFilter::default()
            })
            .await;
        assert_eq!(report.imported, 1);
        let stored = store.get(report.record_ids[0]).await.unwrap().unwrap();
        let classification = stored.classification.unwrap();
        assert_eq!(classification.category, "Uncategorized");
        assert!(stored.tags.is_empty());
    }

    #[tokio::test]
    async fn process_single_syncs_status_with_recommendation() {
        let backend = Arc::new(ScriptedBackend::new(script(1)));
        let platform = Arc::new(MockPlatform::new());
        let store = Arc::new(MemoryStore::new());
        let processed = service(backend, platform.clone(), store.clone())
            .process_single("RET00004", true)
            .await
            .unwrap();

        assert_eq!(processed.classification.recommendation, "Discount and Resell");
        assert_eq!(processed.images_analyzed, 2);
        assert!(processed.status_synced);
        let remote = platform.fetch_return("RET00004").await.unwrap();
        assert_eq!(remote.status.as_deref(), Some("processing"));
        assert_eq!(
            platform.notes("RET00004").await.as_deref(),
            Some("Discount and Resell")
        );
        assert!(store.list(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn process_single_unknown_id_is_an_error() {
        let backend = Arc::new(ScriptedBackend::new(Vec::new()));
        let err = service(
            backend.clone(),
            Arc::new(MockPlatform::new()),
            Arc::new(MemoryStore::new()),
        )
        .process_single("RET99999", false)
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            ImportError::Platform(PlatformError::NotFound(_))
        ));
        assert!(backend.calls().is_empty());
    }
}
