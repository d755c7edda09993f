use crate::{
    batch::{BatchDriver, BatchReport},
    models::ApiError,
    security::AuthContext,
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::info;
use uuid::Uuid;

/// Background batch classification. A single worker drains the queue, so
/// queued batches run one after another.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<HashMap<Uuid, JobState>>>,
}

struct Job {
    id: Uuid,
    limit: Option<usize>,
    context: AuthContext,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { report: BatchReport },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

impl JobQueue {
    pub fn spawn(driver: BatchDriver, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        let statuses = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                {
                    let mut guard = statuses_bg.lock().await;
                    guard.insert(job.id, JobState::Running);
                }
                info!(
                    target = "gemiturn.batch",
                    job_id = %job.id,
                    org_id = %job.context.org_id,
                    "batch_job_started"
                );

                let result = driver.classify_batch(job.limit).await;
                let mut guard = statuses_bg.lock().await;
                match result {
                    Ok(report) => {
                        guard.insert(job.id, JobState::Completed { report });
                    }
                    Err(err) => {
                        guard.insert(
                            job.id,
                            JobState::Failed {
                                error: err.to_string(),
                            },
                        );
                    }
                }
            }
        });

        (Self { tx, statuses }, handle)
    }

    pub async fn enqueue_batch(
        &self,
        limit: Option<usize>,
        context: AuthContext,
    ) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        {
            let mut guard = self.statuses.lock().await;
            guard.insert(id, JobState::Queued);
        }
        let job = Job { id, limit, context };
        if self.tx.send(job).await.is_err() {
            self.statuses.lock().await.remove(&id);
            return Err(ApiError {
                error: "queue_send_failed".into(),
                detail: Some("worker not available".into()),
            });
        }
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard.get(&id).cloned().map(|state| JobInfo {
            id: id.to_string(),
            state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        classify::Classifier,
        llm::scripted::ScriptedBackend,
        models::{NewReturn, ReturnStatus},
        store::{MemoryStore, ReturnStore},
    };
    use std::time::Duration;

    fn context() -> AuthContext {
        AuthContext {
            org_id: "demo-org".into(),
            api_key_id: "key-01".into(),
        }
    }

    async fn wait_for_terminal(queue: &JobQueue, id: Uuid) -> JobState {
        for _ in 0..100 {
            if let Some(info) = queue.get(id).await
                && matches!(
                    info.state,
                    JobState::Completed { .. } | JobState::Failed { .. }
                )
            {
                return info.state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not finish");
    }

    #[tokio::test]
    async fn queued_batch_completes_with_report() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert(NewReturn {
                order_id: "O-1".into(),
                product_id: "P-1".into(),
                product_name: "Blender".into(),
                product_category: "Kitchen".into(),
                return_reason: None,
                customer_description: "Motor smells burnt".into(),
                customer_email: None,
                image_urls: Vec::new(),
                status: ReturnStatus::Pending,
                original_price: None,
                classification: None,
                tags: Vec::new(),
            })
            .await
            .unwrap();
        let backend = ScriptedBackend::new(vec![Ok(
            r#"{"category":"Quality Issues","reason":"motor","recommendation":"Return to Supplier","confidence":0.6}"#.into(),
        )]);
        let driver = BatchDriver::new(
            Arc::new(Classifier::new(Arc::new(backend))),
            store.clone(),
            10,
            100,
        );
        let (queue, _worker) = JobQueue::spawn(driver, 4);

        let id = queue.enqueue_batch(None, context()).await.unwrap();
        match wait_for_terminal(&queue, id).await {
            JobState::Completed { report } => {
                assert_eq!(report.attempted, 1);
                assert_eq!(report.succeeded, 1);
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert!(store.fetch_unclassified(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_commit_marks_job_failed() {
        let store = Arc::new(MemoryStore::new());
        store.fail_commits(true);
        let driver = BatchDriver::new(
            Arc::new(Classifier::new(Arc::new(ScriptedBackend::new(Vec::new())))),
            store,
            10,
            100,
        );
        let (queue, _worker) = JobQueue::spawn(driver, 4);
        let id = queue.enqueue_batch(Some(5), context()).await.unwrap();
        assert!(matches!(
            wait_for_terminal(&queue, id).await,
            JobState::Failed { .. }
        ));
        assert!(queue.get(Uuid::new_v4()).await.is_none());
    }
}
