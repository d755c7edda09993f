use super::{ImportFilter, PlatformApi, PlatformError, PlatformReturn};
use crate::models::ReturnStatus;
use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::info;

const MOCK_RETURNS: usize = 20;
const MOCK_IMAGE_HOST: &str = "https://mock-ecommerce-api.example.com/images";
const CREATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const CATEGORIES: [&str; 5] = ["Electronics", "Clothing", "Home Goods", "Toys", "Books"];
const REASONS: [&str; 5] = [
    "Quality Issues",
    "Size Issues",
    "Wrong Item Received",
    "Changed Mind",
    "Damaged in Shipping",
];
const STATUSES: [ReturnStatus; 4] = ReturnStatus::ALL;

/// In-process platform with a fixed set of generated return requests.
pub struct MockPlatform {
    returns: Mutex<Vec<MockEntry>>,
    authenticated: AtomicBool,
}

struct MockEntry {
    request: PlatformReturn,
    created_at: NaiveDateTime,
    notes: Option<String>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::anchored_at(Utc::now().naive_utc())
    }

    /// Request `i` is created `i % 10` days before `now`.
    pub fn anchored_at(now: NaiveDateTime) -> Self {
        let returns = (1..=MOCK_RETURNS)
            .map(|i| {
                let created_at = now - Duration::days((i % 10) as i64);
                MockEntry {
                    request: mock_request(i, created_at),
                    created_at,
                    notes: None,
                }
            })
            .collect();
        Self {
            returns: Mutex::new(returns),
            authenticated: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub async fn notes(&self, id: &str) -> Option<String> {
        let returns = self.returns.lock().await;
        returns
            .iter()
            .find(|entry| entry.request.id == id)
            .and_then(|entry| entry.notes.clone())
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

fn mock_request(i: usize, created_at: NaiveDateTime) -> PlatformReturn {
    PlatformReturn {
        id: format!("RET{i:05}"),
        order_id: format!("ORD{:05}", i * 2),
        product_id: format!("PROD{:05}", i * 3),
        product_name: format!("Test Product {i}"),
        product_category: CATEGORIES[i % CATEGORIES.len()].to_string(),
        return_reason: Some(REASONS[i % REASONS.len()].to_string()),
        customer_description: format!(
            "Customer description for return {i}. The product has a problem and needs to go back."
        ),
        customer_email: Some(format!("customer{i}@example.com")),
        customer_phone: Some(format!("1380000{i:04}")),
        image_urls: vec![
            format!("{MOCK_IMAGE_HOST}/return_{i}_1.jpg"),
            format!("{MOCK_IMAGE_HOST}/return_{i}_2.jpg"),
        ],
        status: Some(STATUSES[i % STATUSES.len()].as_str().to_string()),
        original_price: Some(100.0 + i as f64 * 10.0),
        created_at: Some(created_at.format(CREATED_AT_FORMAT).to_string()),
    }
}

fn matches_filter(entry: &MockEntry, filter: &ImportFilter) -> bool {
    let day = entry.created_at.date();
    filter.start_date.is_none_or(|start| day >= start)
        && filter.end_date.is_none_or(|end| day <= end)
        && filter
            .status
            .is_none_or(|status| entry.request.status.as_deref() == Some(status.as_str()))
}

#[async_trait]
impl PlatformApi for MockPlatform {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn authenticate(&self) -> Result<(), PlatformError> {
        self.authenticated.store(true, Ordering::SeqCst);
        info!(target = "gemiturn.platform", adapter = "mock", "platform_authenticated");
        Ok(())
    }

    async fn fetch_returns(
        &self,
        filter: &ImportFilter,
    ) -> Result<Vec<PlatformReturn>, PlatformError> {
        let returns = self.returns.lock().await;
        Ok(returns
            .iter()
            .filter(|entry| matches_filter(entry, filter))
            .take(filter.limit)
            .map(|entry| entry.request.clone())
            .collect())
    }

    async fn fetch_return(&self, id: &str) -> Result<PlatformReturn, PlatformError> {
        let returns = self.returns.lock().await;
        returns
            .iter()
            .find(|entry| entry.request.id == id)
            .map(|entry| entry.request.clone())
            .ok_or_else(|| PlatformError::NotFound(id.to_string()))
    }

    async fn fetch_image_urls(&self, id: &str) -> Result<Vec<String>, PlatformError> {
        Ok(self.fetch_return(id).await?.image_urls)
    }

    async fn download_image(&self, _url: &str) -> Result<Vec<u8>, PlatformError> {
        Ok(b"mock_image_data".to_vec())
    }

    async fn update_status(
        &self,
        id: &str,
        status: ReturnStatus,
        notes: Option<&str>,
    ) -> Result<(), PlatformError> {
        let mut returns = self.returns.lock().await;
        let entry = returns
            .iter_mut()
            .find(|entry| entry.request.id == id)
            .ok_or_else(|| PlatformError::NotFound(id.to_string()))?;
        entry.request.status = Some(status.as_str().to_string());
        if let Some(notes) = notes {
            entry.notes = Some(notes.to_string());
        }
        info!(
            target = "gemiturn.platform",
            id,
            status = status.as_str(),
            "platform_status_updated"
        );
        Ok(())
    }
}
