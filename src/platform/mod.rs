pub mod mock;
pub mod rest;

pub use mock::MockPlatform;
pub use rest::RestPlatform;

use crate::models::{NewReturn, ReturnStatus};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform authentication failed: {0}")]
    Unauthorized(String),
    #[error("platform http error: {0}")]
    Http(String),
    #[error("platform returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("platform return {0} not found")]
    NotFound(String),
}

/// A return request as the e-commerce platform reports it.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlatformReturn {
    pub id: String,
    pub order_id: String,
    pub product_id: String,
    #[serde(default)]
    pub product_name: String,
    #[serde(default)]
    pub product_category: String,
    #[serde(default)]
    pub return_reason: Option<String>,
    #[serde(default)]
    pub customer_description: String,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_phone: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub original_price: Option<f64>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl PlatformReturn {
    /// Unknown platform statuses land as pending.
    pub fn return_status(&self) -> ReturnStatus {
        self.status
            .as_deref()
            .and_then(ReturnStatus::from_str)
            .unwrap_or_default()
    }

    pub fn into_new_return(self, image_urls: Vec<String>) -> NewReturn {
        let status = self.return_status();
        NewReturn {
            order_id: self.order_id,
            product_id: self.product_id,
            product_name: self.product_name,
            product_category: self.product_category,
            return_reason: self.return_reason,
            customer_description: self.customer_description,
            customer_email: self.customer_email,
            image_urls,
            status,
            original_price: self.original_price,
            classification: None,
            tags: Vec::new(),
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportFilter {
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub status: Option<ReturnStatus>,
    #[serde(default = "default_import_limit")]
    pub limit: usize,
}

impl Default for ImportFilter {
    fn default() -> Self {
        Self {
            start_date: None,
            end_date: None,
            status: None,
            limit: default_import_limit(),
        }
    }
}

fn default_import_limit() -> usize {
    100
}

/// Operations every e-commerce platform adapter provides.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    fn name(&self) -> &'static str;

    async fn authenticate(&self) -> Result<(), PlatformError>;

    async fn fetch_returns(&self, filter: &ImportFilter)
    -> Result<Vec<PlatformReturn>, PlatformError>;

    async fn fetch_return(&self, id: &str) -> Result<PlatformReturn, PlatformError>;

    async fn fetch_image_urls(&self, id: &str) -> Result<Vec<String>, PlatformError>;

    async fn download_image(&self, url: &str) -> Result<Vec<u8>, PlatformError>;

    async fn update_status(
        &self,
        id: &str,
        status: ReturnStatus,
        notes: Option<&str>,
    ) -> Result<(), PlatformError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformMode {
    Mock,
    Rest,
}

#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub mode: PlatformMode,
    pub base_url: String,
    pub api_key: Option<String>,
}

impl PlatformConfig {
    pub fn from_env() -> Self {
        let mode = match std::env::var("PLATFORM_MODE")
            .unwrap_or_default()
            .trim()
            .to_lowercase()
            .as_str()
        {
            "rest" | "local" | "remote" => PlatformMode::Rest,
            _ => PlatformMode::Mock,
        };
        Self {
            mode,
            base_url: std::env::var("PLATFORM_API_URL")
                .unwrap_or_else(|_| "http://localhost:8080/api".into()),
            api_key: std::env::var("PLATFORM_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
        }
    }
}

pub fn build(config: &PlatformConfig) -> Arc<dyn PlatformApi> {
    let platform: Arc<dyn PlatformApi> = match config.mode {
        PlatformMode::Mock => Arc::new(MockPlatform::new()),
        PlatformMode::Rest => Arc::new(RestPlatform::new(
            config.base_url.clone(),
            config.api_key.clone(),
        )),
    };
    info!(target = "gemiturn.platform", adapter = platform.name(), "platform_ready");
    platform
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_defaults_apply_to_empty_body() {
        let filter: ImportFilter = serde_json::from_str("{}").unwrap();
        assert_eq!(filter, ImportFilter::default());
        let filter: ImportFilter =
            serde_json::from_str(r#"{"start_date":"2024-03-01","status":"processing","limit":5}"#)
                .unwrap();
        assert_eq!(filter.start_date, NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(filter.status, Some(ReturnStatus::Processing));
        assert_eq!(filter.limit, 5);
    }

    #[test]
    fn platform_return_maps_into_new_return() {
        let raw = r#"{"id":"RET1","order_id":"ORD1","product_id":"P1","product_name":"Mug","status":"shipped"}"#;
        let request: PlatformReturn = serde_json::from_str(raw).unwrap();
        assert_eq!(request.return_status(), ReturnStatus::Pending);
        let new_return = request.into_new_return(vec!["https://img/1.jpg".into()]);
        assert_eq!(new_return.order_id, "ORD1");
        assert_eq!(new_return.image_urls.len(), 1);
        assert!(new_return.classification.is_none());
    }
}
