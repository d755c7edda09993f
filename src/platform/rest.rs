use super::{ImportFilter, PlatformApi, PlatformError, PlatformReturn};
use crate::{http::build_client, models::ReturnStatus};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Adapter for a platform exposing the returns REST API under `base_url`.
/// The bearer token is fetched on first use and dropped on a 401.
pub struct RestPlatform {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    token: RwLock<Option<String>>,
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    api_key: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: String,
}

#[derive(Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    image_urls: Vec<String>,
}

#[skip_serializing_none]
#[derive(Serialize)]
struct StatusUpdate<'a> {
    status: &'a str,
    notes: Option<&'a str>,
}

impl RestPlatform {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            http: build_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            token: RwLock::new(None),
        }
    }

    async fn bearer(&self) -> Result<String, PlatformError> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        self.authenticate().await?;
        self.token
            .read()
            .await
            .clone()
            .ok_or_else(|| PlatformError::Unauthorized("no token issued".into()))
    }

    async fn send(&self, request: RequestBuilder, subject: &str) -> Result<Response, PlatformError> {
        let token = self.bearer().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| PlatformError::Http(err.to_string()))?;
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(PlatformError::NotFound(subject.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                *self.token.write().await = None;
                Err(PlatformError::Unauthorized(format!(
                    "{} rejected the token",
                    response.status()
                )))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(PlatformError::Http(format!("{status}: {body}")))
            }
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// `returns?start_date=..&end_date=..&status=..&limit=..` with only the set
/// fields present.
fn returns_query(filter: &ImportFilter) -> String {
    let mut params = Vec::new();
    if let Some(start) = filter.start_date {
        params.push(format!("start_date={}", start.format("%Y-%m-%d")));
    }
    if let Some(end) = filter.end_date {
        params.push(format!("end_date={}", end.format("%Y-%m-%d")));
    }
    if let Some(status) = filter.status {
        params.push(format!("status={}", status.as_str()));
    }
    if filter.limit > 0 {
        params.push(format!("limit={}", filter.limit));
    }
    if params.is_empty() {
        "/returns".to_string()
    } else {
        format!("/returns?{}", params.join("&"))
    }
}

/// Relative image paths hang off the host serving the API, not the API prefix.
fn resolve_image_url(base_url: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }
    let origin = base_url.split("/api").next().unwrap_or(base_url);
    let origin = origin.trim_end_matches('/');
    if url.starts_with('/') {
        format!("{origin}{url}")
    } else {
        format!("{origin}/{url}")
    }
}

fn return_path(id: &str) -> String {
    format!("/returns/{}", urlencoding::encode(id))
}

#[async_trait]
impl PlatformApi for RestPlatform {
    fn name(&self) -> &'static str {
        "rest"
    }

    async fn authenticate(&self) -> Result<(), PlatformError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| PlatformError::Unauthorized("PLATFORM_API_KEY not set".into()))?;
        let response = self
            .http
            .post(self.url("/auth"))
            .json(&AuthRequest { api_key })
            .send()
            .await
            .map_err(|err| PlatformError::Http(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(target = "gemiturn.platform", status = status.as_u16(), "platform_auth_rejected");
            return Err(PlatformError::Unauthorized(format!("{status}: {body}")));
        }
        let payload: AuthResponse = response
            .json()
            .await
            .map_err(|err| PlatformError::InvalidResponse(err.to_string()))?;
        *self.token.write().await = Some(payload.token);
        info!(target = "gemiturn.platform", adapter = "rest", "platform_authenticated");
        Ok(())
    }

    async fn fetch_returns(
        &self,
        filter: &ImportFilter,
    ) -> Result<Vec<PlatformReturn>, PlatformError> {
        let url = self.url(&returns_query(filter));
        debug!(target = "gemiturn.platform", url = %url, "platform_fetch_returns");
        let response = self.send(self.http.get(url), "returns").await?;
        response
            .json()
            .await
            .map_err(|err| PlatformError::InvalidResponse(err.to_string()))
    }

    async fn fetch_return(&self, id: &str) -> Result<PlatformReturn, PlatformError> {
        let response = self
            .send(self.http.get(self.url(&return_path(id))), id)
            .await?;
        response
            .json()
            .await
            .map_err(|err| PlatformError::InvalidResponse(err.to_string()))
    }

    async fn fetch_image_urls(&self, id: &str) -> Result<Vec<String>, PlatformError> {
        let path = format!("{}/images", return_path(id));
        let response = self.send(self.http.get(self.url(&path)), id).await?;
        let payload: ImagesResponse = response
            .json()
            .await
            .map_err(|err| PlatformError::InvalidResponse(err.to_string()))?;
        Ok(payload.image_urls)
    }

    async fn download_image(&self, url: &str) -> Result<Vec<u8>, PlatformError> {
        let resolved = resolve_image_url(&self.base_url, url);
        let response = self.send(self.http.get(&resolved), url).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| PlatformError::Http(err.to_string()))?;
        debug!(target = "gemiturn.platform", url = %resolved, bytes = bytes.len(), "image_downloaded");
        Ok(bytes.to_vec())
    }

    async fn update_status(
        &self,
        id: &str,
        status: ReturnStatus,
        notes: Option<&str>,
    ) -> Result<(), PlatformError> {
        let path = format!("{}/status", return_path(id));
        let body = StatusUpdate {
            status: status.as_str(),
            notes,
        };
        self.send(self.http.put(self.url(&path)).json(&body), id)
            .await?;
        info!(
            target = "gemiturn.platform",
            id,
            status = status.as_str(),
            "platform_status_updated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn query_includes_only_set_fields() {
        assert_eq!(
            returns_query(&ImportFilter {
                limit: 0,
                ..ImportFilter::default()
            }),
            "/returns"
        );
        let filter = ImportFilter {
            start_date: NaiveDate::from_ymd_opt(2024, 1, 5),
            end_date: None,
            status: Some(ReturnStatus::Pending),
            limit: 25,
        };
        assert_eq!(
            returns_query(&filter),
            "/returns?start_date=2024-01-05&status=pending&limit=25"
        );
    }

    #[test]
    fn relative_image_urls_resolve_against_origin() {
        let base = "http://localhost:8080/api";
        assert_eq!(
            resolve_image_url(base, "/uploads/a.jpg"),
            "http://localhost:8080/uploads/a.jpg"
        );
        assert_eq!(
            resolve_image_url(base, "uploads/a.jpg"),
            "http://localhost:8080/uploads/a.jpg"
        );
        assert_eq!(
            resolve_image_url(base, "https://cdn.example.com/b.png"),
            "https://cdn.example.com/b.png"
        );
    }

    #[test]
    fn return_ids_are_path_encoded() {
        assert_eq!(return_path("RET 1/2"), "/returns/RET%201%2F2");
    }

    #[tokio::test]
    async fn missing_api_key_fails_authentication_without_network() {
        let platform = RestPlatform::new("http://localhost:1/api".into(), None);
        let err = platform.authenticate().await.unwrap_err();
        assert!(matches!(err, PlatformError::Unauthorized(_)));
        let err = platform.fetch_return("RET00001").await.unwrap_err();
        assert!(matches!(err, PlatformError::Unauthorized(_)));
    }
}
