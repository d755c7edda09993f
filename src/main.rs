mod batch;
mod classify;
mod config;
mod http;
mod import;
mod jobs;
mod llm;
mod metrics;
mod models;
mod platform;
mod security;
mod store;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use batch::{BatchDriver, BatchError, BatchReport};
use classify::{ClassificationResult, Classifier};
use config::AppConfig;
use import::{ImportError, ImportReport, ImportService, ProcessedReturn};
use llm::{GeminiClient, GenerativeBackend, ImageBlob};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, ClassificationUpdate, HistoryEntry, NewReturn, ProductMetadata, ReturnRecord,
    ReturnStatus, ReturnSummary, StatusChange, classification_text,
};
use platform::{ImportFilter, PlatformError};
use security::{AuthContext, AuthState, require_api_auth};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use store::{ReturnStore, StoreError};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "gemiturn.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    if let Err(err) = dotenvy::dotenv()
        && !err.not_found()
    {
        eprintln!("failed to load .env: {err}");
    }
    init_tracing();

    let config = AppConfig::from_env();
    let backend: Arc<dyn GenerativeBackend> = Arc::new(GeminiClient::new(config.gemini.clone()));
    if config.gemini.api_key.is_none() {
        warn!(
            target = "gemiturn.api",
            "GEMINI_API_KEY not set; every classification will fall back"
        );
    }
    let classifier = Arc::new(Classifier::new(backend));
    let store = store::open(&config.database_url).await?;
    let platform = platform::build(&config.platform);
    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;

    let state = AppState::new(
        &config,
        classifier,
        store,
        platform,
        AuthState::from_env(),
        prometheus_handle,
    );
    let app = app(state, config.request_max_bytes);

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "gemiturn.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    classifier: Arc<Classifier>,
    store: Arc<dyn ReturnStore>,
    batch: BatchDriver,
    imports: ImportService,
    queue: jobs::JobQueue,
    auth: AuthState,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
}

impl AppState {
    /// Wires the shared services together. Spawns the batch job worker, so it
    /// must run inside a tokio runtime.
    fn new(
        config: &AppConfig,
        classifier: Arc<Classifier>,
        store: Arc<dyn ReturnStore>,
        platform: Arc<dyn platform::PlatformApi>,
        auth: AuthState,
        prometheus_handle: PrometheusHandle,
    ) -> Self {
        let batch = BatchDriver::new(
            classifier.clone(),
            store.clone(),
            config.batch_default_limit,
            config.batch_max_limit,
        );
        let imports = ImportService::new(platform, classifier.clone(), store.clone());
        let (queue, _worker) = jobs::JobQueue::spawn(batch.clone(), config.queue_capacity);
        let openapi: serde_json::Value = serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
            .unwrap_or_else(|_| json!({"openapi": "3.0.3"}));
        Self {
            classifier,
            store,
            batch,
            imports,
            queue,
            auth,
            openapi: Arc::new(openapi),
            prometheus_handle,
        }
    }
}

fn app(state: AppState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/classify", post(classify))
        .route("/returns", post(create_return).get(list_returns))
        .route("/returns/classify-batch", post(classify_batch))
        .route("/returns/{id}", get(get_return).patch(update_return_status))
        .route("/returns/{id}/classify", post(classify_return))
        .route("/returns/{id}/history", get(list_history).post(add_history_note))
        .route("/analytics/summary", get(analytics_summary))
        .nest(
            "/jobs",
            Router::new()
                .route("/classify-batch", post(enqueue_batch_job))
                .route("/{id}", get(get_job_status)),
        )
        .route("/imports", post(import_returns))
        .route("/imports/{external_id}/process", post(process_import))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            require_api_auth,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "gemiturn-api-rs",
        "backend": state.classifier.backend_name(),
        "store": state.store.name(),
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Some(key) = config::OPENAPI_KEY.as_deref() {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::unauthorized("docs"));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = config::METRICS_KEY.as_deref() {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct ClassifyRequest {
    #[serde(default)]
    description: String,
    #[serde(default)]
    product: ProductMetadata,
    /// Base64 image payloads, raw or as data URLs.
    #[serde(default)]
    images: Vec<String>,
}

/// Classify a return from a description, product fields and optional photos.
///
/// - Method: `POST`
/// - Path: `/classify`
/// - Auth: `Authorization: Bearer <key>` or `X-Gemiturn-Key: <key>`
/// - Body: `ClassifyRequest`
/// - Response: `ClassificationResult`; backend failures still return 200 with the fallback
async fn classify(
    State(state): State<AppState>,
    Json(payload): Json<ClassifyRequest>,
) -> Result<Json<ClassificationResult>, AppError> {
    crate::metrics::inc_requests("/classify");
    let images = payload
        .images
        .iter()
        .enumerate()
        .map(|(idx, encoded)| {
            ImageBlob::from_base64(encoded).map_err(|err| {
                AppError::bad_request("invalid_image", format!("images[{idx}]: {err}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let result = state
        .classifier
        .classify(&payload.description, &payload.product, &images)
        .await;
    Ok(Json(result))
}

/// Store a new return and classify it straight away.
async fn create_return(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(mut payload): Json<NewReturn>,
) -> Result<(StatusCode, Json<ReturnRecord>), AppError> {
    crate::metrics::inc_requests("/returns");
    if payload.order_id.trim().is_empty() || payload.product_id.trim().is_empty() {
        return Err(AppError::bad_request(
            "invalid_return",
            "order_id and product_id are required",
        ));
    }
    let description = classification_text(
        &payload.customer_description,
        payload.return_reason.as_deref(),
    );
    let result = state
        .classifier
        .classify(&description, &payload.product_metadata(), &[])
        .await;
    payload.classification = Some(result);
    let record = state.store.insert(payload).await?;
    info!(
        target = "gemiturn.api",
        org_id = %context.org_id,
        id = record.id,
        "return_created"
    );
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_returns(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ReturnRecord>>, AppError> {
    crate::metrics::inc_requests("/returns");
    let status = match query.status.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(raw) => Some(ReturnStatus::from_str(raw).ok_or_else(|| {
            AppError::bad_request("invalid_status", format!("unknown status `{raw}`"))
        })?),
        None => None,
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
    Ok(Json(state.store.list(status, limit).await?))
}

async fn get_return(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ReturnRecord>, AppError> {
    crate::metrics::inc_requests("/returns/{id}");
    state
        .store
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| StoreError::NotFound(id).into())
}

/// Move a return to a new status, optionally recording the resale price.
///
/// - Method: `PATCH`
/// - Path: `/returns/{id}`
/// - Body: `StatusChange`
/// - Response: `ReturnRecord`; a changed status also appends a history entry
async fn update_return_status(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<i64>,
    Json(change): Json<StatusChange>,
) -> Result<Json<ReturnRecord>, AppError> {
    crate::metrics::inc_requests("/returns/{id}");
    if change
        .resale_price
        .is_some_and(|price| !price.is_finite() || price < 0.0)
    {
        return Err(AppError::bad_request(
            "invalid_price",
            "resale_price must be a non-negative number",
        ));
    }
    let record = state
        .store
        .update_status(id, &change, Some(context.org_id.as_str()))
        .await?;
    info!(
        target = "gemiturn.api",
        org_id = %context.org_id,
        id,
        status = record.status.as_str(),
        "return_status_updated"
    );
    Ok(Json(record))
}

async fn list_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<HistoryEntry>>, AppError> {
    crate::metrics::inc_requests("/returns/{id}/history");
    Ok(Json(state.store.history(id).await?))
}

#[derive(Debug, Deserialize)]
struct HistoryNote {
    notes: String,
}

async fn add_history_note(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<i64>,
    Json(payload): Json<HistoryNote>,
) -> Result<(StatusCode, Json<HistoryEntry>), AppError> {
    crate::metrics::inc_requests("/returns/{id}/history");
    let notes = payload.notes.trim();
    if notes.is_empty() {
        return Err(AppError::bad_request("invalid_note", "notes must not be empty"));
    }
    let entry = state
        .store
        .add_history(id, notes, Some(context.org_id.as_str()))
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// Totals, recovery rate and category/reason breakdowns over all returns.
async fn analytics_summary(
    State(state): State<AppState>,
) -> Result<Json<ReturnSummary>, AppError> {
    crate::metrics::inc_requests("/analytics/summary");
    Ok(Json(state.store.summary().await?))
}

/// Reclassify one stored return and persist the result.
async fn classify_return(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ReturnRecord>, AppError> {
    crate::metrics::inc_requests("/returns/{id}/classify");
    let record = state.store.get(id).await?.ok_or(StoreError::NotFound(id))?;
    let result = state
        .classifier
        .classify(
            &record.classification_description(),
            &record.product_metadata(),
            &[],
        )
        .await;
    state
        .store
        .commit_classifications(&[ClassificationUpdate { id, result }])
        .await?;
    let updated = state.store.get(id).await?.ok_or(StoreError::NotFound(id))?;
    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
struct BatchQuery {
    #[serde(default)]
    limit: Option<usize>,
}

/// Classify up to `limit` unclassified returns and commit them together.
///
/// - Method: `POST`
/// - Path: `/returns/classify-batch?limit=N`
/// - Response: `BatchReport`; a store failure rolls the batch back and returns 500
async fn classify_batch(
    State(state): State<AppState>,
    Query(query): Query<BatchQuery>,
) -> Result<Json<BatchReport>, AppError> {
    crate::metrics::inc_requests("/returns/classify-batch");
    Ok(Json(state.batch.classify_batch(query.limit).await?))
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_batch_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Query(query): Query<BatchQuery>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/classify-batch");
    let id = state
        .queue
        .enqueue_batch(query.limit, context)
        .await
        .map_err(|err| AppError::internal("enqueue", err.detail.unwrap_or(err.error)))?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::bad_request("jobs", "invalid_job_id"));
    };
    state
        .queue
        .get(uuid)
        .await
        .map(Json)
        .ok_or_else(|| AppError::not_found("jobs", format!("job {uuid} not found")))
}

async fn import_returns(
    State(state): State<AppState>,
    Json(filter): Json<ImportFilter>,
) -> Json<ImportReport> {
    crate::metrics::inc_requests("/imports");
    Json(state.imports.import_returns(&filter).await)
}

#[derive(Debug, Deserialize)]
struct ProcessQuery {
    #[serde(default)]
    sync_status: bool,
}

async fn process_import(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
    Query(query): Query<ProcessQuery>,
) -> Result<Json<ProcessedReturn>, AppError> {
    crate::metrics::inc_requests("/imports/{external_id}/process");
    let processed = state
        .imports
        .process_single(&external_id, query.sync_status)
        .await?;
    Ok(Json(processed))
}

#[derive(Debug)]
enum AppError {
    BadRequest { error: String, detail: String },
    Unauthorized { error: String },
    NotFound { error: String, detail: String },
    Internal { error: String, detail: String },
}

impl AppError {
    fn bad_request(error: &str, detail: impl Into<String>) -> Self {
        Self::BadRequest {
            error: error.to_string(),
            detail: detail.into(),
        }
    }

    fn unauthorized(error: &str) -> Self {
        Self::Unauthorized {
            error: error.to_string(),
        }
    }

    fn not_found(error: &str, detail: impl Into<String>) -> Self {
        Self::NotFound {
            error: error.to_string(),
            detail: detail.into(),
        }
    }

    fn internal(error: &str, detail: impl Into<String>) -> Self {
        Self::Internal {
            error: error.to_string(),
            detail: detail.into(),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(_) => Self::not_found("not_found", value.to_string()),
            other => Self::internal("store", other.to_string()),
        }
    }
}

impl From<BatchError> for AppError {
    fn from(value: BatchError) -> Self {
        error!(
            target = "gemiturn.api",
            batch_id = %value.batch_id(),
            error = %value,
            "batch_failed"
        );
        Self::internal("batch", value.to_string())
    }
}

impl From<ImportError> for AppError {
    fn from(value: ImportError) -> Self {
        match value {
            ImportError::Platform(PlatformError::NotFound(_)) => {
                Self::not_found("not_found", value.to_string())
            }
            ImportError::Store(err) => err.into(),
            ImportError::Platform(err) => Self::internal("platform", err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match self {
            AppError::BadRequest { error, detail } => (StatusCode::BAD_REQUEST, error, Some(detail)),
            AppError::Unauthorized { error } => (StatusCode::UNAUTHORIZED, error, None),
            AppError::NotFound { error, detail } => (StatusCode::NOT_FOUND, error, Some(detail)),
            AppError::Internal { error, detail } => {
                (StatusCode::INTERNAL_SERVER_ERROR, error, Some(detail))
            }
        };
        (status, Json(ApiError { error, detail })).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
