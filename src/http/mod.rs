mod ingest;
mod query;

use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::payload::{ErrorBody, FieldError};
use crate::query::PageLimits;
use crate::storage::{Store, StoreError};
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub api_key: String,
    pub max_processes_per_snapshot: usize,
    pub page: PageLimits,
    pub default_top_n: usize,
    pub max_top_n: usize,
}

impl ApiSettings {
    pub fn from_config(cfg: &ServerConfig, api_key: String) -> Self {
        Self {
            api_key,
            max_processes_per_snapshot: cfg.max_processes_per_snapshot,
            page: PageLimits {
                default_limit: cfg.default_page_size,
                max_limit: cfg.max_page_size,
            },
            default_top_n: cfg.default_top_n,
            max_top_n: cfg.max_top_n,
        }
    }
}

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub store: Store,
    pub settings: Arc<ApiSettings>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("неверный или отсутствующий API-ключ")]
    Unauthorized,
    #[error("ошибка валидации")]
    Validation(Vec<FieldError>),
    #[error("некорректный запрос: {0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("внутренняя ошибка сервера")]
    Internal(String),
}

impl ApiError {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Validation(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Validation(_) => "validation_error",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SnapshotNotFound(_)
            | StoreError::HostNotFound(_)
            | StoreError::HostHasNoSnapshots(_) => Self::NotFound(err.to_string()),
            other => {
                error!(error = %other, "ошибка хранилища при обработке запроса");
                Self::Internal(other.to_string())
            }
        }
    }
}

impl From<Vec<FieldError>> for ApiError {
    fn from(errors: Vec<FieldError>) -> Self {
        Self::Validation(errors)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();
        let details = match self {
            Self::Validation(details) => details,
            _ => Vec::new(),
        };
        let body = ErrorBody {
            error: code.to_string(),
            message,
            details,
        };
        (status, Json(body)).into_response()
    }
}

pub fn build_router(state: HttpAppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/submit", post(ingest::submit))
        .route("/api/v1/submit/", post(ingest::submit))
        .route("/api/v1/hosts", get(query::list_hosts))
        .route("/api/v1/hosts/summary", get(query::host_summary))
        .route("/api/v1/hosts/:id", get(query::host_detail))
        .route("/api/v1/hosts/:id/snapshots", get(query::host_snapshots))
        .route("/api/v1/hosts/:id/processes", get(query::host_processes))
        .route("/api/v1/hosts/:id/tree", get(query::host_tree))
        .route("/api/v1/snapshots", get(query::list_snapshots))
        .route("/api/v1/snapshots/latest", get(query::latest_snapshots))
        .route("/api/v1/snapshots/:id", get(query::snapshot_detail))
        .route("/api/v1/snapshots/:id/tree", get(query::snapshot_tree))
        .route("/api/v1/processes", get(query::list_processes))
        .route("/api/v1/processes/search", get(query::search_processes))
        .route("/api/v1/processes/top-cpu", get(query::top_cpu))
        .route("/api/v1/processes/top-memory", get(query::top_memory))
        .route("/api/v1/system-metrics", get(query::list_system_metrics))
        .route("/api/v1/system-metrics/latest", get(query::latest_system_metrics))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::storage::test_support::temp_store;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    pub const TEST_KEY: &str = "test-secret";

    pub async fn test_state() -> (TempDir, HttpAppState) {
        let (dir, store) = temp_store().await;
        let mut cfg = ServerConfig::default();
        cfg.max_processes_per_snapshot = 50;
        cfg.max_page_size = 20;
        cfg.default_page_size = 5;
        cfg.max_top_n = 3;
        cfg.default_top_n = 2;
        let state = HttpAppState {
            metrics: Metrics::new().expect("инициализация метрик"),
            store,
            settings: Arc::new(ApiSettings::from_config(&cfg, TEST_KEY.to_string())),
        };
        (dir, state)
    }

    pub fn app(state: &HttpAppState) -> Router {
        build_router(state.clone(), 64 * 1024)
    }

    pub async fn call(app: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.oneshot(request).await.expect("ответ роутера");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("тело ответа");
        (status, bytes.to_vec())
    }

    pub async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("запрос");
        let (status, bytes) = call(app, request).await;
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    pub async fn submit_json(
        app: Router,
        key: Option<&str>,
        body: &serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/v1/submit/")
            .header(CONTENT_TYPE, "application/json");
        if let Some(key) = key {
            builder = builder.header(crate::payload::API_KEY_HEADER, key);
        }
        let request = builder
            .body(Body::from(body.to_string()))
            .expect("запрос");
        let (status, bytes) = call(app, request).await;
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{app, call, get_json, test_state};
    use super::*;
    use axum::http::Request;

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (_dir, state) = test_state().await;
        let request = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(app(&state), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_slice(), b"ok");
    }

    #[tokio::test]
    async fn metrics_contains_uptime() {
        let (_dir, state) = test_state().await;
        let request = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(app(&state), request).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("census_uptime_seconds"));
        assert!(text.contains("census_scrape_count_total 1"));
    }

    #[tokio::test]
    async fn unknown_snapshot_is_json_404() {
        let (_dir, state) = test_state().await;
        let (status, body) = get_json(app(&state), "/api/v1/snapshots/777").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
        assert!(body["message"].as_str().unwrap_or("").contains("777"));
    }

    #[test]
    fn error_status_codes() {
        assert_eq!(ApiError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::Validation(vec![]).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(StoreError::HostHasNoSnapshots(1)).status_code(),
            StatusCode::NOT_FOUND
        );
    }
}
