/**
 * HTTP API - Axum surface over the device and test managers
 *
 * ROLE:
 * Thin JSON glue: every route maps onto one manager operation, errors are
 * mapped onto status codes in one place (`ApiError`).
 *
 * ROUTES:
 * - `/`, `/health`
 * - `/device/...`: list, stats, add, get/delete, refresh one, refresh all
 * - `/test/...`: start, status, stats, get, update, stop, logs, expired
 *
 * No authentication: the service is meant for a lab network. CORS origins
 * come from config so a browser GUI on another host can call the API.
 */

use crate::devices::{DeviceError, SharedDeviceManager};
use crate::health::{HealthTracker, ServiceHealth};
use crate::models::{HostRecord, HostsMap, InventoryStats};
use crate::runs::{LogType, SharedTestManager, TestError, TestLogs, TestRecord, TestRunConfig, TestStats, TestUpdate};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, warn};

#[derive(Clone)]
pub struct AppState {
    pub devices: SharedDeviceManager,
    pub tests: SharedTestManager,
    pub health: HealthTracker,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Test(#[from] TestError),
    #[error("Invalid request body: {0}")]
    InvalidBody(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Device(DeviceError::HostNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Device(DeviceError::DuplicateHost(_)) => StatusCode::CONFLICT,
            ApiError::Device(DeviceError::InvalidHost(_)) => StatusCode::BAD_REQUEST,
            ApiError::Device(DeviceError::Inventory(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Test(TestError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Test(TestError::InvalidDuration(_)) => StatusCode::BAD_REQUEST,
            ApiError::InvalidBody(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Any origin when the list is empty or contains "*". Entries that are not
/// valid header values are skipped.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o.trim() == "*") {
        return layer.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o.trim()) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

pub fn build_router(app_state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/health", get(get_health))
        .route("/device/list", get(list_hosts))
        .route("/device/stats", get(device_stats))
        .route("/device/add", post(add_host))
        .route("/device/refresh", post(refresh_all))
        .route("/device/{hostname}", get(get_host).delete(remove_host))
        .route("/device/{hostname}/refresh", post(refresh_host))
        .route("/test/start", post(start_test))
        .route("/test/status", get(list_tests))
        .route("/test/stats", get(test_stats))
        .route("/test/{id}", get(get_test))
        .route("/test/{id}/update", post(update_test))
        .route("/test/{id}/stop", post(stop_test))
        .route("/test/{id}/logs", get(get_test_logs))
        .route("/test/{id}/expired", get(is_expired))
        .with_state(app_state)
        .layer(cors_layer(cors_origins))
}

async fn banner() -> Json<Value> {
    Json(json!({ "service": "lnt-core", "version": env!("CARGO_PKG_VERSION") }))
}

async fn get_health(State(app): State<AppState>) -> Json<ServiceHealth> {
    Json(app.health.get_health(&app.devices, &app.tests).await)
}

// ---- devices ----

#[derive(Debug, Deserialize)]
struct AddHostBody {
    hostname: String,
    address: String,
}

async fn list_hosts(State(app): State<AppState>) -> Json<HostsMap> {
    Json(app.devices.list_hosts().await)
}

async fn device_stats(State(app): State<AppState>) -> Json<InventoryStats> {
    Json(app.devices.inventory_stats().await)
}

async fn add_host(State(app): State<AppState>, Json(body): Json<AddHostBody>) -> Result<(StatusCode, Json<HostRecord>), ApiError> {
    let record = app.devices.add_host(&body.hostname, &body.address).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_host(State(app): State<AppState>, Path(hostname): Path<String>) -> ApiResult<HostRecord> {
    Ok(Json(app.devices.get_host(&hostname).await?))
}

async fn remove_host(State(app): State<AppState>, Path(hostname): Path<String>) -> ApiResult<Value> {
    if app.devices.remove_host(&hostname).await? {
        Ok(Json(json!({ "removed": hostname })))
    } else {
        Err(DeviceError::HostNotFound(hostname).into())
    }
}

async fn refresh_host(State(app): State<AppState>, Path(hostname): Path<String>) -> ApiResult<HostRecord> {
    Ok(Json(app.devices.refresh_host_status(&hostname).await?))
}

async fn refresh_all(State(app): State<AppState>) -> Json<HostsMap> {
    Json(app.devices.refresh_all_statuses().await)
}

// ---- tests ----

#[derive(Debug, Deserialize)]
struct StartBody {
    name: String,
    #[serde(default)]
    config: Option<TestRunConfig>,
}

#[derive(Debug, Deserialize)]
struct StopBody {
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LogsParams {
    #[serde(rename = "type", default)]
    log_type: LogType,
}

async fn start_test(State(app): State<AppState>, Json(body): Json<StartBody>) -> Result<(StatusCode, Json<Value>), ApiError> {
    let id = app.tests.start_test(&body.name, body.config)?;
    Ok((StatusCode::CREATED, Json(json!({ "test_id": id }))))
}

async fn list_tests(State(app): State<AppState>) -> Json<Vec<TestRecord>> {
    Json(app.tests.list_tests())
}

async fn test_stats(State(app): State<AppState>) -> Json<TestStats> {
    Json(app.tests.stats())
}

async fn get_test(State(app): State<AppState>, Path(id): Path<u64>) -> ApiResult<TestRecord> {
    Ok(Json(app.tests.get_test(id)?))
}

async fn update_test(
    State(app): State<AppState>,
    Path(id): Path<u64>,
    Json(update): Json<TestUpdate>,
) -> ApiResult<TestRecord> {
    Ok(Json(app.tests.update_test(id, update)?))
}

// body optional: POST /test/{id}/stop with no payload uses a default reason
async fn stop_test(
    State(app): State<AppState>,
    Path(id): Path<u64>,
    body: Bytes,
) -> ApiResult<Value> {
    let reason = stop_reason(&body)?;
    // distinguish unknown id from already-finished run
    app.tests.get_test(id)?;
    let stopped = app.tests.stop_test(id, &reason);
    Ok(Json(json!({ "test_id": id, "stopped": stopped })))
}

fn stop_reason(body: &[u8]) -> Result<String, ApiError> {
    let parsed = if body.trim_ascii().is_empty() {
        None
    } else {
        let stop: StopBody = serde_json::from_slice(body).map_err(|e| ApiError::InvalidBody(e.to_string()))?;
        stop.reason
    };
    Ok(parsed.unwrap_or_else(|| "Stopped by user".to_string()))
}

async fn get_test_logs(
    State(app): State<AppState>,
    Path(id): Path<u64>,
    Query(params): Query<LogsParams>,
) -> ApiResult<TestLogs> {
    Ok(Json(app.tests.get_test_logs(id, params.log_type)?))
}

async fn is_expired(State(app): State<AppState>, Path(id): Path<u64>) -> ApiResult<Value> {
    let expired = app.tests.is_expired(id)?;
    Ok(Json(json!({ "test_id": id, "expired": expired })))
}
