use crate::broadcast_hub::BroadcastHub;
use crate::collectors::{Collectors, PollSummary, TrafficCollection};
use crate::connection_manager::ConnectionManager;
use crate::db::DatabaseService;
use crate::error::{AnalysisError, ConnectionError, PollError, PredictorError, StorageError, ValidationError};
use crate::ids_adapter::IdsAdapter;
use crate::models::{
    Alert, CapsmanAccessPoint, DetectionRecord, Device, DeviceUpdate, FirewallRule, InterfaceStats, NewDevice,
    ProtocolSummary, Recorded, SystemResources, TrafficSample, TrafficSource, Verdict, WirelessClient,
    WirelessInterface,
};
use crate::poll_tracker::DevicePollStatus;
use crate::scheduler::Scheduler;
use crate::ws_handler::ws_upgrade;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::header::CONTENT_TYPE;
use http::Method;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

const DEFAULT_METRICS_LIMIT: usize = 20;
const DEFAULT_TRAFFIC_LIMIT: usize = 100;
const DEFAULT_SOURCES_LIMIT: usize = 10;
const DEFAULT_ALERTS_LIMIT: usize = 50;
const MAX_LIMIT: usize = 1000;

/// Everything a request handler may touch.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseService>,
    pub hub: Arc<BroadcastHub>,
    pub connections: Arc<ConnectionManager>,
    pub collectors: Arc<Collectors>,
    pub scheduler: Arc<Scheduler>,
    pub ids: Arc<IdsAdapter>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Busy(String),
    #[error("{0}")]
    Device(String),
    #[error("{0}")]
    AnalysisUnavailable(#[from] PredictorError),
    #[error("{0}")]
    Storage(#[from] StorageError),
}

impl From<ConnectionError> for ApiError {
    fn from(e: ConnectionError) -> Self {
        ApiError::Device(e.to_string())
    }
}

impl From<PollError> for ApiError {
    fn from(e: PollError) -> Self {
        let message = e.to_string();
        match e {
            PollError::Storage(e) => ApiError::Storage(e),
            PollError::Busy(_) | PollError::Cancelled => ApiError::Busy(message),
            PollError::Connection(_) | PollError::TimedOut(_) => ApiError::Device(message),
        }
    }
}

impl From<AnalysisError> for ApiError {
    fn from(e: AnalysisError) -> Self {
        match e {
            AnalysisError::Predictor(e) => ApiError::AnalysisUnavailable(e),
            AnalysisError::Storage(e) => ApiError::Storage(e),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Validation(ValidationError::new(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::Validation(ValidationError::new(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::Validation(ValidationError::new(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Validation(e) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string()),
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, "NOT_FOUND", detail.clone()),
            ApiError::Busy(detail) => (StatusCode::CONFLICT, "BUSY", detail.clone()),
            ApiError::Device(detail) => (StatusCode::BAD_GATEWAY, "DEVICE_UNREACHABLE", detail.clone()),
            ApiError::AnalysisUnavailable(e) => {
                error!("Traffic analysis failed: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "ANALYSIS_UNAVAILABLE",
                    "analysis unavailable".to_string(),
                )
            }
            ApiError::Storage(e) => {
                error!("Storage failure while serving request: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "STORAGE_ERROR",
                    "internal storage error".to_string(),
                )
            }
        };

        let body = ErrorBody {
            error: ErrorDetail { code, message },
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn or(&self, default: usize) -> usize {
        self.limit.unwrap_or(default).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyQuery {
    device_id: Option<i64>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PollingIntervalBody {
    interval: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaxDevicesBody {
    max_devices: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeBody {
    device_id: i64,
    sample: TrafficSample,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRef {
    device_id: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallSync {
    device_id: i64,
    synced: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    status: &'static str,
    clients: usize,
    sessions: usize,
    devices: usize,
}

fn require_device(db: &DatabaseService, id: i64) -> Result<Device, ApiError> {
    db.get_device(id)?
        .ok_or_else(|| ApiError::NotFound(format!("device {} not found", id)))
}

fn validate_new_device(device: &NewDevice) -> Result<(), ValidationError> {
    if device.name.trim().is_empty() {
        return Err(ValidationError::new("name is required"));
    }
    if device.address.trim().is_empty() {
        return Err(ValidationError::new("address is required"));
    }
    if device.username.trim().is_empty() {
        return Err(ValidationError::new("username is required"));
    }
    if device.port == 0 {
        return Err(ValidationError::new("port must be between 1 and 65535"));
    }
    Ok(())
}

fn validate_update(update: &DeviceUpdate) -> Result<(), ValidationError> {
    let blank = |field: &Option<String>| field.as_deref().is_some_and(|v| v.trim().is_empty());
    if blank(&update.name) || blank(&update.address) || blank(&update.username) {
        return Err(ValidationError::new("name, address and username cannot be blank"));
    }
    if update.port == Some(0) {
        return Err(ValidationError::new("port must be between 1 and 65535"));
    }
    Ok(())
}

// Devices

async fn list_devices(State(state): State<AppState>) -> ApiResult<Vec<Device>> {
    Ok(Json(state.db.list_devices()?))
}

async fn create_device(
    State(state): State<AppState>,
    payload: Result<Json<NewDevice>, JsonRejection>,
) -> Result<(StatusCode, Json<Device>), ApiError> {
    let Json(new_device) = payload?;
    validate_new_device(&new_device)?;
    let device = state.db.create_device(&new_device)?;
    info!(device_id = device.id, "Device {} registered", device.name);
    Ok((StatusCode::CREATED, Json(device)))
}

async fn get_device(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Device> {
    let Path(id) = path?;
    Ok(Json(require_device(&state.db, id)?))
}

async fn update_device(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<DeviceUpdate>, JsonRejection>,
) -> ApiResult<Device> {
    let Path(id) = path?;
    let Json(update) = payload?;
    validate_update(&update)?;
    let device = state
        .db
        .update_device(id, &update)?
        .ok_or_else(|| ApiError::NotFound(format!("device {} not found", id)))?;
    Ok(Json(device))
}

async fn delete_device(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
) -> Result<StatusCode, ApiError> {
    let Path(id) = path?;
    require_device(&state.db, id)?;
    state.db.delete_device(id)?;
    state.scheduler.remove_device(id).await;
    info!(device_id = id, "Device deleted");
    Ok(StatusCode::NO_CONTENT)
}

// Collected data

async fn device_metrics(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult<Vec<Recorded<SystemResources>>> {
    let Path(id) = path?;
    let Query(query) = query?;
    require_device(&state.db, id)?;
    Ok(Json(state.db.latest_system_metrics(id, query.or(DEFAULT_METRICS_LIMIT))?))
}

async fn device_interfaces(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Vec<Recorded<InterfaceStats>>> {
    let Path(id) = path?;
    require_device(&state.db, id)?;
    Ok(Json(state.db.latest_interface_stats(id)?))
}

async fn device_wireless(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Vec<Recorded<WirelessInterface>>> {
    let Path(id) = path?;
    require_device(&state.db, id)?;
    Ok(Json(state.db.wireless_interfaces(id)?))
}

async fn device_clients(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Vec<Recorded<WirelessClient>>> {
    let Path(id) = path?;
    require_device(&state.db, id)?;
    Ok(Json(state.db.wireless_clients(id)?))
}

async fn device_capsman(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Vec<Recorded<CapsmanAccessPoint>>> {
    let Path(id) = path?;
    require_device(&state.db, id)?;
    Ok(Json(state.db.capsman_access_points(id)?))
}

async fn device_traffic(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult<Vec<Recorded<TrafficSample>>> {
    let Path(id) = path?;
    let Query(query) = query?;
    require_device(&state.db, id)?;
    Ok(Json(state.db.recent_traffic(id, query.or(DEFAULT_TRAFFIC_LIMIT))?))
}

async fn device_protocols(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Vec<ProtocolSummary>> {
    let Path(id) = path?;
    require_device(&state.db, id)?;
    Ok(Json(state.db.protocol_summary(id)?))
}

async fn device_sources(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
    query: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult<Vec<TrafficSource>> {
    let Path(id) = path?;
    let Query(query) = query?;
    require_device(&state.db, id)?;
    Ok(Json(state.db.top_sources(id, query.or(DEFAULT_SOURCES_LIMIT))?))
}

async fn device_firewall_rules(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Vec<Recorded<FirewallRule>>> {
    let Path(id) = path?;
    require_device(&state.db, id)?;
    Ok(Json(state.db.firewall_rules(id)?))
}

// On-demand collection

async fn refresh_device(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<PollSummary> {
    let Path(id) = path?;
    let device = require_device(&state.db, id)?;
    Ok(Json(state.scheduler.poll_now(&device).await?))
}

async fn sync_firewall_rules(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<FirewallSync> {
    let Path(id) = path?;
    let device = require_device(&state.db, id)?;
    let connection = state.connections.connect(&device).await?;
    let synced = state.collectors.sync_firewall_rules(&connection).await?;
    Ok(Json(FirewallSync { device_id: id, synced }))
}

async fn collect_traffic(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<TrafficCollection> {
    let Path(id) = path?;
    let device = require_device(&state.db, id)?;
    let connection = state.connections.connect(&device).await?;
    Ok(Json(state.collectors.collect_traffic(&connection).await?))
}

// Scheduler

async fn set_polling_interval(
    State(state): State<AppState>,
    payload: Result<Json<PollingIntervalBody>, JsonRejection>,
) -> ApiResult<PollingIntervalBody> {
    let Json(body) = payload?;
    state.scheduler.set_polling_interval(body.interval).await?;
    Ok(Json(body))
}

async fn set_max_concurrent_devices(
    State(state): State<AppState>,
    payload: Result<Json<MaxDevicesBody>, JsonRejection>,
) -> ApiResult<MaxDevicesBody> {
    let Json(body) = payload?;
    state.scheduler.set_max_concurrent_devices(body.max_devices)?;
    Ok(Json(body))
}

async fn device_polling_status(State(state): State<AppState>) -> ApiResult<Vec<DevicePollStatus>> {
    Ok(Json(state.scheduler.get_device_polling_status().await?))
}

// Security

async fn analyze_traffic(
    State(state): State<AppState>,
    payload: Result<Json<AnalyzeBody>, JsonRejection>,
) -> ApiResult<Verdict> {
    let Json(body) = payload?;
    require_device(&state.db, body.device_id)?;
    Ok(Json(state.ids.analyze_traffic(body.device_id, &body.sample).await?))
}

async fn list_anomalies(
    State(state): State<AppState>,
    query: Result<Query<AnomalyQuery>, QueryRejection>,
) -> ApiResult<Vec<Alert>> {
    let Query(query) = query?;
    let limit = query.limit.unwrap_or(DEFAULT_ALERTS_LIMIT).clamp(1, MAX_LIMIT);
    Ok(Json(state.ids.list_anomalies(query.device_id, limit)?))
}

async fn anomaly_detections(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Vec<DetectionRecord>> {
    let Path(id) = path?;
    let history = state.db.detection_history(id)?;
    if history.is_empty() {
        return Err(ApiError::NotFound(format!("alert {} not found", id)));
    }
    Ok(Json(history))
}

async fn test_scan_detection(
    State(state): State<AppState>,
    payload: Result<Json<DeviceRef>, JsonRejection>,
) -> ApiResult<Verdict> {
    let Json(body) = payload?;
    require_device(&state.db, body.device_id)?;
    Ok(Json(state.ids.test_scan_detection(body.device_id).await?))
}

async fn health(State(state): State<AppState>) -> ApiResult<Health> {
    Ok(Json(Health {
        status: "ok",
        clients: state.hub.client_count().await,
        sessions: state.connections.handle_count().await,
        devices: state.db.list_devices()?.len(),
    }))
}

pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([CONTENT_TYPE]);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/devices", get(list_devices).post(create_device))
        .route("/api/devices/{id}", get(get_device).put(update_device).delete(delete_device))
        .route("/api/devices/{id}/metrics", get(device_metrics))
        .route("/api/devices/{id}/interfaces", get(device_interfaces))
        .route("/api/devices/{id}/wireless", get(device_wireless))
        .route("/api/devices/{id}/clients", get(device_clients))
        .route("/api/devices/{id}/capsman", get(device_capsman))
        .route("/api/devices/{id}/traffic", get(device_traffic))
        .route("/api/devices/{id}/protocols", get(device_protocols))
        .route("/api/devices/{id}/sources", get(device_sources))
        .route("/api/devices/{id}/firewall-rules", get(device_firewall_rules))
        .route("/api/devices/{id}/refresh", post(refresh_device))
        .route("/api/devices/{id}/sync-firewall-rules", post(sync_firewall_rules))
        .route("/api/devices/{id}/collect-traffic", post(collect_traffic))
        .route("/api/scheduler/polling-interval", post(set_polling_interval))
        .route("/api/scheduler/max-concurrent-devices", post(set_max_concurrent_devices))
        .route("/api/scheduler/device-status", get(device_polling_status))
        .route("/api/security/analyze-traffic", post(analyze_traffic))
        .route("/api/security/anomalies", get(list_anomalies))
        .route("/api/security/anomalies/{id}/detections", get(anomaly_detections))
        .route("/api/security/test-scan-detection", post(test_scan_detection))
        .route("/ws", get(ws_upgrade))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(cors)
        .with_state(state)
}

/// Serves the HTTP API and `/ws` until `shutdown` resolves.
pub async fn run_rest_server(
    state: AppState,
    bind_address: &str,
    max_body_bytes: usize,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("HTTP server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state, max_body_bytes))
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::test_support::FakeRouter;
    use crate::ids_adapter::test_support::FixedPredictor;
    use crate::ids_adapter::Predictor;
    use crate::scheduler::SchedulerSettings;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::sync::atomic::Ordering;
    use tokio::time::Duration;
    use tower::ServiceExt;

    struct TestApp {
        state: AppState,
        router: Arc<FakeRouter>,
    }

    fn test_app(predictor: FixedPredictor) -> TestApp {
        let db = Arc::new(DatabaseService::in_memory().unwrap());
        let hub = BroadcastHub::new();
        let router = Arc::new(FakeRouter::default());
        let (connections, _events) = ConnectionManager::new(router.clone(), Duration::from_secs(60));
        let predictor: Arc<dyn Predictor> = Arc::new(predictor);
        let ids = Arc::new(IdsAdapter::new(db.clone(), hub.clone(), predictor, 0.5));
        let collectors = Arc::new(Collectors::new(db.clone(), hub.clone(), Some(ids.clone()), false));
        let scheduler = Scheduler::new(
            db.clone(),
            connections.clone(),
            collectors.clone(),
            SchedulerSettings {
                polling_interval: Duration::from_millis(30_000),
                min_polling_interval: Duration::from_millis(5_000),
                max_concurrent_devices: 5,
                tick: Duration::from_millis(1_000),
                poll_timeout: Duration::from_millis(15_000),
                max_backoff: Duration::from_millis(300_000),
            },
        );
        TestApp {
            state: AppState {
                db,
                hub,
                connections,
                collectors,
                scheduler,
                ids,
            },
            router,
        }
    }

    async fn send(app: &TestApp, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router(app.state.clone(), 1024 * 1024).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn create(app: &TestApp, name: &str) -> i64 {
        let (status, body) = send(
            app,
            "POST",
            "/api/devices",
            Some(json!({"name": name, "address": "192.168.88.1", "username": "admin", "password": "pw"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = test_app(FixedPredictor::answering(false, 0.1));
        let (status, body) = send(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn device_crud_round() {
        let app = test_app(FixedPredictor::answering(false, 0.1));
        let id = create(&app, "core").await;

        let (status, body) = send(&app, "GET", &format!("/api/devices/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "core");
        assert_eq!(body["port"], 8728);
        assert!(body.get("password").is_none());

        let (status, body) = send(&app, "PUT", &format!("/api/devices/{}", id), Some(json!({"name": "edge"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "edge");

        let (status, _) = send(&app, "DELETE", &format!("/api/devices/{}", id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(&app, "GET", &format!("/api/devices/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn malformed_path_and_query_get_structured_errors() {
        let app = test_app(FixedPredictor::answering(false, 0.1));
        let id = create(&app, "core").await;

        let (status, body) = send(&app, "GET", "/api/devices/abc", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert!(body["error"]["message"].as_str().unwrap().contains("abc"));

        let (status, body) = send(&app, "GET", "/api/security/anomalies?limit=lots", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

        let (status, body) = send(&app, "GET", &format!("/api/devices/{}/traffic?limit=-1", id), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

        let (status, body) = send(&app, "POST", "/api/devices/1.5/refresh", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn deleted_device_is_not_polled_again() {
        let app = test_app(FixedPredictor::answering(false, 0.1));
        let id = create(&app, "core").await;
        let (status, _) = send(&app, "POST", &format!("/api/devices/{}/refresh", id), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&app, "DELETE", &format!("/api/devices/{}", id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        assert_eq!(app.state.scheduler.run_cycle().await.unwrap(), 0);
        assert_eq!(app.router.logins.load(Ordering::SeqCst), 1);
        assert_eq!(app.state.connections.handle_count().await, 0);
        let (_, status) = send(&app, "GET", "/api/scheduler/device-status", None).await;
        assert!(status.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_device_payloads_are_rejected() {
        let app = test_app(FixedPredictor::answering(false, 0.1));

        let (status, body) = send(
            &app,
            "POST",
            "/api/devices",
            Some(json!({"name": " ", "address": "10.0.0.1", "username": "admin"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

        let (status, body) = send(&app, "POST", "/api/devices", Some(json!({"name": "missing fields"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

        let (_, devices) = send(&app, "GET", "/api/devices", None).await;
        assert_eq!(devices.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn scheduler_settings_are_validated() {
        let app = test_app(FixedPredictor::answering(false, 0.1));

        let (status, _) = send(&app, "POST", "/api/scheduler/polling-interval", Some(json!({"interval": 1000}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(app.state.scheduler.polling_interval(), Duration::from_millis(30_000));

        let (status, body) = send(&app, "POST", "/api/scheduler/polling-interval", Some(json!({"interval": 10000}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["interval"], 10000);

        let (status, _) = send(
            &app,
            "POST",
            "/api/scheduler/max-concurrent-devices",
            Some(json!({"maxDevices": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "POST",
            "/api/scheduler/max-concurrent-devices",
            Some(json!({"maxDevices": 3})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(app.state.scheduler.max_concurrent_devices(), 3);
    }

    #[tokio::test]
    async fn refresh_polls_and_exposes_collected_data() {
        let app = test_app(FixedPredictor::answering(false, 0.1));
        let id = create(&app, "core").await;

        let (status, body) = send(&app, "POST", &format!("/api/devices/{}/refresh", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["firewallRules"], 2);

        let (_, rules) = send(&app, "GET", &format!("/api/devices/{}/firewall-rules", id), None).await;
        assert_eq!(rules.as_array().unwrap().len(), 2);
        let (_, metrics) = send(&app, "GET", &format!("/api/devices/{}/metrics?limit=5", id), None).await;
        assert_eq!(metrics.as_array().unwrap().len(), 1);

        let (_, status) = send(&app, "GET", "/api/scheduler/device-status", None).await;
        assert_eq!(status[0]["lastOutcome"], "success");
        assert_eq!(status[0]["phase"], "idle");
    }

    #[tokio::test]
    async fn unreachable_device_maps_to_bad_gateway() {
        let app = test_app(FixedPredictor::answering(false, 0.1));
        app.router.fail_login.store(true, Ordering::SeqCst);
        let id = create(&app, "offline").await;

        let (status, body) = send(&app, "POST", &format!("/api/devices/{}/sync-firewall-rules", id), None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["code"], "DEVICE_UNREACHABLE");

        let (status, _) = send(&app, "POST", &format!("/api/devices/{}/refresh", id), None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn predictor_failure_is_analysis_unavailable() {
        let app = test_app(FixedPredictor::failing());
        let id = create(&app, "core").await;

        let (status, body) = send(
            &app,
            "POST",
            "/api/security/test-scan-detection",
            Some(json!({"deviceId": id})),
        )
        .await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["message"], "analysis unavailable");
        let (_, anomalies) = send(&app, "GET", "/api/security/anomalies", None).await;
        assert!(anomalies.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn analyzed_anomaly_is_listed() {
        let app = test_app(FixedPredictor::answering(true, 0.82));
        let id = create(&app, "core").await;
        let sample = json!({
            "sourceIp": "198.51.100.7",
            "destinationIp": "192.168.88.1",
            "destinationPort": 23,
            "protocol": "tcp",
            "packets": [
                {"direction": "forward", "timestampUs": 0, "length": 40, "flags": {"syn": true}},
                {"direction": "forward", "timestampUs": 150, "length": 40, "flags": {"syn": true}}
            ]
        });

        let (status, verdict) = send(
            &app,
            "POST",
            "/api/security/analyze-traffic",
            Some(json!({"deviceId": id, "sample": sample})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(verdict["isAnomaly"], true);

        let (_, anomalies) = send(&app, "GET", &format!("/api/security/anomalies?deviceId={}", id), None).await;
        let anomalies = anomalies.as_array().unwrap();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0]["severity"], "high");
        assert_eq!(anomalies[0]["destinationPort"], 23);

        let alert_id = anomalies[0]["id"].as_i64().unwrap();
        let (status, detections) =
            send(&app, "GET", &format!("/api/security/anomalies/{}/detections", alert_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detections[0]["model"], "random_forest");
    }

    #[tokio::test]
    async fn analysis_for_unknown_device_is_not_found() {
        let app = test_app(FixedPredictor::answering(true, 0.82));
        let (status, _) = send(
            &app,
            "POST",
            "/api/security/test-scan-detection",
            Some(json!({"deviceId": 999})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
