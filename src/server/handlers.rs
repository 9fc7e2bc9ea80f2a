use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::cluster::ControllerError;
use crate::server::state::AppState;

/// In-flight requests per route; the rest wait for a slot
pub const MAX_CONCURRENT_REQUESTS: usize = 64;

/// Body of `POST /scale`
#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    pub workers: i64,
}

/// Body of `POST /adapt`
#[derive(Debug, Deserialize)]
pub struct AdaptRequest {
    pub minimum: i64,
    pub maximum: i64,
}

/// Body of `POST /register`
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub name: String,
    pub output: String,
}

#[derive(Debug, Serialize)]
pub struct InfoResponse {
    #[serde(rename = "schedulerAddress")]
    pub scheduler_address: String,
    #[serde(rename = "dashboardLink")]
    pub dashboard_link: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Controller error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub ControllerError);

impl From<ControllerError> for ApiError {
    fn from(err: ControllerError) -> Self {
        Self(err)
    }
}

/// HTTP status for each controller error
pub fn status_code(err: &ControllerError) -> StatusCode {
    match err {
        ControllerError::InvalidConfig(_) | ControllerError::Template(_) => StatusCode::BAD_REQUEST,
        ControllerError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
        ControllerError::Closed => StatusCode::GONE,
        ControllerError::Orchestrator(_) | ControllerError::Scheduler(_) => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_code(&self.0);
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        let body = ErrorResponse {
            error: self.0.tag().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Unwrap a JSON body, reporting a malformed one as `InvalidConfig`
fn parse_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match payload {
        Ok(Json(body)) => Ok(body),
        Err(rejection) => Err(ControllerError::InvalidConfig(rejection.body_text()).into()),
    }
}

/// Human-readable cluster descriptor
pub async fn describe(State(state): State<AppState>) -> impl IntoResponse {
    state.controller.status().to_string()
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "uptimeSecs": state.uptime_secs(),
    }))
}

/// Cluster status snapshot (lock-free)
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.status())
}

/// Scheduler address and dashboard link
pub async fn info(State(state): State<AppState>) -> Result<Json<InfoResponse>, ApiError> {
    let snapshot = state.controller.status();
    let scheduler_address = snapshot.scheduler_address.ok_or_else(|| {
        ControllerError::NotReady("scheduler address not yet known".to_string())
    })?;
    Ok(Json(InfoResponse {
        scheduler_address,
        dashboard_link: snapshot.dashboard_link,
    }))
}

/// Metadata snapshot reported by the scheduler
pub async fn scheduler_info(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(state.controller.scheduler_info().await?))
}

pub async fn scale(
    State(state): State<AppState>,
    payload: Result<Json<ScaleRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = parse_body(payload)?;
    let snapshot = state.controller.scale(request.workers).await?;
    Ok(Json(snapshot))
}

pub async fn adapt(
    State(state): State<AppState>,
    payload: Result<Json<AdaptRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = parse_body(payload)?;
    let snapshot = state
        .controller
        .adapt(request.minimum, request.maximum)
        .await?;
    Ok(Json(snapshot))
}

pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let request = parse_body(payload)?;
    let output = state.controller.register_plugin(&request.name).await?;
    Ok(Json(RegisterResponse {
        name: request.name,
        output,
    }))
}

pub async fn close(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.controller.close().await?;
    Ok(Json(snapshot))
}

/// Create the Axum router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(describe))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/info", get(info))
        .route("/scheduler_info", get(scheduler_info))
        .route("/scale", post(scale))
        .route("/adapt", post(adapt))
        .route("/register", post(register))
        .route("/close", post(close))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
