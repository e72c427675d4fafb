//! JSON-over-HTTP control surface
//!
//! Every route answers with a small JSON object carrying a `status` field,
//! `"ok"` on success and `"error"` (with a `message`) otherwise.

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{ControlError, ControlHandle};
use crate::exfil::{LogFormat, LoggerError, RecordingStatus};

const DEFAULT_AUTO_THRESHOLD_DB: f32 = 10.0;

pub fn router(control: ControlHandle) -> Router {
    Router::new()
        .route("/api/fft", get(fft))
        .route("/api/mode", post(set_mode))
        .route("/api/pause", post(toggle_pause))
        .route("/api/log/start", post(log_start))
        .route("/api/log/stop", post(log_stop))
        .route("/api/log/toggle", post(log_toggle))
        .route("/api/log/status", get(log_status))
        .route("/api/auto-record", get(get_auto_record).post(set_auto_record))
        .route("/api/log/directory", get(get_directory).post(set_directory))
        .fallback(not_found)
        .with_state(control)
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Control(ControlError),
}

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        ApiError::Control(e)
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

fn status_code(e: &ControlError) -> StatusCode {
    match e {
        ControlError::InvalidMode(_) => StatusCode::BAD_REQUEST,
        ControlError::Busy | ControlError::Timeout => StatusCode::SERVICE_UNAVAILABLE,
        ControlError::Unavailable | ControlError::NoLogger => StatusCode::INTERNAL_SERVER_ERROR,
        ControlError::Logger(LoggerError::AlreadyRecording | LoggerError::Busy) => {
            StatusCode::CONFLICT
        }
        ControlError::Logger(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Control(e) => (status_code(&e), e.to_string()),
        };
        debug!(%code, %message, "Control request failed");
        (code, Json(json!({ "status": "error", "message": message }))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn logging_body(status: &RecordingStatus) -> Value {
    json!({
        "status": "ok",
        "logging": status.active,
        "format": status.format.map(|f| f.to_string()).unwrap_or_default(),
        "filepath": status
            .filepath
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
    })
}

async fn fft(State(control): State<ControlHandle>) -> impl IntoResponse {
    Json(control.snapshot())
}

#[derive(Deserialize)]
struct ModeParams {
    value: usize,
}

async fn set_mode(
    State(control): State<ControlHandle>,
    params: Result<Query<ModeParams>, QueryRejection>,
) -> ApiResult {
    let Query(params) = params?;
    let mode = control.set_mode(params.value).await?;
    Ok(Json(json!({
        "status": "ok",
        "mode": mode.index(),
        "name": mode.name(),
    })))
}

async fn toggle_pause(State(control): State<ControlHandle>) -> ApiResult {
    let paused = control.toggle_pause().await?;
    Ok(Json(json!({ "status": "ok", "paused": paused })))
}

#[derive(Deserialize)]
struct StartParams {
    format: Option<String>,
}

async fn log_start(
    State(control): State<ControlHandle>,
    params: Result<Query<StartParams>, QueryRejection>,
) -> ApiResult {
    let Query(params) = params?;
    let format = params
        .format
        .as_deref()
        .map_or(LogFormat::Binary, LogFormat::parse_or_binary);
    let status = control.start_log(format).await?;
    Ok(Json(logging_body(&status)))
}

async fn log_stop(State(control): State<ControlHandle>) -> ApiResult {
    let status = control.stop_log().await?;
    Ok(Json(logging_body(&status)))
}

async fn log_toggle(State(control): State<ControlHandle>) -> ApiResult {
    let status = control.toggle_log().await?;
    Ok(Json(logging_body(&status)))
}

async fn log_status(State(control): State<ControlHandle>) -> ApiResult {
    let status = control.recording_status()?;
    let mut body = logging_body(&status);
    body["frames"] = json!(status.frames);
    Ok(Json(body))
}

fn auto_record_body(enabled: bool, threshold: f32) -> Value {
    json!({ "status": "ok", "enabled": enabled, "threshold": threshold })
}

async fn get_auto_record(State(control): State<ControlHandle>) -> ApiResult {
    let settings = control.auto_record()?;
    Ok(Json(auto_record_body(settings.enabled, settings.threshold_db)))
}

fn default_threshold() -> f32 {
    DEFAULT_AUTO_THRESHOLD_DB
}

#[derive(Deserialize)]
struct AutoRecordParams {
    #[serde(default)]
    enabled: bool,
    #[serde(default = "default_threshold")]
    threshold: f32,
}

async fn set_auto_record(
    State(control): State<ControlHandle>,
    params: Result<Query<AutoRecordParams>, QueryRejection>,
) -> ApiResult {
    let Query(params) = params?;
    if !params.threshold.is_finite() {
        return Err(ApiError::BadRequest("threshold must be finite".to_owned()));
    }
    let settings = control
        .set_auto_record(params.enabled, params.threshold)
        .await?;
    Ok(Json(auto_record_body(settings.enabled, settings.threshold_db)))
}

async fn get_directory(State(control): State<ControlHandle>) -> ApiResult {
    let directory = control.log_directory()?;
    Ok(Json(
        json!({ "status": "ok", "directory": directory.display().to_string() }),
    ))
}

#[derive(Deserialize)]
struct DirectoryParams {
    directory: String,
}

async fn set_directory(
    State(control): State<ControlHandle>,
    params: Result<Query<DirectoryParams>, QueryRejection>,
) -> ApiResult {
    let Query(params) = params?;
    let directory = control.set_log_directory(params.directory).await?;
    Ok(Json(
        json!({ "status": "ok", "directory": directory.display().to_string() }),
    ))
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "status": "error", "message": "not found" })),
    )
}
