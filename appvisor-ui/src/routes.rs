//! HTTP route handlers for the host API.

use std::collections::HashMap;
use std::path::PathBuf;

use appvisor::core::types::{
    AppProcessHandle, AppSpec, ErrorReport, FixOutcome, OutputRecord, RuntimeErrorEvent,
    TerminalSession,
};
use appvisor::error::OrchestratorError;
use appvisor::terminal::SessionRequest;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/apps", get(list_apps))
        .route("/apps/{id}", delete(delete_app))
        .route("/apps/{id}/run", post(run_app))
        .route("/apps/{id}/activate", post(activate_app))
        .route("/apps/{id}/stop", post(stop_app))
        .route("/apps/{id}/restart", post(restart_app))
        .route("/apps/{id}/rebuild", post(rebuild_app))
        .route("/apps/{id}/status", get(app_status))
        .route("/apps/{id}/logs", get(app_logs))
        .route("/apps/{id}/report", get(app_report))
        .route("/apps/{id}/runtime-errors", post(submit_runtime_error))
        .route("/apps/{id}/clear-errors", post(clear_errors))
        .route("/apps/{id}/fix", post(fix_app))
        .route("/apps/{id}/fix/cancel", post(cancel_fix))
        .route("/apps/{id}/sessions/kill", post(kill_app_sessions))
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/{id}", delete(kill_session))
        .route("/sessions/{id}/input", post(session_input))
        .route("/sessions/{id}/resize", post(resize_session))
}

/// Orchestrator failure rendered as a status code and a JSON `{error}` body.
pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

fn status_for(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::AppNotFound(_) | OrchestratorError::SessionNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        OrchestratorError::InvalidState { .. } | OrchestratorError::FixInProgress(_) => {
            StatusCode::CONFLICT
        }
        OrchestratorError::AgentInvocationFailed(_)
        | OrchestratorError::ProxyBindFailed(_)
        | OrchestratorError::InvalidTarget(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!(status = %status, error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct AppRequest {
    #[serde(default)]
    name: Option<String>,
    root: PathBuf,
}

impl AppRequest {
    fn into_spec(self, id: &str) -> AppSpec {
        let name = self.name.unwrap_or_else(|| id.to_string());
        AppSpec::new(id, name, self.root)
    }
}

#[derive(Serialize)]
struct PreviewResponse {
    proxy_url: String,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct RestartRequest {
    remove_dependency_cache: bool,
}

/// GET /api/apps - every known app's process snapshot.
async fn list_apps(State(state): State<AppState>) -> Json<Vec<AppProcessHandle>> {
    Json(state.host.supervisor().statuses())
}

/// POST /api/apps/{id}/run - start the dev server and wait for its preview URL.
async fn run_app(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AppRequest>,
) -> ApiResult<Json<PreviewResponse>> {
    let spec = request.into_spec(&id);
    let proxy_url = state.host.run_app(&spec).await?;
    Ok(Json(PreviewResponse { proxy_url }))
}

/// POST /api/apps/{id}/activate - run this app and stop the previously active one.
async fn activate_app(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AppRequest>,
) -> ApiResult<Json<PreviewResponse>> {
    let spec = request.into_spec(&id);
    let proxy_url = state.host.switch_active_app(&spec).await?;
    Ok(Json(PreviewResponse { proxy_url }))
}

async fn stop_app(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<AppProcessHandle>> {
    state.host.stop_app(&id).await?;
    Ok(Json(state.host.supervisor().status(&id)))
}

/// POST /api/apps/{id}/restart - optional body `{remove_dependency_cache}`.
async fn restart_app(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<PreviewResponse>> {
    let request: RestartRequest = if body.is_empty() {
        RestartRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| OrchestratorError::Other(anyhow::Error::from(e).context("parse restart request")))?
    };
    let proxy_url = state
        .host
        .supervisor()
        .restart(&id, request.remove_dependency_cache)
        .await?;
    Ok(Json(PreviewResponse { proxy_url }))
}

async fn rebuild_app(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<PreviewResponse>> {
    let proxy_url = state.host.supervisor().rebuild(&id).await?;
    Ok(Json(PreviewResponse { proxy_url }))
}

async fn delete_app(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.host.delete_app(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn app_status(State(state): State<AppState>, Path(id): Path<String>) -> Json<AppProcessHandle> {
    Json(state.host.supervisor().status(&id))
}

async fn app_logs(State(state): State<AppState>, Path(id): Path<String>) -> Json<Vec<OutputRecord>> {
    Json(state.host.detector().logs(&id))
}

async fn app_report(State(state): State<AppState>, Path(id): Path<String>) -> Json<ErrorReport> {
    Json(state.host.report(&id))
}

/// POST /api/apps/{id}/runtime-errors - exceptions caught by the preview surface.
async fn submit_runtime_error(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(event): Json<RuntimeErrorEvent>,
) -> StatusCode {
    state.host.submit_runtime_error(&id, event);
    StatusCode::ACCEPTED
}

async fn clear_errors(State(state): State<AppState>, Path(id): Path<String>) -> Json<ErrorReport> {
    state.host.detector().clear_errors(&id);
    Json(state.host.report(&id))
}

/// POST /api/apps/{id}/fix - run the auto-fix loop to completion.
async fn fix_app(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<FixOutcome>> {
    info!(app_id = %id, "auto-fix requested");
    Ok(Json(state.host.fix(&id).await?))
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: bool,
}

async fn cancel_fix(State(state): State<AppState>, Path(id): Path<String>) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.host.cancel_fix(&id),
    })
}

#[derive(Serialize)]
struct KillResponse {
    killed: usize,
}

async fn kill_app_sessions(State(state): State<AppState>, Path(id): Path<String>) -> Json<KillResponse> {
    Json(KillResponse {
        killed: state.host.terminals().kill_sessions_for_app(&id),
    })
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<TerminalSession>> {
    Json(state.host.terminals().sessions())
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct CreateSessionRequest {
    app_id: Option<String>,
    cwd: Option<PathBuf>,
    cols: Option<u16>,
    rows: Option<u16>,
    env: HashMap<String, String>,
}

/// POST /api/sessions - open a shell, optionally bound to an app.
async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<Json<TerminalSession>> {
    let session = state.host.create_session(SessionRequest {
        app_id: request.app_id,
        cwd: request.cwd.unwrap_or_default(),
        env: request.env,
        cols: request.cols,
        rows: request.rows,
    })?;
    Ok(Json(session))
}

/// POST /api/sessions/{id}/input - raw keystrokes.
async fn session_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    state.host.terminals().write(&id, &body)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ResizeRequest {
    cols: u16,
    rows: u16,
}

async fn resize_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ResizeRequest>,
) -> ApiResult<StatusCode> {
    state
        .host
        .terminals()
        .resize(&id, request.cols, request.rows)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn kill_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.host.terminals().kill(&id)?;
    Ok(StatusCode::NO_CONTENT)
}
