use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::error;

use crate::execution::{ActionExecutor, ExecutionPolicy};
use crate::generation::{CodeGenerator, GenerateError, Generated};
use crate::inspect::{LogsResponse, PortStatus, ProcessList, SandboxInspector};
use crate::llm::{ChatMessage, ModelProvider};
use crate::models::{Action, ActionOutcome, ProgressEvent};
use crate::registry::SessionRegistry;
use crate::sandbox::SandboxError;
use crate::shell::{InteractiveShell, ShellError, ShellResponse};

#[derive(Clone)]
pub struct AppState {
    executor: Arc<ActionExecutor>,
    shell: Arc<InteractiveShell>,
    inspector: Arc<SandboxInspector>,
    generator: Arc<CodeGenerator>,
}

impl AppState {
    pub fn new(registry: Arc<SessionRegistry>, policy: ExecutionPolicy, generator: CodeGenerator) -> Self {
        Self {
            inspector: Arc::new(SandboxInspector::new(registry.clone(), policy.work_dir.clone())),
            executor: Arc::new(ActionExecutor::new(registry.clone(), policy)),
            shell: Arc::new(InteractiveShell::new(registry)),
            generator: Arc::new(generator),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/generate", post(handle_generate))
        .route("/api/execute", post(handle_execute))
        .route("/api/execute-simple", post(handle_execute_simple))
        .route("/api/terminal", post(handle_terminal))
        .route("/api/sandbox/:session_id/logs", get(handle_logs))
        .route("/api/sandbox/:session_id/port/:port", get(handle_port))
        .route("/api/sandbox/:session_id/processes", get(handle_processes))
        .with_state(state)
}

/// CORS for a single browser origin, with credentials.
pub fn cors_layer(origin: &str) -> anyhow::Result<CorsLayer> {
    let origin = HeaderValue::from_str(origin).with_context(|| format!("invalid CORS origin {origin:?}"))?;
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::exact(origin))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true))
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Sandbox not found")]
    SandboxNotFound,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Generate(#[from] GenerateError),
}

impl From<ShellError> for ApiError {
    fn from(err: ShellError) -> Self {
        match err {
            ShellError::SessionNotFound => ApiError::SandboxNotFound,
            ShellError::Sandbox(err) => ApiError::Sandbox(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::SandboxNotFound => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Generate(GenerateError::NotConfigured(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Sandbox(_) | ApiError::Generate(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    prompt: String,
    #[serde(default)]
    conversation_history: Vec<ChatMessage>,
    #[serde(default)]
    model_provider: ModelProvider,
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    session_id: String,
    actions: Vec<Action>,
}

impl ExecuteRequest {
    fn validate(&self) -> Result<(), ApiError> {
        for (index, action) in self.actions.iter().enumerate() {
            action
                .validate()
                .map_err(|reason| ApiError::BadRequest(format!("action {index}: {reason}")))?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct ExecuteSimpleResponse {
    results: Vec<ActionOutcome>,
    preview_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TerminalRequest {
    session_id: String,
    command: String,
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    file_path: Option<String>,
}

async fn handle_generate(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<Generated>, ApiError> {
    let generated = state
        .generator
        .generate(&request.prompt, &request.conversation_history, request.model_provider)
        .await?;
    Ok(Json(generated))
}

async fn handle_execute(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    request.validate()?;
    let events = state.executor.execute_streaming(request.session_id, request.actions);
    let stream = ReceiverStream::new(events).map(|event| Ok::<_, Infallible>(sse_event(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &ProgressEvent) -> Event {
    Event::default().json_data(event).unwrap_or_else(|err| {
        error!(error = %err, "failed to encode progress event");
        Event::default().data(json!({ "type": "error", "message": err.to_string() }).to_string())
    })
}

async fn handle_execute_simple(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteSimpleResponse>, ApiError> {
    request.validate()?;
    let results = state.executor.execute(&request.session_id, &request.actions).await?;
    let preview_url = state.executor.preview_url(&request.session_id).await?;
    Ok(Json(ExecuteSimpleResponse { results, preview_url }))
}

async fn handle_terminal(
    State(state): State<AppState>,
    Json(request): Json<TerminalRequest>,
) -> Result<Json<ShellResponse>, ApiError> {
    let response = state.shell.run(&request.session_id, &request.command).await?;
    Ok(Json(response))
}

async fn handle_logs(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, ApiError> {
    let logs = state.inspector.logs(&session_id, query.file_path.as_deref()).await?;
    logs.map(Json).ok_or(ApiError::SandboxNotFound)
}

async fn handle_port(
    State(state): State<AppState>,
    Path((session_id, port)): Path<(String, u16)>,
) -> Result<Json<PortStatus>, ApiError> {
    let status = state.inspector.port_status(&session_id, port).await?;
    status.map(Json).ok_or(ApiError::SandboxNotFound)
}

async fn handle_processes(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ProcessList>, ApiError> {
    let processes = state.inspector.processes(&session_id).await?;
    processes.map(Json).ok_or(ApiError::SandboxNotFound)
}
