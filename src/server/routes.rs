//! Unary and server-stream handlers, plus the error mapping.

use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use hyper::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::AppState;
use crate::policy::{CompiledPolicy, PolicyDocument};
use crate::sandbox::error::{ErrorCode, SandboxError};
use crate::sandbox::types::{
    ExecutionInfo, ExecutionKind, ExecutionOptions, SandboxInfo, b64,
};

/// Wire form of every error: `{ code, message }` with a stable code.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl From<SandboxError> for ApiError {
    fn from(e: SandboxError) -> Self {
        Self {
            code: e.code().as_str().to_string(),
            message: e.to_string(),
        }
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match ErrorCode::parse(&self.code, &self.message) {
            ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::FailedPrecondition => StatusCode::CONFLICT,
            ErrorCode::AlreadyExists => StatusCode::CONFLICT,
            ErrorCode::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::Unimplemented => StatusCode::NOT_IMPLEMENTED,
            ErrorCode::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::Canceled => StatusCode::REQUEST_TIMEOUT,
            ErrorCode::BackendCapabilityMismatch => StatusCode::CONFLICT,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

// ── Request/response shapes ─────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSandboxRequest {
    pub policy: PolicyDocument,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensure_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SandboxResponse {
    pub sandbox: SandboxInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateExecutionRequest {
    pub command: Vec<String>,
    #[serde(default)]
    pub kind: ExecutionKind,
    #[serde(default)]
    pub options: ExecutionOptions,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub execution: ExecutionInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelExecutionRequest {
    /// Advisory signal number; defaults to SIGTERM.
    #[serde(default = "default_signal")]
    pub signal: i32,
}

fn default_signal() -> i32 {
    15
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WriteStdinRequest {
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadFileRequest {
    pub path: String,
    pub max_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadFileResponse {
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FollowParams {
    #[serde(default)]
    pub follow: bool,
}

// ── Handlers ────────────────────────────────────────────────────────

pub(crate) async fn create_sandbox(
    State(state): State<AppState>,
    Json(req): Json<CreateSandboxRequest>,
) -> Result<Json<SandboxResponse>, ApiError> {
    let policy = CompiledPolicy::compile(req.policy)
        .map_err(|e| SandboxError::InvalidArgument(e.to_string()))?;

    let sandbox = state
        .registry
        .create_sandbox(
            None,
            policy,
            req.backend.as_deref(),
            req.ensure_key,
            req.ready_timeout_ms.map(Duration::from_millis),
        )
        .await?;
    Ok(Json(SandboxResponse { sandbox }))
}

pub(crate) async fn list_sandboxes(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "sandboxes": state.registry.list() }))
}

pub(crate) async fn get_sandbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SandboxResponse>, ApiError> {
    let sandbox = state.registry.get(&id)?.info();
    Ok(Json(SandboxResponse { sandbox }))
}

pub(crate) async fn terminate_sandbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let terminated = state.registry.terminate(&id).await?;
    Ok(Json(json!({ "terminated": terminated })))
}

pub(crate) async fn stream_sandbox_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<FollowParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let (history, mut sub) = state.registry.subscribe_sandbox(&id)?;

    let stream = async_stream::stream! {
        for event in history {
            yield Ok(sse_event("sandbox", &event));
        }
        if params.follow {
            loop {
                match sub.recv().await {
                    Ok(Some(event)) => yield Ok(sse_event("sandbox", &event)),
                    Ok(None) => break,
                    Err(e) => {
                        yield Ok(sse_event("error", &ApiError::from(e)));
                        break;
                    }
                }
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

pub(crate) async fn create_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CreateExecutionRequest>,
) -> Result<Json<ExecutionResponse>, ApiError> {
    let execution = state
        .registry
        .create_execution(&id, req.command, req.kind, req.options)?;
    Ok(Json(ExecutionResponse { execution }))
}

pub(crate) async fn get_execution(
    State(state): State<AppState>,
    Path((id, exec_id)): Path<(String, String)>,
) -> Result<Json<ExecutionResponse>, ApiError> {
    let execution = state.registry.get_execution(&id, &exec_id)?;
    Ok(Json(ExecutionResponse { execution }))
}

pub(crate) async fn cancel_execution(
    State(state): State<AppState>,
    Path((id, exec_id)): Path<(String, String)>,
    Json(req): Json<CancelExecutionRequest>,
) -> Result<Json<Value>, ApiError> {
    state.registry.cancel_execution(&id, &exec_id, req.signal)?;
    Ok(Json(json!({ "canceled": true })))
}

pub(crate) async fn stream_execution(
    State(state): State<AppState>,
    Path((id, exec_id)): Path<(String, String)>,
    Query(params): Query<FollowParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let (history, mut sub) = state.registry.subscribe_execution(&id, &exec_id)?;

    let stream = async_stream::stream! {
        for event in history {
            yield Ok(sse_event("execution", &event));
        }
        if params.follow {
            loop {
                match sub.recv().await {
                    Ok(Some(event)) => yield Ok(sse_event("execution", &event)),
                    Ok(None) => break,
                    Err(e) => {
                        yield Ok(sse_event("error", &ApiError::from(e)));
                        break;
                    }
                }
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

pub(crate) async fn write_stdin(
    State(state): State<AppState>,
    Path((id, exec_id)): Path<(String, String)>,
    Json(req): Json<WriteStdinRequest>,
) -> Result<Json<Value>, ApiError> {
    state.registry.write_stdin(&id, &exec_id, &req.data).await?;
    Ok(Json(json!({})))
}

pub(crate) async fn resize_tty(
    State(state): State<AppState>,
    Path((id, exec_id)): Path<(String, String)>,
    Json(req): Json<ResizeRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .registry
        .resize_tty(&id, &exec_id, req.cols, req.rows)
        .await?;
    Ok(Json(json!({})))
}

pub(crate) async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<DownloadFileRequest>,
) -> Result<Json<DownloadFileResponse>, ApiError> {
    let data = state
        .registry
        .download_file(&id, &req.path, req.max_bytes)
        .await?;
    Ok(Json(DownloadFileResponse { data }))
}

pub(crate) async fn doctor(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "backends": state.registry.doctor().await }))
}

fn sse_event<T: Serialize>(name: &str, payload: &T) -> Event {
    let data = serde_json::to_string(payload).unwrap_or_else(|_| "{}".into());
    Event::default().event(name.to_string()).data(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[test]
    fn api_error_carries_stable_code() {
        let err: ApiError = SandboxError::NotFound("unknown sandbox \"x\"".into()).into();
        assert_eq!(err.code, "not_found");
        assert!(err.message.contains("unknown sandbox"));
    }

    #[test]
    fn api_error_maps_to_http_status() {
        let cases = [
            (SandboxError::InvalidArgument("x".into()), 400),
            (SandboxError::NotFound("x".into()), 404),
            (SandboxError::FailedPrecondition("x".into()), 409),
            (SandboxError::AlreadyExists("x".into()), 409),
            (SandboxError::ResourceExhausted("x".into()), 429),
            (SandboxError::Unimplemented("x"), 501),
            (SandboxError::DeadlineExceeded, 504),
            (SandboxError::Canceled, 408),
            (SandboxError::Internal("x".into()), 500),
        ];
        for (err, want) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status().as_u16(), want);
        }
    }

    #[test]
    fn create_sandbox_request_round_trips() {
        let json = r#"{
            "policy": {
                "version": 1,
                "image_ref": "ghcr.io/example/base@sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef",
                "network_default": "deny",
                "allow": [{"host": "api.github.com", "ports": [443]}]
            },
            "backend": "firecracker",
            "ensure_key": "thread:main"
        }"#;
        let req: CreateSandboxRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.backend.as_deref(), Some("firecracker"));
        assert_eq!(req.ensure_key.as_deref(), Some("thread:main"));
        assert_eq!(req.policy.allow.len(), 1);
        assert!(req.ready_timeout_ms.is_none());
    }

    #[test]
    fn execution_request_defaults() {
        let req: CreateExecutionRequest =
            serde_json::from_str(r#"{"command": ["echo", "hello"]}"#).unwrap();
        assert_eq!(req.kind, ExecutionKind::Batch);
        assert!(!req.options.tty);
        assert!(req.options.timeout_ms.is_none());
    }

    #[test]
    fn cancel_defaults_to_sigterm() {
        let req: CancelExecutionRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.signal, 15);
    }

    #[test]
    fn download_response_is_base64() {
        let response = DownloadFileResponse {
            data: b"haiku".to_vec(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("aGFpa3U="));
        let back: DownloadFileResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.data, b"haiku");
    }
}
