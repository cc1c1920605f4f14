//! Typed client for the control-plane API.
//!
//! Speaks the same JSON shapes the server serves, over `http(s)://`
//! (reqwest) or `unix://` (the hand-rolled HTTP path). Errors come back
//! as typed [`SandboxError`]s reconstructed from the `{ code, message }`
//! wire form.

pub mod endpoint;
pub mod ensure;
pub mod http;

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::policy::PolicyDocument;
use crate::sandbox::error::{ErrorCode, SandboxError};
use crate::sandbox::types::{ExecutionEvent, ExecutionInfo, SandboxEvent, SandboxInfo};
use crate::server::routes::{
    ApiError, CancelExecutionRequest, CreateExecutionRequest, CreateSandboxRequest,
    DownloadFileRequest, DownloadFileResponse, ExecutionResponse, ResizeRequest, SandboxResponse,
    WriteStdinRequest,
};
use endpoint::Endpoint;

#[derive(Debug)]
enum Transport {
    Http {
        base: String,
        inner: reqwest::Client,
    },
    Unix {
        path: PathBuf,
    },
}

#[derive(Debug)]
pub struct Client {
    transport: Transport,
}

impl Client {
    /// Build a client for an endpoint string. Unknown schemes fail with
    /// `unsupported endpoint`.
    pub fn new(endpoint: &str) -> Result<Self, SandboxError> {
        Ok(Self::from_endpoint(Endpoint::parse(endpoint)?))
    }

    /// `CLEANROOM_HOST` or the default local socket.
    pub fn from_env() -> Result<Self, SandboxError> {
        Ok(Self::from_endpoint(Endpoint::from_env()?))
    }

    fn from_endpoint(endpoint: Endpoint) -> Self {
        let transport = match endpoint {
            Endpoint::Http(base) => Transport::Http {
                base,
                inner: reqwest::Client::new(),
            },
            Endpoint::Unix(path) => Transport::Unix { path },
        };
        Self { transport }
    }

    // ── Sandboxes ───────────────────────────────────────────────

    pub async fn create_sandbox(
        &self,
        req: &CreateSandboxRequest,
    ) -> Result<SandboxInfo, SandboxError> {
        let response: SandboxResponse = self.call("POST", "/v1/sandboxes", Some(req)).await?;
        Ok(response.sandbox)
    }

    pub async fn get_sandbox(&self, id: &str) -> Result<SandboxInfo, SandboxError> {
        let response: SandboxResponse = self
            .call("GET", &format!("/v1/sandboxes/{id}"), None::<&()>)
            .await?;
        Ok(response.sandbox)
    }

    pub async fn list_sandboxes(&self) -> Result<Vec<SandboxInfo>, SandboxError> {
        #[derive(serde::Deserialize)]
        struct ListResponse {
            sandboxes: Vec<SandboxInfo>,
        }
        let response: ListResponse = self.call("GET", "/v1/sandboxes", None::<&()>).await?;
        Ok(response.sandboxes)
    }

    pub async fn terminate_sandbox(&self, id: &str) -> Result<bool, SandboxError> {
        #[derive(serde::Deserialize)]
        struct TerminateResponse {
            terminated: bool,
        }
        let response: TerminateResponse = self
            .call("DELETE", &format!("/v1/sandboxes/{id}"), None::<&()>)
            .await?;
        Ok(response.terminated)
    }

    pub async fn stream_sandbox_events(
        &self,
        id: &str,
        follow: bool,
    ) -> Result<EventStream<SandboxEvent>, SandboxError> {
        let target = format!("/v1/sandboxes/{id}/events?follow={follow}");
        Ok(EventStream::new(self.open_stream(&target).await?, "sandbox"))
    }

    // ── Executions ──────────────────────────────────────────────

    pub async fn create_execution(
        &self,
        sandbox_id: &str,
        req: &CreateExecutionRequest,
    ) -> Result<ExecutionInfo, SandboxError> {
        let response: ExecutionResponse = self
            .call(
                "POST",
                &format!("/v1/sandboxes/{sandbox_id}/executions"),
                Some(req),
            )
            .await?;
        Ok(response.execution)
    }

    pub async fn get_execution(
        &self,
        sandbox_id: &str,
        exec_id: &str,
    ) -> Result<ExecutionInfo, SandboxError> {
        let response: ExecutionResponse = self
            .call(
                "GET",
                &format!("/v1/sandboxes/{sandbox_id}/executions/{exec_id}"),
                None::<&()>,
            )
            .await?;
        Ok(response.execution)
    }

    pub async fn cancel_execution(
        &self,
        sandbox_id: &str,
        exec_id: &str,
        signal: i32,
    ) -> Result<(), SandboxError> {
        let _: serde_json::Value = self
            .call(
                "POST",
                &format!("/v1/sandboxes/{sandbox_id}/executions/{exec_id}/cancel"),
                Some(&CancelExecutionRequest { signal }),
            )
            .await?;
        Ok(())
    }

    pub async fn stream_execution(
        &self,
        sandbox_id: &str,
        exec_id: &str,
        follow: bool,
    ) -> Result<EventStream<ExecutionEvent>, SandboxError> {
        let target =
            format!("/v1/sandboxes/{sandbox_id}/executions/{exec_id}/events?follow={follow}");
        Ok(EventStream::new(
            self.open_stream(&target).await?,
            "execution",
        ))
    }

    pub async fn write_stdin(
        &self,
        sandbox_id: &str,
        exec_id: &str,
        data: Vec<u8>,
    ) -> Result<(), SandboxError> {
        let _: serde_json::Value = self
            .call(
                "POST",
                &format!("/v1/sandboxes/{sandbox_id}/executions/{exec_id}/stdin"),
                Some(&WriteStdinRequest { data }),
            )
            .await?;
        Ok(())
    }

    pub async fn resize_tty(
        &self,
        sandbox_id: &str,
        exec_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), SandboxError> {
        let _: serde_json::Value = self
            .call(
                "POST",
                &format!("/v1/sandboxes/{sandbox_id}/executions/{exec_id}/resize"),
                Some(&ResizeRequest { cols, rows }),
            )
            .await?;
        Ok(())
    }

    pub async fn download_file(
        &self,
        sandbox_id: &str,
        path: &str,
        max_bytes: u64,
    ) -> Result<Vec<u8>, SandboxError> {
        let response: DownloadFileResponse = self
            .call(
                "POST",
                &format!("/v1/sandboxes/{sandbox_id}/files/download"),
                Some(&DownloadFileRequest {
                    path: path.to_string(),
                    max_bytes,
                }),
            )
            .await?;
        Ok(response.data)
    }

    pub async fn doctor(&self) -> Result<serde_json::Value, SandboxError> {
        self.call("GET", "/v1/doctor", None::<&()>).await
    }

    // ── Transport plumbing ──────────────────────────────────────

    async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        method: &str,
        target: &str,
        body: Option<&Req>,
    ) -> Result<Resp, SandboxError> {
        let (status, bytes) = match &self.transport {
            Transport::Http { base, inner } => {
                let url = format!("{base}{target}");
                let mut request = match method {
                    "GET" => inner.get(&url),
                    "POST" => inner.post(&url),
                    "DELETE" => inner.delete(&url),
                    other => {
                        return Err(SandboxError::Internal(format!("unknown method {other}")));
                    }
                };
                if let Some(body) = body {
                    request = request.json(body);
                }
                let response = request
                    .send()
                    .await
                    .map_err(|e| SandboxError::Internal(format!("request {target}: {e}")))?;
                let status = response.status().as_u16();
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| SandboxError::Internal(format!("read response: {e}")))?
                    .to_vec();
                (status, bytes)
            }
            Transport::Unix { path } => {
                let body = body
                    .map(serde_json::to_vec)
                    .transpose()
                    .map_err(|e| SandboxError::Internal(format!("encode request: {e}")))?;
                let response = http::unix_request(path, method, target, body).await?;
                let status = response.status;
                (status, response.collect().await?)
            }
        };

        if !(200..300).contains(&status) {
            return Err(decode_error(status, &bytes));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| SandboxError::Internal(format!("decode response: {e}")))
    }

    async fn open_stream(&self, target: &str) -> Result<http::BodyChunks, SandboxError> {
        match &self.transport {
            Transport::Http { base, inner } => {
                let url = format!("{base}{target}");
                let response = inner
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| SandboxError::Internal(format!("request {target}: {e}")))?;
                let status = response.status().as_u16();
                if !(200..300).contains(&status) {
                    let bytes = response.bytes().await.unwrap_or_default();
                    return Err(decode_error(status, &bytes));
                }
                let chunks = response.bytes_stream().map(|chunk| {
                    chunk
                        .map(|b| b.to_vec())
                        .map_err(|e| SandboxError::Internal(format!("stream read: {e}")))
                });
                Ok(Box::pin(chunks) as http::BodyChunks)
            }
            Transport::Unix { path } => {
                let response = http::unix_request(path, "GET", target, None).await?;
                if !(200..300).contains(&response.status) {
                    let status = response.status;
                    let bytes = response.collect().await.unwrap_or_default();
                    return Err(decode_error(status, &bytes));
                }
                Ok(response.body)
            }
        }
    }
}

/// Rebuild a typed error from an error response body.
fn decode_error(status: u16, bytes: &[u8]) -> SandboxError {
    match serde_json::from_slice::<ApiError>(bytes) {
        Ok(api) => {
            let code = ErrorCode::parse(&api.code, &api.message);
            SandboxError::from_wire(code, api.message)
        }
        Err(_) => SandboxError::Internal(format!(
            "http {status}: {}",
            String::from_utf8_lossy(bytes).trim()
        )),
    }
}

// ── SSE decoding ────────────────────────────────────────────────────

/// Typed view over one SSE response. `T` is the payload under the
/// expected event name; `error` events surface as typed errors.
pub struct EventStream<T> {
    chunks: Pin<Box<dyn Stream<Item = Result<Vec<u8>, SandboxError>> + Send>>,
    buffer: Vec<u8>,
    done: bool,
    expected: &'static str,
    _marker: std::marker::PhantomData<T>,
}

impl<T: DeserializeOwned> EventStream<T> {
    fn new(chunks: http::BodyChunks, expected: &'static str) -> Self {
        Self {
            chunks,
            buffer: Vec::new(),
            done: false,
            expected,
            _marker: std::marker::PhantomData,
        }
    }

    /// Next event, or `None` when the stream ends.
    pub async fn next(&mut self) -> Result<Option<T>, SandboxError> {
        loop {
            if let Some(raw) = self.take_event() {
                match self.parse_event(&raw)? {
                    Some(event) => return Ok(Some(event)),
                    None => continue,
                }
            }
            if self.done {
                return Ok(None);
            }
            match self.chunks.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(e),
                None => self.done = true,
            }
        }
    }

    /// Pop one complete `\n\n`-terminated event block off the buffer.
    fn take_event(&mut self) -> Option<String> {
        let pos = self
            .buffer
            .windows(2)
            .position(|window| window == b"\n\n")?;
        let raw: Vec<u8> = self.buffer.drain(..pos + 2).collect();
        Some(String::from_utf8_lossy(&raw).to_string())
    }

    fn parse_event(&self, raw: &str) -> Result<Option<T>, SandboxError> {
        let mut name = "message";
        let mut data = String::new();
        for line in raw.lines() {
            if let Some(value) = line.strip_prefix("event:") {
                name = value.trim();
            } else if let Some(value) = line.strip_prefix("data:") {
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(value.trim_start());
            }
            // Lines starting with ':' are keep-alive comments.
        }
        if data.is_empty() {
            return Ok(None);
        }
        if name == "error" {
            let api: ApiError = serde_json::from_str(&data)
                .map_err(|e| SandboxError::Internal(format!("decode stream error: {e}")))?;
            let code = ErrorCode::parse(&api.code, &api.message);
            return Err(SandboxError::from_wire(code, api.message));
        }
        if name != self.expected {
            return Ok(None);
        }
        serde_json::from_str(&data)
            .map(Some)
            .map_err(|e| SandboxError::Internal(format!("decode event: {e}")))
    }
}

// ── Narrow API surface for the coalescer ────────────────────────────

/// What the ensure-by-key coalescer needs from a control plane. The
/// wire client implements it; tests substitute fakes.
#[async_trait]
pub trait SandboxApi: Send + Sync {
    async fn create_sandbox(
        &self,
        policy: PolicyDocument,
        backend: Option<String>,
        ensure_key: Option<String>,
    ) -> Result<SandboxInfo, SandboxError>;

    async fn get_sandbox(&self, id: &str) -> Result<SandboxInfo, SandboxError>;

    async fn terminate_sandbox(&self, id: &str) -> Result<bool, SandboxError>;
}

#[async_trait]
impl SandboxApi for Client {
    async fn create_sandbox(
        &self,
        policy: PolicyDocument,
        backend: Option<String>,
        ensure_key: Option<String>,
    ) -> Result<SandboxInfo, SandboxError> {
        Client::create_sandbox(
            self,
            &CreateSandboxRequest {
                policy,
                backend,
                ensure_key,
                ready_timeout_ms: None,
            },
        )
        .await
    }

    async fn get_sandbox(&self, id: &str) -> Result<SandboxInfo, SandboxError> {
        Client::get_sandbox(self, id).await
    }

    async fn terminate_sandbox(&self, id: &str) -> Result<bool, SandboxError> {
        Client::terminate_sandbox(self, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn unsupported_scheme_fails_construction() {
        let err = Client::new("tsnet://cleanroom:7777").unwrap_err();
        assert!(err.to_string().contains("unsupported endpoint"));
    }

    #[test]
    fn decode_error_maps_wire_codes() {
        let body = br#"{"code": "not_found", "message": "unknown sandbox \"x\""}"#;
        let err = decode_error(404, body);
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert!(err.to_string().contains("unknown sandbox"));

        let body =
            br#"{"code": "internal", "message": "backend_capability_mismatch: git proxy"}"#;
        let err = decode_error(500, body);
        assert_eq!(err.code(), ErrorCode::BackendCapabilityMismatch);
    }

    #[test]
    fn decode_error_tolerates_non_json_bodies() {
        let err = decode_error(502, b"bad gateway");
        assert_eq!(err.code(), ErrorCode::Internal);
        assert!(err.to_string().contains("502"));
    }

    fn chunked(parts: Vec<&'static str>) -> http::BodyChunks {
        Box::pin(stream::iter(
            parts
                .into_iter()
                .map(|p| Ok::<_, SandboxError>(p.as_bytes().to_vec()))
                .collect::<Vec<_>>(),
        ))
    }

    #[tokio::test]
    async fn event_stream_parses_sse_blocks() {
        let sse = chunked(vec![
            "event: execution\ndata: {\"type\":\"message\",\"text\":\"queued\",\"ts\":\"2026-01-01T00:00:00Z\"}\n\n",
            ": keep-alive\n\nevent: execution\ndata: {\"type\":\"exit\",\"status\":\"SUCCEEDED\",\"exit_code\":0,\"ts\":\"2026-01-01T00:00:01Z\"}\n\n",
        ]);
        let mut stream: EventStream<ExecutionEvent> = EventStream::new(sse, "execution");

        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, ExecutionEvent::Message { .. }));
        let second = stream.next().await.unwrap().unwrap();
        assert!(second.is_exit());
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn event_stream_handles_split_chunks() {
        let sse = chunked(vec![
            "event: execution\ndata: {\"type\":\"message\",",
            "\"text\":\"running\",\"ts\":\"2026-01-01T00:00:00Z\"}\n\n",
        ]);
        let mut stream: EventStream<ExecutionEvent> = EventStream::new(sse, "execution");
        let event = stream.next().await.unwrap().unwrap();
        assert!(matches!(event, ExecutionEvent::Message { text, .. } if text == "running"));
    }

    #[tokio::test]
    async fn event_stream_surfaces_error_events() {
        let sse = chunked(vec![
            "event: error\ndata: {\"code\":\"resource_exhausted\",\"message\":\"subscriber dropped\"}\n\n",
        ]);
        let mut stream: EventStream<ExecutionEvent> = EventStream::new(sse, "execution");
        let err = stream.next().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ResourceExhausted);
    }
}
