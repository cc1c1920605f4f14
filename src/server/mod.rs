//! Control-plane RPC surface.
//!
//! HTTP/JSON over a unix socket (default) or TCP: unary operations as
//! POST/GET/DELETE, server streams as SSE, the bidi attach as a
//! WebSocket. TLS termination for TCP deployments belongs to the
//! transport collaborator in front of this listener.

pub mod attach;
pub mod routes;

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::routing::{get, post};

use crate::client::endpoint::Endpoint;
use crate::sandbox::SandboxRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SandboxRegistry>,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/v1/doctor", get(routes::doctor))
        .route(
            "/v1/sandboxes",
            post(routes::create_sandbox).get(routes::list_sandboxes),
        )
        .route(
            "/v1/sandboxes/{id}",
            get(routes::get_sandbox).delete(routes::terminate_sandbox),
        )
        .route("/v1/sandboxes/{id}/events", get(routes::stream_sandbox_events))
        .route(
            "/v1/sandboxes/{id}/executions",
            post(routes::create_execution),
        )
        .route(
            "/v1/sandboxes/{id}/executions/{exec_id}",
            get(routes::get_execution),
        )
        .route(
            "/v1/sandboxes/{id}/executions/{exec_id}/cancel",
            post(routes::cancel_execution),
        )
        .route(
            "/v1/sandboxes/{id}/executions/{exec_id}/events",
            get(routes::stream_execution),
        )
        .route(
            "/v1/sandboxes/{id}/executions/{exec_id}/stdin",
            post(routes::write_stdin),
        )
        .route(
            "/v1/sandboxes/{id}/executions/{exec_id}/resize",
            post(routes::resize_tty),
        )
        .route(
            "/v1/sandboxes/{id}/executions/{exec_id}/attach",
            get(attach::attach_execution),
        )
        .route(
            "/v1/sandboxes/{id}/files/download",
            post(routes::download_file),
        )
        .with_state(state)
}

/// Serve the app on the configured endpoint until the process exits.
pub async fn serve(endpoint: &str, state: AppState) -> anyhow::Result<()> {
    let app = create_app(state);
    match Endpoint::parse(endpoint)? {
        Endpoint::Unix(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            // A previous run may have left its socket file behind.
            let _ = std::fs::remove_file(&path);
            let listener = tokio::net::UnixListener::bind(&path)
                .with_context(|| format!("bind {}", path.display()))?;
            tracing::info!(socket = %path.display(), "listening on unix socket");
            axum::serve(listener, app).await.context("serve")?;
        }
        Endpoint::Http(base) => {
            let addr = base
                .strip_prefix("http://")
                .or_else(|| base.strip_prefix("https://"))
                .unwrap_or(&base)
                .to_string();
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("bind {addr}"))?;
            tracing::info!(addr = %addr, "listening on tcp");
            axum::serve(listener, app).await.context("serve")?;
        }
    }
    Ok(())
}
