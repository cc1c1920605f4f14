//! Bidi attach: one WebSocket carrying client input frames in and
//! execution output frames back.
//!
//! The first client frame must be `open`, naming the sandbox and
//! execution. `close{detach:false}` cancels the execution with
//! signal 2 (interrupt); `close{detach:true}` only tears the stream
//! down and leaves the execution running.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use super::AppState;
use super::routes::ApiError;
use crate::sandbox::error::SandboxError;
use crate::sandbox::types::{ExecutionEvent, ExecutionStatus, b64};

/// Client → server frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttachIn {
    Open {
        sandbox_id: String,
        execution_id: String,
    },
    Stdin {
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Signal {
        signal: i32,
    },
    Heartbeat,
    Close {
        #[serde(default)]
        detach: bool,
    },
}

/// Server → client frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttachOut {
    Stdout {
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    Stderr {
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    Exit {
        status: ExecutionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        code: String,
        message: String,
    },
}

/// Execution events as attach frames. Lifecycle messages stay off the
/// attach stream; it carries io and the exit only.
fn to_frame(event: ExecutionEvent) -> Option<AttachOut> {
    match event {
        ExecutionEvent::Stdout { data, .. } => Some(AttachOut::Stdout { data }),
        ExecutionEvent::Stderr { data, .. } => Some(AttachOut::Stderr { data }),
        ExecutionEvent::Exit {
            status,
            exit_code,
            error,
            ..
        } => Some(AttachOut::Exit {
            status,
            exit_code,
            error,
        }),
        ExecutionEvent::Message { .. } => None,
    }
}

pub(crate) async fn attach_execution(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| attach_socket(state, socket))
}

async fn attach_socket(state: AppState, socket: WebSocket) {
    let (mut tx, mut rx) = socket.split();

    // The stream is anonymous until the client identifies the
    // execution with an `open` frame.
    let (sandbox_id, exec_id) = match read_frame(&mut rx).await {
        Some(AttachIn::Open {
            sandbox_id,
            execution_id,
        }) => (sandbox_id, execution_id),
        Some(_) | None => {
            let err: ApiError = SandboxError::InvalidArgument(
                "attach stream must begin with an open frame".into(),
            )
            .into();
            let _ = send_frame(
                &mut tx,
                &AttachOut::Error {
                    code: err.code,
                    message: err.message,
                },
            )
            .await;
            return;
        }
    };

    let (history, mut sub) = match state.registry.subscribe_execution(&sandbox_id, &exec_id) {
        Ok(pair) => pair,
        Err(e) => {
            let err: ApiError = e.into();
            let _ = send_frame(
                &mut tx,
                &AttachOut::Error {
                    code: err.code,
                    message: err.message,
                },
            )
            .await;
            return;
        }
    };

    tracing::debug!(
        sandbox_id = %sandbox_id,
        execution_id = %exec_id,
        "attach stream opened"
    );

    for event in history {
        if let Some(frame) = to_frame(event) {
            if send_frame(&mut tx, &frame).await.is_err() {
                return;
            }
        }
    }

    loop {
        tokio::select! {
            event = sub.recv() => match event {
                Ok(Some(event)) => {
                    let is_exit = event.is_exit();
                    if let Some(frame) = to_frame(event) {
                        if send_frame(&mut tx, &frame).await.is_err() {
                            return;
                        }
                    }
                    if is_exit {
                        let _ = tx.send(Message::Close(None)).await;
                        return;
                    }
                }
                Ok(None) => {
                    let _ = tx.send(Message::Close(None)).await;
                    return;
                }
                Err(e) => {
                    let err: ApiError = e.into();
                    let _ = send_frame(&mut tx, &AttachOut::Error {
                        code: err.code,
                        message: err.message,
                    }).await;
                    return;
                }
            },
            frame = read_frame(&mut rx) => match frame {
                Some(AttachIn::Stdin { data }) => {
                    if let Err(e) = state.registry.write_stdin(&sandbox_id, &exec_id, &data).await {
                        let err: ApiError = e.into();
                        if send_frame(&mut tx, &AttachOut::Error {
                            code: err.code,
                            message: err.message,
                        }).await.is_err() {
                            return;
                        }
                    }
                }
                Some(AttachIn::Resize { cols, rows }) => {
                    if let Err(e) = state.registry.resize_tty(&sandbox_id, &exec_id, cols, rows).await {
                        let err: ApiError = e.into();
                        if send_frame(&mut tx, &AttachOut::Error {
                            code: err.code,
                            message: err.message,
                        }).await.is_err() {
                            return;
                        }
                    }
                }
                Some(AttachIn::Signal { signal }) => {
                    let _ = state.registry.signal_execution(&sandbox_id, &exec_id, signal).await;
                }
                Some(AttachIn::Heartbeat) => {}
                Some(AttachIn::Close { detach }) => {
                    if !detach {
                        let _ = state.registry.cancel_execution(&sandbox_id, &exec_id, 2);
                    }
                    let _ = tx.send(Message::Close(None)).await;
                    return;
                }
                Some(AttachIn::Open { .. }) => {
                    // A second open is a protocol violation; ignore it.
                }
                None => {
                    // Client went away without close: leave the
                    // execution running, just drop the stream.
                    return;
                }
            },
        }
    }
}

async fn read_frame(
    rx: &mut futures::stream::SplitStream<WebSocket>,
) -> Option<AttachIn> {
    loop {
        match rx.next().await? {
            Ok(Message::Text(text)) => match serde_json::from_str(&text) {
                Ok(frame) => return Some(frame),
                Err(e) => {
                    tracing::debug!(error = %e, "undecodable attach frame dropped");
                }
            },
            Ok(Message::Binary(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(frame) => return Some(frame),
                Err(e) => {
                    tracing::debug!(error = %e, "undecodable attach frame dropped");
                }
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => {}
            Err(_) => return None,
        }
    }
}

async fn send_frame(
    tx: &mut futures::stream::SplitSink<WebSocket, Message>,
    frame: &AttachOut,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_else(|_| "{}".into());
    tx.send(Message::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_in_frames_round_trip() {
        let frames = vec![
            AttachIn::Open {
                sandbox_id: "sbx_1".into(),
                execution_id: "exec_1".into(),
            },
            AttachIn::Stdin {
                data: b"ls\n".to_vec(),
            },
            AttachIn::Resize { cols: 80, rows: 24 },
            AttachIn::Signal { signal: 2 },
            AttachIn::Heartbeat,
            AttachIn::Close { detach: true },
        ];
        for frame in frames {
            let json = serde_json::to_string(&frame).unwrap();
            let back: AttachIn = serde_json::from_str(&json).unwrap();
            assert_eq!(back, frame);
        }
    }

    #[test]
    fn close_detach_defaults_to_false() {
        let frame: AttachIn = serde_json::from_str(r#"{"type": "close"}"#).unwrap();
        assert_eq!(frame, AttachIn::Close { detach: false });
    }

    #[test]
    fn attach_out_exit_frame_shape() {
        let frame = AttachOut::Exit {
            status: ExecutionStatus::Succeeded,
            exit_code: Some(0),
            error: None,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"exit\""));
        assert!(json.contains("\"SUCCEEDED\""));
    }

    #[test]
    fn message_events_do_not_reach_the_stream() {
        let converted = to_frame(ExecutionEvent::Message {
            text: "queued".into(),
            ts: chrono::Utc::now(),
        });
        assert!(converted.is_none());
    }

    #[test]
    fn stdout_event_converts_to_frame() {
        let converted = to_frame(ExecutionEvent::stdout(b"hi".to_vec()));
        assert_eq!(
            converted,
            Some(AttachOut::Stdout {
                data: b"hi".to_vec()
            })
        );
    }
}
