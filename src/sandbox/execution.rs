//! Execution engine.
//!
//! Each execution is an owned record plus one worker task. The worker
//! opens a guest-agent stream, pumps frames into the execution's
//! fan-out and bounded accumulators, and drives the status FSM to a
//! terminal state on exit, stream close, cancellation, timeout, or VM
//! death. The terminal exit event is always the last event published.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::agent::{ExecRequest, GuestFrame, WorkspaceAccess, entropy_seed};
use crate::sandbox::backend::VmHandle;
use crate::sandbox::error::SandboxError;
use crate::sandbox::fanout::EventFanout;
use crate::sandbox::types::{
    ExecutionEvent, ExecutionId, ExecutionInfo, ExecutionKind, ExecutionOptions, ExecutionStatus,
    SandboxId, new_execution_id,
};

/// Per-stream capture bound. Overflow keeps the head and appends the
/// truncation marker.
pub const MAX_CAPTURE_BYTES: usize = 1 << 20;
pub const TRUNCATION_MARKER: &[u8] = b"\n[output truncated]\n";

/// Stdout/stderr accumulator with a hard cap.
#[derive(Debug)]
pub struct BoundedBuf {
    data: Vec<u8>,
    truncated: bool,
    cap: usize,
}

impl BoundedBuf {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            truncated: false,
            cap,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if self.truncated {
            return;
        }
        let remaining = self.cap.saturating_sub(self.data.len());
        if bytes.len() <= remaining {
            self.data.extend_from_slice(bytes);
        } else {
            self.data.extend_from_slice(&bytes[..remaining]);
            self.data.extend_from_slice(TRUNCATION_MARKER);
            self.truncated = true;
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

struct ExecState {
    status: ExecutionStatus,
    exit_code: Option<i32>,
    error: Option<String>,
    stdout: BoundedBuf,
    stderr: BoundedBuf,
}

/// One guest command invocation within a sandbox.
pub struct Execution {
    pub id: ExecutionId,
    pub sandbox_id: SandboxId,
    pub command: Vec<String>,
    pub kind: ExecutionKind,
    pub options: ExecutionOptions,
    pub events: EventFanout<ExecutionEvent>,
    state: StdMutex<ExecState>,
    cancel_tx: watch::Sender<Option<i32>>,
    cancel_rx: watch::Receiver<Option<i32>>,
}

impl Execution {
    pub fn new(
        sandbox_id: SandboxId,
        command: Vec<String>,
        kind: ExecutionKind,
        options: ExecutionOptions,
    ) -> Arc<Self> {
        let (cancel_tx, cancel_rx) = watch::channel(None);
        let exec = Arc::new(Self {
            id: new_execution_id(),
            sandbox_id,
            command,
            kind,
            options,
            events: EventFanout::new(),
            state: StdMutex::new(ExecState {
                status: ExecutionStatus::Queued,
                exit_code: None,
                error: None,
                stdout: BoundedBuf::new(MAX_CAPTURE_BYTES),
                stderr: BoundedBuf::new(MAX_CAPTURE_BYTES),
            }),
            cancel_tx,
            cancel_rx,
        });
        exec.events.publish(ExecutionEvent::Message {
            text: "queued".into(),
            ts: Utc::now(),
        });
        exec
    }

    pub fn status(&self) -> ExecutionStatus {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).status
    }

    pub fn info(&self) -> ExecutionInfo {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        ExecutionInfo {
            id: self.id.clone(),
            sandbox_id: self.sandbox_id.clone(),
            status: state.status,
            kind: self.kind,
            command: self.command.clone(),
            exit_code: state.exit_code,
            error: state.error.clone(),
        }
    }

    pub fn stdout(&self) -> Vec<u8> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stdout
            .bytes()
            .to_vec()
    }

    pub fn stderr(&self) -> Vec<u8> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stderr
            .bytes()
            .to_vec()
    }

    /// Request cancellation with an advisory signal. Terminal effects
    /// (the CANCELED exit event) come from the worker within a bounded
    /// delay.
    pub fn cancel(&self, signal: i32) {
        let _ = self.cancel_tx.send(Some(signal));
    }

    fn transition_running(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.status == ExecutionStatus::Queued {
            state.status = ExecutionStatus::Running;
            drop(state);
            self.events.publish(ExecutionEvent::Message {
                text: "running".into(),
                ts: Utc::now(),
            });
        }
    }

    fn push_stdout(&self, data: Vec<u8>) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.stdout.push(&data);
        }
        self.events.publish(ExecutionEvent::Stdout {
            data,
            ts: Utc::now(),
        });
    }

    fn push_stderr(&self, data: Vec<u8>) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.stderr.push(&data);
        }
        self.events.publish(ExecutionEvent::Stderr {
            data,
            ts: Utc::now(),
        });
    }

    /// Record the terminal status and publish the exit event, closing
    /// the fan-out. Terminal states are absorbing; later calls no-op.
    pub fn finish(&self, status: ExecutionStatus, exit_code: Option<i32>, error: Option<String>) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.status.is_terminal() {
                return;
            }
            state.status = status;
            state.exit_code = exit_code;
            state.error = error.clone();
        }
        self.events.publish_final(ExecutionEvent::Exit {
            status,
            exit_code,
            error,
            ts: Utc::now(),
        });
    }
}

enum Outcome {
    Exited { exit_code: i32, error: Option<String> },
    Canceled,
    TimedOut,
    VmExited,
    Failed { error: String },
}

/// Drive one execution to a terminal state. Spawned by the registry as
/// the execution's worker task.
pub async fn run_worker(exec: Arc<Execution>, handle: Arc<dyn VmHandle>) {
    exec.transition_running();

    let timeout = exec.options.timeout_ms.map(Duration::from_millis);
    let mut cancel_rx = exec.cancel_rx.clone();
    let mut exited_rx = handle.exited();

    let drive_fut = drive(exec.clone(), handle.clone(), timeout);
    tokio::pin!(drive_fut);

    let outcome = tokio::select! {
        outcome = &mut drive_fut => outcome,
        _ = cancel_rx.wait_for(|c| c.is_some()) => Outcome::Canceled,
        _ = exited_rx.wait_for(|e| *e) => Outcome::VmExited,
    };

    if matches!(outcome, Outcome::Canceled) {
        // Advisory signal, sent while the channel is still open. The
        // close that follows is the part that must land.
        let signal = (*exec.cancel_rx.borrow()).unwrap_or(15);
        let _ = handle.signal(&exec.id, signal).await;
    }
    // Returning drops the drive future and with it the guest stream,
    // closing the channel and unblocking the guest side.

    let (status, exit_code, error) = match outcome {
        Outcome::Exited { exit_code, error } => {
            let status = if exit_code == 0 && error.is_none() {
                ExecutionStatus::Succeeded
            } else {
                ExecutionStatus::Failed
            };
            (status, Some(exit_code), error)
        }
        Outcome::Canceled => (ExecutionStatus::Canceled, None, None),
        Outcome::TimedOut => (
            ExecutionStatus::TimedOut,
            None,
            Some("execution deadline exceeded".into()),
        ),
        Outcome::VmExited => (
            ExecutionStatus::Failed,
            None,
            Some("vm_exited during execution".into()),
        ),
        Outcome::Failed { error } => (ExecutionStatus::Failed, None, Some(error)),
    };

    tracing::debug!(
        execution_id = %exec.id,
        sandbox_id = %exec.sandbox_id,
        status = ?status,
        exit_code = ?exit_code,
        "execution finished"
    );
    exec.finish(status, exit_code, error);
}

/// Open the guest stream and pump frames. The deadline covers the whole
/// lifetime, including the fallback status fetch.
async fn drive(exec: Arc<Execution>, handle: Arc<dyn VmHandle>, timeout: Option<Duration>) -> Outcome {
    let inner = drive_inner(exec, handle);
    match timeout {
        Some(t) => match tokio::time::timeout(t, inner).await {
            Ok(outcome) => outcome,
            Err(_) => Outcome::TimedOut,
        },
        None => inner.await,
    }
}

async fn drive_inner(exec: Arc<Execution>, handle: Arc<dyn VmHandle>) -> Outcome {
    let req = ExecRequest {
        command: exec.command.clone(),
        env: exec.options.env.clone(),
        dir: exec.options.dir.clone(),
        entropy_seed: entropy_seed(),
        workspace_tar_gz: None,
        workspace_access: WorkspaceAccess::Rw,
    };

    let mut stream = match handle.open_exec(&exec.id, req).await {
        Ok(stream) => stream,
        Err(e) => {
            return Outcome::Failed {
                error: format!("open guest channel: {e}"),
            };
        }
    };

    let mut saw_event = false;
    loop {
        match stream.next().await {
            Ok(Some(GuestFrame::Stdout(data))) => {
                saw_event = true;
                exec.push_stdout(data);
            }
            Ok(Some(GuestFrame::Stderr(data))) => {
                saw_event = true;
                exec.push_stderr(data);
            }
            Ok(Some(GuestFrame::Exit { exit_code, error })) => {
                return Outcome::Exited { exit_code, error };
            }
            Ok(None) => break,
            Err(e) => {
                return Outcome::Failed {
                    error: format!("guest stream: {e}"),
                };
            }
        }
    }

    if saw_event {
        return Outcome::Failed {
            error: "guest stream closed before exit".into(),
        };
    }

    // Stream produced nothing at all: ask the backend for the terminal
    // status out-of-band. Still under the caller's deadline.
    match handle.fetch_exit(&exec.id).await {
        Ok(Some(exit)) => Outcome::Exited {
            exit_code: exit.exit_code,
            error: exit.error,
        },
        Ok(None) => Outcome::Failed {
            error: "guest stream closed without events or exit".into(),
        },
        Err(e) => Outcome::Failed {
            error: format!("fetch execution status: {e}"),
        },
    }
}
