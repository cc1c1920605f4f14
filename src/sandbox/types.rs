use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Identity ────────────────────────────────────────────────────────

pub type SandboxId = String;
pub type ExecutionId = String;

/// Opaque, collision-resistant sandbox id: `sbx_` + 32 hex chars.
pub fn new_sandbox_id() -> SandboxId {
    format!("sbx_{}", uuid::Uuid::new_v4().simple())
}

/// Opaque execution id: `exec_` + 32 hex chars.
pub fn new_execution_id() -> ExecutionId {
    format!("exec_{}", uuid::Uuid::new_v4().simple())
}

// ── Sandbox status FSM ──────────────────────────────────────────────

/// PROVISIONING → READY → STOPPING → STOPPED, with FAILED terminal from
/// PROVISIONING and STOPPING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxStatus {
    Provisioning,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

impl SandboxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SandboxStatus::Stopped | SandboxStatus::Failed)
    }
}

// ── Execution status FSM ────────────────────────────────────────────

/// QUEUED → RUNNING → {SUCCEEDED, FAILED, CANCELED, TIMED_OUT}.
/// Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Queued | ExecutionStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionKind {
    #[default]
    Batch,
    Interactive,
}

// ── Host-side addressing ────────────────────────────────────────────

/// Per-sandbox host networking identity, derived deterministically from
/// the sandbox id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxAddressing {
    pub tap_name: String,
    pub host_ip: String,
    pub guest_ip: String,
    pub guest_mac: String,
    pub guest_cid: u32,
}

// ── Wire records ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub id: SandboxId,
    pub status: SandboxStatus,
    pub backend: String,
    pub policy_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensure_key: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub execution_ids: Vec<ExecutionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub id: ExecutionId,
    pub sandbox_id: SandboxId,
    pub status: ExecutionStatus,
    pub kind: ExecutionKind,
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Options for `CreateExecution`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOptions {
    #[serde(default)]
    pub tty: bool,
    /// Whole-lifetime deadline, milliseconds. None = no deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// `KEY=value` pairs, ordered.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

// ── Event records ───────────────────────────────────────────────────

/// Sandbox-level event: a status transition or informational message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxEvent {
    pub status: SandboxStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub ts: DateTime<Utc>,
}

impl SandboxEvent {
    pub fn now(status: SandboxStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            ts: Utc::now(),
        }
    }
}

/// Execution-level event. `Exit` is always the last event delivered for
/// an execution; nothing is emitted after it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Stdout {
        #[serde(with = "b64")]
        data: Vec<u8>,
        ts: DateTime<Utc>,
    },
    Stderr {
        #[serde(with = "b64")]
        data: Vec<u8>,
        ts: DateTime<Utc>,
    },
    Exit {
        status: ExecutionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        ts: DateTime<Utc>,
    },
    Message {
        text: String,
        ts: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn stdout(data: Vec<u8>) -> Self {
        ExecutionEvent::Stdout {
            data,
            ts: Utc::now(),
        }
    }

    pub fn stderr(data: Vec<u8>) -> Self {
        ExecutionEvent::Stderr {
            data,
            ts: Utc::now(),
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, ExecutionEvent::Exit { .. })
    }
}

/// Serde adapter: byte fields ride base64 inside JSON bodies.
pub(crate) mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
