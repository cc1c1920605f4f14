//! Backend seam: the narrow capability set every VM backend implements.
//!
//! Backends are looked up by name and drive real machines; the registry
//! and execution engine only ever talk through these traits, so tests
//! substitute in-process fakes.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::agent::{ExecRequest, GuestFrame};
use crate::policy::CompiledPolicy;
use crate::sandbox::error::SandboxError;
use crate::sandbox::types::{SandboxAddressing, SandboxId};

/// Capability flags, queried instead of downcasting. Operations a
/// backend does not support return `unimplemented`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BackendCapabilities {
    /// `WriteStdin` / `ResizeTTY` for interactive executions.
    pub interactive: bool,
    /// Forwarding advisory signal numbers to the guest process.
    pub signals: bool,
    /// Seeding the guest workspace from a tar.gz archive.
    pub workspace_archive: bool,
    /// Scoped git egress through the host gateway.
    pub git_proxy: bool,
}

/// One doctor probe result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorCheck {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

/// Aggregate health report for a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorReport {
    pub backend: String,
    pub checks: Vec<DoctorCheck>,
}

impl DoctorReport {
    pub fn healthy(&self) -> bool {
        self.checks.iter().all(|c| c.ok)
    }
}

/// Input to `provision`.
#[derive(Debug, Clone)]
pub struct ProvisionSpec {
    pub sandbox_id: SandboxId,
    pub policy: CompiledPolicy,
    /// Bound on the guest readiness handshake.
    pub ready_timeout: Duration,
}

impl ProvisionSpec {
    pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(sandbox_id: SandboxId, policy: CompiledPolicy) -> Self {
        Self {
            sandbox_id,
            policy,
            ready_timeout: Self::DEFAULT_READY_TIMEOUT,
        }
    }
}

/// Terminal result fetched out-of-band when a guest stream yielded no
/// events before closing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestExit {
    pub exit_code: i32,
    pub error: Option<String>,
}

/// Factory for sandboxes of one backend kind.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> BackendCapabilities;

    /// Bring up a VM for the sandbox and complete the guest readiness
    /// handshake. On error, all partial host state must already be torn
    /// down.
    async fn provision(&self, spec: ProvisionSpec) -> Result<Box<dyn VmHandle>, SandboxError>;

    /// Environment probes: hypervisor device, binaries, kernel image.
    async fn doctor(&self) -> DoctorReport;
}

/// A running VM. Owned exclusively by the registry; `shutdown` is
/// idempotent.
#[async_trait]
pub trait VmHandle: Send + Sync {
    /// Host-side addressing, when the backend attaches a network.
    fn addressing(&self) -> Option<&SandboxAddressing> {
        None
    }

    /// Open a fresh guest-agent channel, send the exec request, and
    /// return the guest's frame stream. One inflight exec per channel.
    async fn open_exec(
        &self,
        exec_id: &str,
        req: ExecRequest,
    ) -> Result<Box<dyn GuestStream>, SandboxError>;

    async fn write_stdin(&self, _exec_id: &str, _data: &[u8]) -> Result<(), SandboxError> {
        Err(SandboxError::Unimplemented("write_stdin"))
    }

    async fn resize_tty(&self, _exec_id: &str, _cols: u16, _rows: u16) -> Result<(), SandboxError> {
        Err(SandboxError::Unimplemented("resize_tty"))
    }

    /// Advisory signal. Implementations must at least interrupt the
    /// guest read loop and close the channel.
    async fn signal(&self, _exec_id: &str, _signal: i32) -> Result<(), SandboxError> {
        Err(SandboxError::Unimplemented("signal"))
    }

    /// Out-of-band terminal status, used only when the stream produced
    /// zero events. Subject to the caller's deadline.
    async fn fetch_exit(&self, _exec_id: &str) -> Result<Option<GuestExit>, SandboxError> {
        Ok(None)
    }

    /// Bounded read of a guest file (`head -c` semantics).
    async fn download_file(&self, path: &str, max_bytes: u64) -> Result<Vec<u8>, SandboxError>;

    /// Flips to `true` once the VM process has exited.
    fn exited(&self) -> watch::Receiver<bool>;

    /// Kill the VM, tear down its network, remove its run directory.
    async fn shutdown(&self) -> Result<(), SandboxError>;
}

/// Reader half of one guest execution stream. Dropping it closes the
/// underlying channel, unblocking the guest.
#[async_trait]
pub trait GuestStream: Send {
    /// Next frame, or `None` when the channel closes. An `Exit` frame is
    /// terminal.
    async fn next(&mut self) -> Result<Option<GuestFrame>, SandboxError>;
}

/// Verify the policy only asks for what the backend can do.
pub fn check_policy_capabilities(
    policy: &CompiledPolicy,
    backend: &dyn SandboxBackend,
) -> Result<(), SandboxError> {
    if let Some(git) = &policy.git {
        if git.enabled && !backend.capabilities().git_proxy {
            return Err(SandboxError::BackendCapabilityMismatch(format!(
                "policy requires git proxy but backend {:?} does not provide one",
                backend.name()
            )));
        }
    }
    Ok(())
}
