//! In-memory sandbox registry.
//!
//! Owns every sandbox record and its VM handle. Provisioning is
//! serialized per id through a separate `provisioning` set so the
//! registry lock is never held across backend calls. Terminating pops
//! the record first, so every later operation observes `not_found`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::backend::{
    DoctorReport, ProvisionSpec, SandboxBackend, VmHandle, check_policy_capabilities,
};
use super::error::SandboxError;
use super::execution::{Execution, run_worker};
use super::fanout::{EventFanout, Subscription};
use super::types::{
    ExecutionEvent, ExecutionId, ExecutionInfo, ExecutionKind, ExecutionOptions,
    SandboxAddressing, SandboxEvent, SandboxId, SandboxInfo, SandboxStatus, new_sandbox_id,
};

/// One sandbox record. The registry is the only owner; RPC layers see
/// snapshots.
pub struct SandboxEntry {
    pub id: SandboxId,
    pub policy: crate::policy::CompiledPolicy,
    pub backend_name: String,
    pub ensure_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub events: EventFanout<SandboxEvent>,
    state: StdMutex<EntryState>,
    executions: StdMutex<HashMap<ExecutionId, Arc<Execution>>>,
}

impl std::fmt::Debug for SandboxEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxEntry")
            .field("id", &self.id)
            .field("backend_name", &self.backend_name)
            .field("ensure_key", &self.ensure_key)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

struct EntryState {
    status: SandboxStatus,
    addressing: Option<SandboxAddressing>,
    handle: Option<Arc<dyn VmHandle>>,
}

impl SandboxEntry {
    fn new(
        id: SandboxId,
        policy: crate::policy::CompiledPolicy,
        backend_name: String,
        ensure_key: Option<String>,
    ) -> Arc<Self> {
        let entry = Arc::new(Self {
            id,
            policy,
            backend_name,
            ensure_key,
            created_at: Utc::now(),
            events: EventFanout::new(),
            state: StdMutex::new(EntryState {
                status: SandboxStatus::Provisioning,
                addressing: None,
                handle: None,
            }),
            executions: StdMutex::new(HashMap::new()),
        });
        entry
            .events
            .publish(SandboxEvent::now(SandboxStatus::Provisioning, "provisioning"));
        entry
    }

    pub fn status(&self) -> SandboxStatus {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).status
    }

    fn set_status(&self, status: SandboxStatus, message: impl Into<String>) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.status = status;
        }
        let event = SandboxEvent::now(status, message);
        if status.is_terminal() {
            self.events.publish_final(event);
        } else {
            self.events.publish(event);
        }
    }

    fn handle(&self) -> Option<Arc<dyn VmHandle>> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .handle
            .clone()
    }

    fn attach_handle(&self, handle: Arc<dyn VmHandle>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.addressing = handle.addressing().cloned();
        state.handle = Some(handle);
    }

    fn release_handle(&self) -> Option<Arc<dyn VmHandle>> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .handle
            .take()
    }

    pub fn addressing(&self) -> Option<SandboxAddressing> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .addressing
            .clone()
    }

    pub fn info(&self) -> SandboxInfo {
        let execution_ids = {
            let executions = self.executions.lock().unwrap_or_else(|e| e.into_inner());
            let mut ids: Vec<ExecutionId> = executions.keys().cloned().collect();
            ids.sort();
            ids
        };
        SandboxInfo {
            id: self.id.clone(),
            status: self.status(),
            backend: self.backend_name.clone(),
            policy_hash: self.policy.hash.clone(),
            created_at: self.created_at,
            ensure_key: self.ensure_key.clone(),
            execution_ids,
        }
    }

    pub fn execution(&self, exec_id: &str) -> Option<Arc<Execution>> {
        self.executions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(exec_id)
            .cloned()
    }

    fn executions_snapshot(&self) -> Vec<Arc<Execution>> {
        self.executions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

struct RegistryInner {
    sandboxes: HashMap<SandboxId, Arc<SandboxEntry>>,
    provisioning: HashSet<SandboxId>,
}

pub struct SandboxRegistry {
    backends: HashMap<String, Arc<dyn SandboxBackend>>,
    default_backend: String,
    inner: StdMutex<RegistryInner>,
}

impl SandboxRegistry {
    pub fn new(backends: Vec<Arc<dyn SandboxBackend>>, default_backend: &str) -> Self {
        let backends: HashMap<String, Arc<dyn SandboxBackend>> = backends
            .into_iter()
            .map(|b| (b.name().to_string(), b))
            .collect();
        Self {
            backends,
            default_backend: default_backend.to_string(),
            inner: StdMutex::new(RegistryInner {
                sandboxes: HashMap::new(),
                provisioning: HashSet::new(),
            }),
        }
    }

    pub fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    fn backend(&self, name: Option<&str>) -> Result<(String, Arc<dyn SandboxBackend>), SandboxError> {
        let name = name.unwrap_or(self.default_backend.as_str());
        match self.backends.get(name) {
            Some(backend) => Ok((name.to_string(), backend.clone())),
            None => Err(SandboxError::InvalidArgument(format!(
                "unknown backend {name:?}"
            ))),
        }
    }

    /// Provision a new sandbox. `id` is generated when absent; passing
    /// one is how embedding code (and tests) pin identities.
    pub async fn create_sandbox(
        self: &Arc<Self>,
        id: Option<SandboxId>,
        policy: crate::policy::CompiledPolicy,
        backend_name: Option<&str>,
        ensure_key: Option<String>,
        ready_timeout: Option<Duration>,
    ) -> Result<SandboxInfo, SandboxError> {
        let (backend_name, backend) = self.backend(backend_name)?;
        check_policy_capabilities(&policy, backend.as_ref())?;

        let id = id.unwrap_or_else(new_sandbox_id);
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.sandboxes.contains_key(&id) {
                return Err(SandboxError::AlreadyExists(format!(
                    "sandbox {id:?} already provisioned"
                )));
            }
            if !inner.provisioning.insert(id.clone()) {
                return Err(SandboxError::AlreadyExists(format!(
                    "sandbox {id:?} already provisioning"
                )));
            }
        }

        let entry = SandboxEntry::new(id.clone(), policy.clone(), backend_name, ensure_key);

        let mut spec = ProvisionSpec::new(id.clone(), policy);
        if let Some(timeout) = ready_timeout {
            spec.ready_timeout = timeout;
        }
        let provisioned = backend.provision(spec).await;

        match provisioned {
            Ok(handle) => {
                let handle: Arc<dyn VmHandle> = Arc::from(handle);
                entry.attach_handle(handle.clone());
                entry.set_status(SandboxStatus::Ready, "guest agent ready");
                {
                    let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                    inner.provisioning.remove(&id);
                    inner.sandboxes.insert(id.clone(), entry.clone());
                }
                self.spawn_exit_watcher(entry.clone(), handle);
                Ok(entry.info())
            }
            Err(e) => {
                {
                    let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                    inner.provisioning.remove(&id);
                }
                entry.set_status(SandboxStatus::Failed, e.to_string());
                tracing::warn!(sandbox_id = %id, error = %e, "sandbox provisioning failed");
                Err(e)
            }
        }
    }

    /// Watches the VM process; a death while READY drives the sandbox
    /// to STOPPED and fails its executions.
    fn spawn_exit_watcher(self: &Arc<Self>, entry: Arc<SandboxEntry>, handle: Arc<dyn VmHandle>) {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut exited = handle.exited();
            if exited.wait_for(|e| *e).await.is_err() {
                return;
            }
            let Some(registry) = registry.upgrade() else {
                return;
            };
            registry.handle_vm_exit(&entry.id).await;
        });
    }

    /// Backend reported the VM process gone. The record stays visible
    /// with a terminal status; executions fail through their own
    /// exit-watch within the worker.
    async fn handle_vm_exit(&self, id: &SandboxId) {
        let entry = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.sandboxes.get(id).cloned()
        };
        let Some(entry) = entry else { return };
        if entry.status() != SandboxStatus::Ready {
            return;
        }

        tracing::warn!(sandbox_id = %id, "vm exited while sandbox was READY");
        entry.set_status(SandboxStatus::Stopping, "vm exited");
        for exec in entry.executions_snapshot() {
            // Worker observes the exit watch; the cancel is a belt for
            // workers that have not yet opened their stream.
            exec.cancel(9);
        }
        if let Some(handle) = entry.release_handle() {
            if let Err(e) = handle.shutdown().await {
                tracing::warn!(sandbox_id = %id, error = %e, "post-exit shutdown failed");
            }
        }
        entry.set_status(SandboxStatus::Stopped, "teardown complete");
    }

    pub fn get(&self, id: &str) -> Result<Arc<SandboxEntry>, SandboxError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .sandboxes
            .get(id)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(format!("unknown sandbox {id:?}")))
    }

    pub fn list(&self) -> Vec<SandboxInfo> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut infos: Vec<SandboxInfo> = inner.sandboxes.values().map(|e| e.info()).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    /// Pop the sandbox and run shutdown outside the registry lock.
    /// Idempotent from the caller's view: a second terminate sees
    /// `not_found`.
    pub async fn terminate(&self, id: &str) -> Result<bool, SandboxError> {
        let entry = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .sandboxes
                .remove(id)
                .ok_or_else(|| SandboxError::NotFound(format!("unknown sandbox {id:?}")))?
        };

        entry.set_status(SandboxStatus::Stopping, "terminate requested");
        for exec in entry.executions_snapshot() {
            exec.cancel(15);
        }
        if let Some(handle) = entry.release_handle() {
            if let Err(e) = handle.shutdown().await {
                tracing::warn!(sandbox_id = %id, error = %e, "shutdown failed");
                entry.set_status(SandboxStatus::Failed, format!("teardown failed: {e}"));
                return Err(e);
            }
        }
        entry.set_status(SandboxStatus::Stopped, "teardown complete");
        tracing::info!(sandbox_id = %id, "sandbox terminated");
        Ok(true)
    }

    pub fn subscribe_sandbox(
        &self,
        id: &str,
    ) -> Result<(Vec<SandboxEvent>, Subscription<SandboxEvent>), SandboxError> {
        Ok(self.get(id)?.events.subscribe())
    }

    // ── Executions ──────────────────────────────────────────────

    pub fn create_execution(
        &self,
        sandbox_id: &str,
        command: Vec<String>,
        kind: ExecutionKind,
        options: ExecutionOptions,
    ) -> Result<ExecutionInfo, SandboxError> {
        if command.is_empty() || command.iter().any(|part| part.is_empty()) {
            return Err(SandboxError::InvalidArgument(
                "command must be a non-empty list of non-empty strings".into(),
            ));
        }
        let entry = self.get(sandbox_id)?;
        if entry.status() != SandboxStatus::Ready {
            return Err(SandboxError::FailedPrecondition(format!(
                "sandbox {sandbox_id:?} is {:?}, not READY",
                entry.status()
            )));
        }
        let handle = entry.handle().ok_or_else(|| {
            SandboxError::FailedPrecondition(format!("sandbox {sandbox_id:?} has no live VM"))
        })?;

        let exec = Execution::new(entry.id.clone(), command, kind, options);
        entry
            .executions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(exec.id.clone(), exec.clone());

        let info = exec.info();
        tokio::spawn(run_worker(exec, handle));
        Ok(info)
    }

    fn execution(
        &self,
        sandbox_id: &str,
        exec_id: &str,
    ) -> Result<(Arc<SandboxEntry>, Arc<Execution>), SandboxError> {
        let entry = self.get(sandbox_id)?;
        let exec = entry
            .execution(exec_id)
            .ok_or_else(|| SandboxError::NotFound(format!("unknown execution {exec_id:?}")))?;
        Ok((entry, exec))
    }

    pub fn get_execution(
        &self,
        sandbox_id: &str,
        exec_id: &str,
    ) -> Result<ExecutionInfo, SandboxError> {
        Ok(self.execution(sandbox_id, exec_id)?.1.info())
    }

    pub fn cancel_execution(
        &self,
        sandbox_id: &str,
        exec_id: &str,
        signal: i32,
    ) -> Result<(), SandboxError> {
        let (_, exec) = self.execution(sandbox_id, exec_id)?;
        exec.cancel(signal);
        Ok(())
    }

    /// Forward a raw signal to the guest process without driving the
    /// execution to CANCELED.
    pub async fn signal_execution(
        &self,
        sandbox_id: &str,
        exec_id: &str,
        signal: i32,
    ) -> Result<(), SandboxError> {
        let (entry, _) = self.execution(sandbox_id, exec_id)?;
        let handle = entry.handle().ok_or_else(|| {
            SandboxError::FailedPrecondition(format!("sandbox {sandbox_id:?} has no live VM"))
        })?;
        handle.signal(exec_id, signal).await
    }

    pub fn subscribe_execution(
        &self,
        sandbox_id: &str,
        exec_id: &str,
    ) -> Result<(Vec<ExecutionEvent>, Subscription<ExecutionEvent>), SandboxError> {
        let (_, exec) = self.execution(sandbox_id, exec_id)?;
        Ok(exec.events.subscribe())
    }

    pub async fn write_stdin(
        &self,
        sandbox_id: &str,
        exec_id: &str,
        data: &[u8],
    ) -> Result<(), SandboxError> {
        let (entry, exec) = self.execution(sandbox_id, exec_id)?;
        self.require_interactive(&entry, &exec)?;
        let handle = entry.handle().ok_or_else(|| {
            SandboxError::FailedPrecondition(format!("sandbox {sandbox_id:?} has no live VM"))
        })?;
        handle.write_stdin(exec_id, data).await
    }

    pub async fn resize_tty(
        &self,
        sandbox_id: &str,
        exec_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), SandboxError> {
        let (entry, exec) = self.execution(sandbox_id, exec_id)?;
        self.require_interactive(&entry, &exec)?;
        let handle = entry.handle().ok_or_else(|| {
            SandboxError::FailedPrecondition(format!("sandbox {sandbox_id:?} has no live VM"))
        })?;
        handle.resize_tty(exec_id, cols, rows).await
    }

    fn require_interactive(
        &self,
        entry: &SandboxEntry,
        exec: &Execution,
    ) -> Result<(), SandboxError> {
        if exec.kind != ExecutionKind::Interactive || !exec.options.tty {
            return Err(SandboxError::FailedPrecondition(format!(
                "execution {:?} is not interactive",
                exec.id
            )));
        }
        let (_, backend) = self.backend(Some(entry.backend_name.as_str()))?;
        if !backend.capabilities().interactive {
            return Err(SandboxError::Unimplemented("interactive io"));
        }
        Ok(())
    }

    pub async fn download_file(
        &self,
        sandbox_id: &str,
        path: &str,
        max_bytes: u64,
    ) -> Result<Vec<u8>, SandboxError> {
        if path.is_empty() || !path.starts_with('/') {
            return Err(SandboxError::InvalidArgument(format!(
                "path {path:?} must be absolute"
            )));
        }
        let entry = self.get(sandbox_id)?;
        if entry.status() != SandboxStatus::Ready {
            return Err(SandboxError::FailedPrecondition(format!(
                "sandbox {sandbox_id:?} is {:?}, not READY",
                entry.status()
            )));
        }
        let handle = entry.handle().ok_or_else(|| {
            SandboxError::FailedPrecondition(format!("sandbox {sandbox_id:?} has no live VM"))
        })?;
        handle.download_file(path, max_bytes).await
    }

    pub async fn doctor(&self) -> Vec<DoctorReport> {
        let mut reports = Vec::new();
        let mut names = self.backend_names();
        names.sort();
        for name in names {
            if let Some(backend) = self.backends.get(&name) {
                reports.push(backend.doctor().await);
            }
        }
        reports
    }
}
