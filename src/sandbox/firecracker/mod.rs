//! Firecracker microVM backend.
//!
//! Provisioning pipeline per sandbox: resolve the base image, prepare
//! (or reuse) the runtime rootfs, copy it into the sandbox run
//! directory, bring up the per-sandbox network, write the VM config,
//! spawn the `firecracker` process, and wait for the guest agent to
//! accept a vsock connection. Executions each open a fresh agent
//! channel on the same vsock socket.

pub mod host_cmd;
pub mod net;
pub mod rootfs;
pub mod vm_config;
pub mod vsock;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{Mutex, watch};

use crate::agent::{
    AGENT_VSOCK_PORT, ExecRequest, FrameReader, GuestFrame, HostFrame, WorkspaceAccess,
    entropy_seed, write_exec_request, write_host_frame,
};
use crate::observe::{RunRecord, Stage};
use crate::sandbox::backend::{
    BackendCapabilities, DoctorCheck, DoctorReport, GuestStream, ProvisionSpec, SandboxBackend,
    VmHandle,
};
use crate::sandbox::error::SandboxError;
use crate::sandbox::types::{SandboxAddressing, SandboxId};

use host_cmd::PrivilegedRunner;
use net::{HostResolver, NetworkFabric, NetworkLease};
use rootfs::{ImageStore, RootfsPrep};
use vm_config::{API_SOCK_FILE, ROOTFS_FILE, VM_CONFIG_FILE, VM_STDERR_FILE, VM_STDOUT_FILE, VSOCK_UDS_FILE};

const BACKEND_NAME: &str = "firecracker";
const DIAL_RETRY_INTERVAL: Duration = Duration::from_millis(150);
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct FirecrackerConfig {
    pub state_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub kernel_image: PathBuf,
    pub firecracker_bin: PathBuf,
    pub guest_agent_binary: PathBuf,
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    pub dns_server: String,
}

pub struct FirecrackerBackend {
    config: FirecrackerConfig,
    image_store: Arc<dyn ImageStore>,
    rootfs_prep: RootfsPrep,
    network: Arc<NetworkFabric>,
}

impl FirecrackerBackend {
    pub fn new(
        config: FirecrackerConfig,
        image_store: Arc<dyn ImageStore>,
        runner: Arc<dyn PrivilegedRunner>,
        resolver: Arc<dyn HostResolver>,
    ) -> Self {
        let rootfs_prep = RootfsPrep::new(
            config.cache_dir.clone(),
            runner.clone(),
            config.guest_agent_binary.clone(),
        );
        let network = Arc::new(NetworkFabric::new(
            runner,
            resolver,
            config.dns_server.clone(),
        ));
        Self {
            config,
            image_store,
            rootfs_prep,
            network,
        }
    }

    fn run_dir(&self, sandbox_id: &SandboxId) -> PathBuf {
        self.config.state_dir.join("sandboxes").join(sandbox_id)
    }
}

#[async_trait]
impl SandboxBackend for FirecrackerBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            interactive: true,
            signals: true,
            workspace_archive: true,
            git_proxy: false,
        }
    }

    async fn provision(&self, spec: ProvisionSpec) -> Result<Box<dyn VmHandle>, SandboxError> {
        let total = Stage::start();
        let mut record = RunRecord::new(&spec.sandbox_id, BACKEND_NAME, "provision");
        record.image_ref = spec.policy.image_ref.clone();
        record.image_digest = spec.policy.image_digest.clone();

        let stage = Stage::start();
        let (digest, base_rootfs) = self
            .image_store
            .base_rootfs(&spec.policy.image_ref)
            .await?;
        if digest != spec.policy.image_digest {
            return Err(SandboxError::Internal(format!(
                "image store returned digest {digest}, policy pinned {}",
                spec.policy.image_digest
            )));
        }
        record.timings_ms.policy_resolve_ms = stage.elapsed_ms();

        let stage = Stage::start();
        let prepared = self.rootfs_prep.prepare(&digest, &base_rootfs).await?;
        record.cache_hit = prepared.cache_hit;

        let run_dir = self.run_dir(&spec.sandbox_id);
        std::fs::create_dir_all(&run_dir)?;
        record.run_dir = Some(run_dir.display().to_string());

        rootfs::copy_file(&prepared.path, &run_dir.join(ROOTFS_FILE))
            .map_err(|e| SandboxError::Internal(format!("sandbox rootfs copy: {e}")))?;
        record.timings_ms.rootfs_copy_ms = stage.elapsed_ms();

        let lease = match self.network.setup(&spec.sandbox_id, &spec.policy).await {
            Ok(lease) => lease,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&run_dir);
                return Err(e);
            }
        };
        let addressing = lease.addressing.clone();

        let stage = Stage::start();
        let vm = match self.launch(&run_dir, &addressing) {
            Ok(vm) => vm,
            Err(e) => {
                self.network.teardown(lease).await;
                let _ = std::fs::remove_dir_all(&run_dir);
                return Err(e);
            }
        };
        record.timings_ms.vm_start_ms = stage.elapsed_ms();

        let stage = Stage::start();
        let vsock_path = run_dir.join(VSOCK_UDS_FILE);
        if let Err(e) = wait_guest_ready(
            &vsock_path,
            AGENT_VSOCK_PORT,
            spec.ready_timeout,
            vm.exited_rx.clone(),
            vm.wait_error.clone(),
        )
        .await
        {
            tracing::warn!(
                sandbox_id = %spec.sandbox_id,
                error = %e,
                "guest readiness handshake failed"
            );
            kill_pid(vm.pid);
            self.network.teardown(lease).await;
            let _ = std::fs::remove_dir_all(&run_dir);
            return Err(e);
        }
        record.timings_ms.vsock_wait_ms = stage.elapsed_ms();
        record.timings_ms.vm_ready_ms = total.elapsed_ms();
        record.timings_ms.total_ms = total.elapsed_ms();
        record.write_to(&run_dir);

        tracing::info!(
            sandbox_id = %spec.sandbox_id,
            pid = vm.pid,
            guest_ip = %addressing.guest_ip,
            cache_hit = record.cache_hit,
            "firecracker sandbox ready"
        );

        Ok(Box::new(FirecrackerHandle {
            sandbox_id: spec.sandbox_id,
            run_dir,
            vsock_path,
            addressing,
            pid: vm.pid,
            exited_rx: vm.exited_rx,
            wait_error: vm.wait_error,
            network: self.network.clone(),
            lease: Mutex::new(Some(lease)),
            writers: Arc::new(Mutex::new(HashMap::new())),
            shutdown_done: AtomicBool::new(false),
        }))
    }

    async fn doctor(&self) -> DoctorReport {
        let mut checks = Vec::new();
        let probe = |name: &str, ok: bool, detail: String| DoctorCheck {
            name: name.to_string(),
            ok,
            detail,
        };

        let kvm = Path::new("/dev/kvm");
        checks.push(probe(
            "kvm",
            kvm.exists(),
            format!("{} {}", kvm.display(), presence(kvm.exists())),
        ));
        checks.push(probe(
            "firecracker_bin",
            self.config.firecracker_bin.exists(),
            format!(
                "{} {}",
                self.config.firecracker_bin.display(),
                presence(self.config.firecracker_bin.exists())
            ),
        ));
        checks.push(probe(
            "kernel_image",
            self.config.kernel_image.exists(),
            format!(
                "{} {}",
                self.config.kernel_image.display(),
                presence(self.config.kernel_image.exists())
            ),
        ));
        checks.push(probe(
            "guest_agent",
            self.config.guest_agent_binary.exists(),
            format!(
                "{} {}",
                self.config.guest_agent_binary.display(),
                presence(self.config.guest_agent_binary.exists())
            ),
        ));
        let state_ok = std::fs::create_dir_all(&self.config.state_dir).is_ok();
        checks.push(probe(
            "state_dir",
            state_ok,
            format!(
                "{} {}",
                self.config.state_dir.display(),
                if state_ok { "writable" } else { "not writable" }
            ),
        ));

        DoctorReport {
            backend: BACKEND_NAME.into(),
            checks,
        }
    }
}

fn presence(exists: bool) -> &'static str {
    if exists { "present" } else { "missing" }
}

impl FirecrackerBackend {
    /// Write the VM config and spawn the firecracker process with its
    /// stdio captured to log files.
    fn launch(
        &self,
        run_dir: &Path,
        addressing: &SandboxAddressing,
    ) -> Result<SpawnedVm, SandboxError> {
        let config = vm_config::compose(
            run_dir,
            addressing,
            &self.config.kernel_image,
            self.config.dns_server.as_str(),
            AGENT_VSOCK_PORT,
            self.config.vcpu_count,
            self.config.mem_size_mib,
        );
        vm_config::write(run_dir, &config)?;

        let stdout = std::fs::File::create(run_dir.join(VM_STDOUT_FILE))?;
        let stderr = std::fs::File::create(run_dir.join(VM_STDERR_FILE))?;

        let child = tokio::process::Command::new(&self.config.firecracker_bin)
            .arg("--api-sock")
            .arg(run_dir.join(API_SOCK_FILE))
            .arg("--config-file")
            .arg(run_dir.join(VM_CONFIG_FILE))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| SandboxError::Internal(format!("spawn firecracker: {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| SandboxError::Internal("firecracker spawned without a pid".into()))?;

        let (exited_tx, exited_rx) = watch::channel(false);
        let wait_error: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));
        let wait_error_task = wait_error.clone();
        tokio::spawn(async move {
            let mut child = child;
            match child.wait().await {
                Ok(status) if !status.success() => {
                    *wait_error_task.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some(format!("vm process exited: {status}"));
                }
                Err(e) => {
                    *wait_error_task.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some(format!("vm process wait: {e}"));
                }
                Ok(_) => {}
            }
            let _ = exited_tx.send(true);
        });

        Ok(SpawnedVm {
            pid,
            exited_rx,
            wait_error,
        })
    }
}

struct SpawnedVm {
    pid: u32,
    exited_rx: watch::Receiver<bool>,
    wait_error: Arc<StdMutex<Option<String>>>,
}

fn kill_pid(pid: u32) {
    if pid == 0 {
        return;
    }
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

/// Retry the agent dial until one of: dial success, VM exit, deadline.
async fn wait_guest_ready(
    vsock_path: &Path,
    port: u32,
    timeout: Duration,
    mut exited_rx: watch::Receiver<bool>,
    wait_error: Arc<StdMutex<Option<String>>>,
) -> Result<(), SandboxError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if *exited_rx.borrow() {
            let detail = wait_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .unwrap_or_else(|| "clean exit".into());
            return Err(SandboxError::Internal(format!(
                "vm_exited_before_ready: {detail}"
            )));
        }

        if let Ok(stream) = vsock::dial(vsock_path, port).await {
            drop(stream);
            return Ok(());
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(SandboxError::DeadlineExceeded);
        }
        let next_attempt = std::cmp::min(deadline, now + DIAL_RETRY_INTERVAL);
        tokio::select! {
            _ = tokio::time::sleep_until(next_attempt) => {}
            _ = exited_rx.changed() => {}
        }
    }
}

// ── Handle ──────────────────────────────────────────────────────────

type WriterMap = Arc<Mutex<HashMap<String, OwnedWriteHalf>>>;

pub struct FirecrackerHandle {
    sandbox_id: SandboxId,
    run_dir: PathBuf,
    vsock_path: PathBuf,
    addressing: SandboxAddressing,
    pid: u32,
    exited_rx: watch::Receiver<bool>,
    wait_error: Arc<StdMutex<Option<String>>>,
    network: Arc<NetworkFabric>,
    lease: Mutex<Option<NetworkLease>>,
    /// Write halves of live exec channels, keyed by execution id, for
    /// stdin/resize/signal control frames.
    writers: WriterMap,
    shutdown_done: AtomicBool,
}

#[async_trait]
impl VmHandle for FirecrackerHandle {
    fn addressing(&self) -> Option<&SandboxAddressing> {
        Some(&self.addressing)
    }

    async fn open_exec(
        &self,
        exec_id: &str,
        req: ExecRequest,
    ) -> Result<Box<dyn GuestStream>, SandboxError> {
        let stream = vsock::dial(&self.vsock_path, AGENT_VSOCK_PORT).await?;
        let (read_half, mut write_half) = stream.into_split();
        write_exec_request(&mut write_half, &req).await?;
        self.writers
            .lock()
            .await
            .insert(exec_id.to_string(), write_half);

        tracing::debug!(
            sandbox_id = %self.sandbox_id,
            exec_id = %exec_id,
            command = ?req.command,
            "guest execution started"
        );

        let mut record = RunRecord::new(exec_id, BACKEND_NAME, "exec");
        record.run_dir = Some(self.run_dir.display().to_string());

        Ok(Box::new(FcGuestStream {
            reader: FrameReader::new(read_half),
            exec_id: exec_id.to_string(),
            writers: self.writers.clone(),
            record,
            run_dir: self.run_dir.clone(),
            started: std::time::Instant::now(),
        }))
    }

    async fn write_stdin(&self, exec_id: &str, data: &[u8]) -> Result<(), SandboxError> {
        let mut writers = self.writers.lock().await;
        let writer = writers
            .get_mut(exec_id)
            .ok_or_else(|| SandboxError::NotFound(format!("no live channel for {exec_id}")))?;
        write_host_frame(
            writer,
            &HostFrame::Stdin {
                data: data.to_vec(),
            },
        )
        .await
    }

    async fn resize_tty(&self, exec_id: &str, cols: u16, rows: u16) -> Result<(), SandboxError> {
        let mut writers = self.writers.lock().await;
        let writer = writers
            .get_mut(exec_id)
            .ok_or_else(|| SandboxError::NotFound(format!("no live channel for {exec_id}")))?;
        write_host_frame(writer, &HostFrame::Resize { cols, rows }).await
    }

    async fn signal(&self, exec_id: &str, signal: i32) -> Result<(), SandboxError> {
        let mut writers = self.writers.lock().await;
        match writers.get_mut(exec_id) {
            Some(writer) => write_host_frame(writer, &HostFrame::Signal { signal }).await,
            // Channel already gone: the read loop is necessarily
            // interrupted, which is the guarantee that matters.
            None => Ok(()),
        }
    }

    async fn download_file(&self, path: &str, max_bytes: u64) -> Result<Vec<u8>, SandboxError> {
        if !path.starts_with('/') {
            return Err(SandboxError::InvalidArgument(format!(
                "path {path:?} must be absolute"
            )));
        }

        // Bounded read in the guest: ask for one byte past the limit so
        // an oversized file is detectable.
        let req = ExecRequest {
            command: vec![
                "head".into(),
                "-c".into(),
                (max_bytes + 1).to_string(),
                path.into(),
            ],
            env: vec![],
            dir: None,
            entropy_seed: entropy_seed(),
            workspace_tar_gz: None,
            workspace_access: WorkspaceAccess::Ro,
        };
        let exec_id = format!("dl_{}", uuid::Uuid::new_v4().simple());
        let mut stream = self.open_exec(&exec_id, req).await?;

        let mut bytes = Vec::new();
        let mut stderr = Vec::new();
        let mut exit: Option<(i32, Option<String>)> = None;
        while let Some(frame) = stream.next().await? {
            match frame {
                GuestFrame::Stdout(data) => bytes.extend_from_slice(&data),
                GuestFrame::Stderr(data) => stderr.extend_from_slice(&data),
                GuestFrame::Exit { exit_code, error } => exit = Some((exit_code, error)),
            }
        }

        match exit {
            Some((0, _)) => {
                if bytes.len() as u64 > max_bytes {
                    Err(SandboxError::InvalidArgument(format!(
                        "file {path:?} exceeds max_bytes={max_bytes}"
                    )))
                } else {
                    Ok(bytes)
                }
            }
            Some((code, error)) => Err(SandboxError::NotFound(format!(
                "read {path:?} in guest failed (code {code}): {}",
                error.unwrap_or_else(|| String::from_utf8_lossy(&stderr).trim().to_string())
            ))),
            None => Err(SandboxError::Internal(format!(
                "guest closed the channel reading {path:?} without an exit"
            ))),
        }
    }

    fn exited(&self) -> watch::Receiver<bool> {
        self.exited_rx.clone()
    }

    async fn shutdown(&self) -> Result<(), SandboxError> {
        if self.shutdown_done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(sandbox_id = %self.sandbox_id, pid = self.pid, "shutting down sandbox VM");

        kill_pid(self.pid);
        let mut exited = self.exited_rx.clone();
        let reaped = tokio::time::timeout(REAP_TIMEOUT, async {
            while !*exited.borrow() {
                if exited.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok();
        if !reaped {
            tracing::warn!(
                sandbox_id = %self.sandbox_id,
                pid = self.pid,
                "vm process not reaped within {}s",
                REAP_TIMEOUT.as_secs()
            );
        }

        self.writers.lock().await.clear();

        if let Some(lease) = self.lease.lock().await.take() {
            self.network.teardown(lease).await;
        }

        if self.run_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.run_dir) {
                tracing::warn!(
                    run_dir = %self.run_dir.display(),
                    error = %e,
                    "run directory not removed"
                );
            }
        }
        if let Some(detail) = self
            .wait_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            tracing::debug!(sandbox_id = %self.sandbox_id, detail = %detail, "vm wait result");
        }
        Ok(())
    }
}

struct FcGuestStream {
    reader: FrameReader<tokio::net::unix::OwnedReadHalf>,
    exec_id: String,
    writers: WriterMap,
    record: RunRecord,
    run_dir: PathBuf,
    started: std::time::Instant,
}

#[async_trait]
impl GuestStream for FcGuestStream {
    async fn next(&mut self) -> Result<Option<GuestFrame>, SandboxError> {
        let frame = self.reader.next().await;
        if let Ok(Some(GuestFrame::Exit { exit_code, error })) = &frame {
            self.record.exit_code = Some(*exit_code);
            self.record.guest_error = error.clone();
        }
        frame
    }
}

impl Drop for FcGuestStream {
    fn drop(&mut self) {
        // Dropping the read half is what closes the channel; the write
        // half is released from the control map asynchronously.
        let writers = self.writers.clone();
        let exec_id = self.exec_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                writers.lock().await.remove(&exec_id);
            });
        }

        let elapsed = self.started.elapsed().as_millis() as u64;
        self.record.timings_ms.guest_exec_ms = elapsed;
        self.record.timings_ms.total_ms = elapsed;
        if self.run_dir.exists() {
            self.record.write_to(&self.run_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::protocol::encode_guest_frame;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    fn test_handle(dir: &Path, vsock_path: PathBuf) -> FirecrackerHandle {
        let (_tx, exited_rx) = watch::channel(false);
        let runner = Arc::new(NullRunner);
        let resolver = Arc::new(NullResolver);
        FirecrackerHandle {
            sandbox_id: "sbx_test".into(),
            run_dir: dir.to_path_buf(),
            vsock_path,
            addressing: net::derive_addressing("sbx_test"),
            pid: 0,
            exited_rx,
            wait_error: Arc::new(StdMutex::new(None)),
            network: Arc::new(NetworkFabric::new(runner, resolver, "1.1.1.1".into())),
            lease: Mutex::new(None),
            writers: Arc::new(Mutex::new(HashMap::new())),
            shutdown_done: AtomicBool::new(false),
        }
    }

    struct NullRunner;

    #[async_trait]
    impl PrivilegedRunner for NullRunner {
        async fn run(
            &self,
            _argv: &[String],
        ) -> Result<host_cmd::CommandOutput, SandboxError> {
            Ok(host_cmd::CommandOutput {
                exit_code: Some(0),
                stdout: vec![],
                stderr: vec![],
            })
        }
    }

    struct NullResolver;

    #[async_trait]
    impl HostResolver for NullResolver {
        async fn resolve_ipv4(
            &self,
            _host: &str,
        ) -> Result<Vec<std::net::Ipv4Addr>, SandboxError> {
            Ok(vec![std::net::Ipv4Addr::new(127, 0, 0, 1)])
        }
    }

    /// Fake guest agent behind a vsock uds: completes the CONNECT
    /// handshake, reads the exec request frame, replies with frames.
    async fn fake_agent(listener: UnixListener, frames: Vec<GuestFrame>) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("CONNECT "));
        let mut stream = reader.into_inner();
        stream.write_all(b"OK 1024\n").await.unwrap();

        // Exec request frame: tag + 4-byte length + payload.
        let mut header = [0u8; 5];
        stream.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 1);
        let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        let req: ExecRequest = serde_json::from_slice(&payload).unwrap();
        assert!(!req.command.is_empty());

        for frame in frames {
            stream.write_all(&encode_guest_frame(&frame)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn open_exec_streams_guest_frames() {
        let dir = tempfile::tempdir().unwrap();
        let vsock_path = dir.path().join(VSOCK_UDS_FILE);
        let listener = UnixListener::bind(&vsock_path).unwrap();
        let server = tokio::spawn(fake_agent(
            listener,
            vec![
                GuestFrame::Stdout(b"hello from cleanroom\n".to_vec()),
                GuestFrame::Exit {
                    exit_code: 0,
                    error: None,
                },
            ],
        ));

        let handle = test_handle(dir.path(), vsock_path);
        let req = ExecRequest {
            command: vec!["echo".into(), "hello".into()],
            env: vec![],
            dir: None,
            entropy_seed: entropy_seed(),
            workspace_tar_gz: None,
            workspace_access: WorkspaceAccess::Rw,
        };
        let mut stream = handle.open_exec("exec_1", req).await.unwrap();

        assert_eq!(
            stream.next().await.unwrap(),
            Some(GuestFrame::Stdout(b"hello from cleanroom\n".to_vec()))
        );
        assert!(matches!(
            stream.next().await.unwrap(),
            Some(GuestFrame::Exit { exit_code: 0, .. })
        ));
        assert_eq!(stream.next().await.unwrap(), None);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn download_file_enforces_max_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let vsock_path = dir.path().join(VSOCK_UDS_FILE);
        let listener = UnixListener::bind(&vsock_path).unwrap();
        // Ten bytes back against a five byte limit.
        let server = tokio::spawn(fake_agent(
            listener,
            vec![
                GuestFrame::Stdout(b"0123456789".to_vec()),
                GuestFrame::Exit {
                    exit_code: 0,
                    error: None,
                },
            ],
        ));

        let handle = test_handle(dir.path(), vsock_path);
        let err = handle
            .download_file("/artifacts/haiku.txt", 5)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds max_bytes"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn download_file_within_bounds_returns_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let vsock_path = dir.path().join(VSOCK_UDS_FILE);
        let listener = UnixListener::bind(&vsock_path).unwrap();
        let server = tokio::spawn(fake_agent(
            listener,
            vec![
                GuestFrame::Stdout(b"haiku".to_vec()),
                GuestFrame::Exit {
                    exit_code: 0,
                    error: None,
                },
            ],
        ));

        let handle = test_handle(dir.path(), vsock_path);
        let bytes = handle
            .download_file("/artifacts/haiku.txt", 64)
            .await
            .unwrap();
        assert_eq!(bytes, b"haiku");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn download_file_refuses_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let handle = test_handle(dir.path(), dir.path().join(VSOCK_UDS_FILE));
        let err = handle
            .download_file("artifacts/haiku.txt", 64)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn ready_wait_reports_vm_exit_distinctly() {
        let dir = tempfile::tempdir().unwrap();
        let vsock_path = dir.path().join(VSOCK_UDS_FILE);
        let (exited_tx, exited_rx) = watch::channel(false);
        let wait_error = Arc::new(StdMutex::new(Some("vm process exited: signal 9".to_string())));

        let waiter = tokio::spawn(async move {
            // No socket ever appears at this path.
            wait_guest_ready(
                &vsock_path,
                AGENT_VSOCK_PORT,
                Duration::from_secs(5),
                exited_rx,
                wait_error,
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        exited_tx.send(true).unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("vm_exited_before_ready"));
        assert!(err.to_string().contains("signal 9"));
    }

    #[tokio::test]
    async fn ready_wait_times_out_with_deadline_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let vsock_path = dir.path().join(VSOCK_UDS_FILE);
        let (_tx, exited_rx) = watch::channel(false);

        let started = std::time::Instant::now();
        let err = wait_guest_ready(
            &vsock_path,
            AGENT_VSOCK_PORT,
            Duration::from_millis(200),
            exited_rx,
            Arc::new(StdMutex::new(None)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SandboxError::DeadlineExceeded));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn ready_wait_succeeds_when_agent_appears() {
        let dir = tempfile::tempdir().unwrap();
        let vsock_path = dir.path().join(VSOCK_UDS_FILE);
        let (_tx, exited_rx) = watch::channel(false);

        let listener_path = vsock_path.clone();
        let server = tokio::spawn(async move {
            // Agent comes up after a few failed dials.
            tokio::time::sleep(Duration::from_millis(300)).await;
            let listener = UnixListener::bind(&listener_path).unwrap();
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let mut stream = reader.into_inner();
            stream.write_all(b"OK 1024\n").await.unwrap();
        });

        wait_guest_ready(
            &vsock_path,
            AGENT_VSOCK_PORT,
            Duration::from_secs(5),
            exited_rx,
            Arc::new(StdMutex::new(None)),
        )
        .await
        .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_removes_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("sbx_test");
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(run_dir.join("vm-stdout.log"), b"").unwrap();

        let handle = test_handle(&run_dir, run_dir.join(VSOCK_UDS_FILE));
        handle.shutdown().await.unwrap();
        assert!(!run_dir.exists());
        // Second shutdown is a no-op.
        handle.shutdown().await.unwrap();
    }
}
