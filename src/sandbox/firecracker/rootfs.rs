//! Base and runtime root filesystems.
//!
//! Stage A (OCI image → base rootfs) lives behind [`ImageStore`]; the
//! pull/unpack machinery is a separate collaborator. Stage B copies the
//! base, loop-mounts the copy, injects the guest agent and the init
//! script, and caches the result under a content-addressed key so every
//! sandbox with the same inputs reuses one prepared file.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::host_cmd::PrivilegedRunner;
use crate::sandbox::error::SandboxError;

/// Where the guest agent binary lands inside the runtime rootfs.
pub const GUEST_AGENT_PATH: &str = "/usr/local/bin/cleanroom-guest-agent";

/// Where the init script lands inside the runtime rootfs.
pub const GUEST_INIT_PATH: &str = "/sbin/cleanroom-init";

/// Bumped whenever the init script template changes semantics in a way
/// its bytes alone would not capture.
pub const INIT_SCRIPT_VERSION: u32 = 1;

/// Guest init template, installed bit-identically. Reads the
/// `cleanroom_guest_*` keys the host placed on the kernel cmdline,
/// configures eth0, and execs the agent.
pub const INIT_SCRIPT: &str = r#"#!/bin/sh
set -eu

mount -t proc proc /proc 2>/dev/null || true
mount -t sysfs sys /sys 2>/dev/null || true
mount -t devtmpfs dev /dev 2>/dev/null || true

ip=""
gw=""
mask="24"
dns=""
port=""
for word in $(cat /proc/cmdline); do
    case "$word" in
        cleanroom_guest_ip=*)   ip="${word#cleanroom_guest_ip=}" ;;
        cleanroom_guest_gw=*)   gw="${word#cleanroom_guest_gw=}" ;;
        cleanroom_guest_mask=*) mask="${word#cleanroom_guest_mask=}" ;;
        cleanroom_guest_dns=*)  dns="${word#cleanroom_guest_dns=}" ;;
        cleanroom_guest_port=*) port="${word#cleanroom_guest_port=}" ;;
    esac
done

if [ -n "$ip" ]; then
    ip addr add "$ip/$mask" dev eth0
    ip link set eth0 up
    ip route add default via "$gw" dev eth0
    echo "nameserver $dns" > /etc/resolv.conf
fi

exec /usr/local/bin/cleanroom-guest-agent --vsock-port "$port"
"#;

/// Stage A collaborator: image reference → unpacked base rootfs.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Resolve an image reference to its digest and the path of an
    /// unpacked base rootfs for it.
    async fn base_rootfs(&self, image_ref: &str) -> Result<(String, PathBuf), SandboxError>;
}

/// Directory-backed store for deployments with pre-baked images:
/// `<dir>/<digest>.ext4`, keyed by the digest in the image reference.
pub struct LocalImageStore {
    dir: PathBuf,
}

impl LocalImageStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn base_rootfs(&self, image_ref: &str) -> Result<(String, PathBuf), SandboxError> {
        let digest = crate::policy::image_ref_digest(image_ref).ok_or_else(|| {
            SandboxError::InvalidArgument(format!("image ref {image_ref:?} carries no digest"))
        })?;
        let path = self.dir.join(format!("{digest}.ext4"));
        if !path.exists() {
            return Err(SandboxError::NotFound(format!(
                "base rootfs for digest {digest} not present at {}",
                path.display()
            )));
        }
        Ok((digest, path))
    }
}

/// A prepared runtime rootfs in the cache.
#[derive(Debug, Clone)]
pub struct PreparedRootfs {
    pub path: PathBuf,
    pub cache_hit: bool,
}

/// Stage B: prepares and caches runtime root filesystems.
pub struct RootfsPrep {
    cache_dir: PathBuf,
    runner: Arc<dyn PrivilegedRunner>,
    agent_binary: PathBuf,
    /// Held only around the existence-check + rename window.
    prep_lock: Mutex<()>,
}

impl RootfsPrep {
    pub fn new(cache_dir: PathBuf, runner: Arc<dyn PrivilegedRunner>, agent_binary: PathBuf) -> Self {
        Self {
            cache_dir,
            runner,
            agent_binary,
            prep_lock: Mutex::new(()),
        }
    }

    fn runtime_dir(&self) -> PathBuf {
        self.cache_dir.join("firecracker").join("runtime-rootfs")
    }

    /// Prepare (or reuse) the runtime rootfs for the given base image.
    pub async fn prepare(
        &self,
        image_digest: &str,
        base_rootfs: &Path,
    ) -> Result<PreparedRootfs, SandboxError> {
        let agent_bytes = std::fs::read(&self.agent_binary).map_err(|e| {
            SandboxError::Internal(format!(
                "read guest agent {}: {e}",
                self.agent_binary.display()
            ))
        })?;
        let agent_hash = hex::encode(Sha256::digest(&agent_bytes));
        let key = cache_key(image_digest, &agent_hash);

        let final_path = self.runtime_dir().join(format!("{key}.ext4"));
        if final_path.exists() {
            return Ok(PreparedRootfs {
                path: final_path,
                cache_hit: true,
            });
        }

        let _guard = self.prep_lock.lock().await;
        // A concurrent prepare may have completed while we waited.
        if final_path.exists() {
            return Ok(PreparedRootfs {
                path: final_path,
                cache_hit: true,
            });
        }

        std::fs::create_dir_all(self.runtime_dir())?;
        let tmp_path = self
            .runtime_dir()
            .join(format!("{key}.ext4.tmp-{}", nanos_now()));

        let result = self.build_into(base_rootfs, &tmp_path).await;
        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }

        // Another process may have won the race after our build: the
        // loser discards its tmp file and reuses the winner's output.
        if final_path.exists() {
            let _ = std::fs::remove_file(&tmp_path);
            return Ok(PreparedRootfs {
                path: final_path,
                cache_hit: true,
            });
        }
        std::fs::rename(&tmp_path, &final_path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            SandboxError::Internal(format!("publish runtime rootfs: {e}"))
        })?;

        tracing::info!(
            key = %key,
            path = %final_path.display(),
            "runtime rootfs prepared"
        );
        Ok(PreparedRootfs {
            path: final_path,
            cache_hit: false,
        })
    }

    /// Copy the base image, loop-mount the copy, and inject the agent
    /// binary and init script.
    async fn build_into(&self, base_rootfs: &Path, tmp_path: &Path) -> Result<(), SandboxError> {
        copy_file(base_rootfs, tmp_path)
            .map_err(|e| SandboxError::Internal(format!("copy base rootfs: {e}")))?;

        let mount_dir = self.runtime_dir().join(format!("mnt-{}", nanos_now()));
        std::fs::create_dir_all(&mount_dir)?;
        let init_src = self.runtime_dir().join(format!("init-{}.sh", nanos_now()));
        std::fs::write(&init_src, INIT_SCRIPT)?;

        let mount_result = self
            .inject(tmp_path, &mount_dir, &init_src)
            .await;

        let _ = std::fs::remove_file(&init_src);
        let _ = std::fs::remove_dir(&mount_dir);
        mount_result?;

        // The loop mount wrote through the kernel; flush before rename.
        File::open(tmp_path)?.sync_all()?;
        Ok(())
    }

    async fn inject(
        &self,
        image: &Path,
        mount_dir: &Path,
        init_src: &Path,
    ) -> Result<(), SandboxError> {
        let image_s = image.to_string_lossy().to_string();
        let mount_s = mount_dir.to_string_lossy().to_string();
        let init_s = init_src.to_string_lossy().to_string();
        let agent_s = self.agent_binary.to_string_lossy().to_string();

        let run = |args: Vec<String>| {
            let runner = self.runner.clone();
            async move { runner.run(&args).await }
        };

        run(vec![
            "mount".into(),
            "-o".into(),
            "loop".into(),
            image_s.clone(),
            mount_s.clone(),
        ])
        .await?
        .check("loop mount")?;

        let inject_result: Result<(), SandboxError> = async {
            run(vec![
                "mkdir".into(),
                "-p".into(),
                format!("{mount_s}/usr/local/bin"),
                format!("{mount_s}/sbin"),
            ])
            .await?
            .check("rootfs directories")?;

            run(vec![
                "install".into(),
                "-m".into(),
                "0755".into(),
                agent_s,
                format!("{mount_s}{GUEST_AGENT_PATH}"),
            ])
            .await?
            .check("install guest agent")?;

            run(vec![
                "install".into(),
                "-m".into(),
                "0755".into(),
                init_s,
                format!("{mount_s}{GUEST_INIT_PATH}"),
            ])
            .await?
            .check("install init script")?;
            Ok(())
        }
        .await;

        // Unmount regardless of how injection went.
        let umount = run(vec!["umount".into(), mount_s.clone()]).await;
        inject_result?;
        umount?.check("unmount runtime rootfs")?;
        Ok(())
    }
}

/// Content key over everything that shapes the prepared file.
pub fn cache_key(image_digest: &str, agent_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("image:{image_digest}\n"));
    hasher.update(format!("agent:{agent_hash}\n"));
    hasher.update(format!("init:v{INIT_SCRIPT_VERSION}\n"));
    hasher.update(INIT_SCRIPT.as_bytes());
    hex::encode(hasher.finalize())
}

fn nanos_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

const FICLONE: libc::c_ulong = 0x4004_9409;

/// Copy `src` to `dst`, preferring a reflink clone where the filesystem
/// supports one. The destination is truncated first, inherits the
/// source's permission bits, and is fsynced before return.
pub fn copy_file(src: &Path, dst: &Path) -> io::Result<()> {
    let src_file = File::open(src)?;
    let meta = src_file.metadata()?;
    let dst_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dst)?;

    let cloned = unsafe {
        libc::ioctl(
            dst_file.as_raw_fd(),
            FICLONE as _,
            src_file.as_raw_fd(),
        )
    } == 0;
    if !cloned {
        let mut reader = io::BufReader::new(&src_file);
        let mut writer = io::BufWriter::new(&dst_file);
        io::copy(&mut reader, &mut writer)?;
        io::Write::flush(&mut writer)?;
    }

    dst_file.set_permissions(meta.permissions())?;
    dst_file.sync_all()?;
    Ok(())
}
