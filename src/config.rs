use std::path::PathBuf;

use crate::sandbox::firecracker::host_cmd::DEFAULT_HELPER_PATH;

/// Control-plane configuration, read from the environment. Every knob
/// has a default so `cleanroom serve` works on a prepared host with no
/// configuration at all.
#[derive(Debug, Clone)]
pub struct Config {
    /// Endpoint the server listens on: `unix:///path` or `http://host:port`.
    pub listen: String,
    pub state_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// Pre-unpacked base rootfs images, `<digest>.ext4`.
    pub image_dir: PathBuf,
    pub kernel_image: PathBuf,
    pub firecracker_bin: PathBuf,
    pub guest_agent_binary: PathBuf,
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    /// Resolver the guests are pointed at (also the DNS accept rules).
    pub dns_server: String,
    /// `Some(path)` selects helper mode for privileged commands;
    /// `None` means `sudo -n`.
    pub helper_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        let base = std::env::var("CLEANROOM_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".cleanroom")
            });

        let helper_path = match std::env::var("CLEANROOM_PRIVILEGE_MODE").as_deref() {
            Ok("helper") => Some(
                std::env::var("CLEANROOM_HELPER_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from(DEFAULT_HELPER_PATH)),
            ),
            _ => None,
        };

        Self {
            listen: std::env::var("CLEANROOM_LISTEN")
                .unwrap_or_else(|_| format!("unix://{}", base.join("cleanroom.sock").display())),
            state_dir: env_path("CLEANROOM_STATE_DIR", || base.join("state")),
            cache_dir: env_path("CLEANROOM_CACHE_DIR", || base.join("cache")),
            image_dir: env_path("CLEANROOM_IMAGE_DIR", || base.join("images")),
            kernel_image: env_path("CLEANROOM_KERNEL_IMAGE", || base.join("vmlinux")),
            firecracker_bin: env_path("CLEANROOM_FIRECRACKER_BIN", || {
                PathBuf::from("/usr/local/bin/firecracker")
            }),
            guest_agent_binary: env_path("CLEANROOM_GUEST_AGENT", || {
                base.join("cleanroom-guest-agent")
            }),
            vcpu_count: env_parse("CLEANROOM_VCPU", 1),
            mem_size_mib: env_parse("CLEANROOM_MEMORY_MIB", 256),
            dns_server: std::env::var("CLEANROOM_DNS").unwrap_or_else(|_| "8.8.8.8".into()),
            helper_path,
        }
    }
}

fn env_path(var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| default())
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
