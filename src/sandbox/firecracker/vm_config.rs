//! Firecracker VM configuration file.
//!
//! The VM is configured entirely through `--config-file`; nothing is
//! PUT to the API socket after boot. Field and section names follow the
//! Firecracker config schema.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::sandbox::error::SandboxError;
use crate::sandbox::types::SandboxAddressing;

pub const VM_CONFIG_FILE: &str = "vm-config.json";
pub const VSOCK_UDS_FILE: &str = "vsock.sock";
pub const API_SOCK_FILE: &str = "firecracker.sock";
pub const ROOTFS_FILE: &str = "rootfs.ext4";
pub const VM_STDOUT_FILE: &str = "vm-stdout.log";
pub const VM_STDERR_FILE: &str = "vm-stderr.log";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfigFile {
    #[serde(rename = "boot-source")]
    pub boot_source: BootSource,
    pub drives: Vec<Drive>,
    #[serde(rename = "machine-config")]
    pub machine_config: MachineConfig,
    #[serde(rename = "network-interfaces")]
    pub network_interfaces: Vec<NetworkInterface>,
    pub vsock: VsockDevice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootSource {
    pub kernel_image_path: String,
    pub boot_args: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    pub smt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub guest_mac: String,
    pub host_dev_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VsockDevice {
    pub guest_cid: u32,
    pub uds_path: String,
}

/// Kernel cmdline handed to every sandbox VM. The `cleanroom_guest_*`
/// keys are read back by the guest init script.
pub fn boot_args(addressing: &SandboxAddressing, dns_server: &str, agent_port: u32) -> String {
    format!(
        "console=ttyS0 reboot=k panic=1 pci=off init=/sbin/cleanroom-init random.trust_cpu=on \
cleanroom_guest_ip={ip} cleanroom_guest_gw={gw} cleanroom_guest_mask=24 \
cleanroom_guest_dns={dns} cleanroom_guest_port={port}",
        ip = addressing.guest_ip,
        gw = addressing.host_ip,
        dns = dns_server,
        port = agent_port,
    )
}

/// Compose the config for one sandbox VM rooted at `run_dir`.
pub fn compose(
    run_dir: &Path,
    addressing: &SandboxAddressing,
    kernel_image: &Path,
    dns_server: &str,
    agent_port: u32,
    vcpu_count: u8,
    mem_size_mib: u32,
) -> VmConfigFile {
    VmConfigFile {
        boot_source: BootSource {
            kernel_image_path: kernel_image.to_string_lossy().to_string(),
            boot_args: boot_args(addressing, dns_server, agent_port),
        },
        drives: vec![Drive {
            drive_id: "rootfs".into(),
            path_on_host: run_dir.join(ROOTFS_FILE).to_string_lossy().to_string(),
            is_root_device: true,
            is_read_only: false,
        }],
        machine_config: MachineConfig {
            vcpu_count,
            mem_size_mib,
            smt: false,
        },
        network_interfaces: vec![NetworkInterface {
            iface_id: "eth0".into(),
            guest_mac: addressing.guest_mac.clone(),
            host_dev_name: addressing.tap_name.clone(),
        }],
        vsock: VsockDevice {
            guest_cid: addressing.guest_cid,
            uds_path: run_dir.join(VSOCK_UDS_FILE).to_string_lossy().to_string(),
        },
    }
}

/// Write the config JSON into the run directory.
pub fn write(run_dir: &Path, config: &VmConfigFile) -> Result<std::path::PathBuf, SandboxError> {
    let path = run_dir.join(VM_CONFIG_FILE);
    let bytes = serde_json::to_vec_pretty(config)
        .map_err(|e| SandboxError::Internal(format!("encode vm config: {e}")))?;
    std::fs::write(&path, bytes)?;
    Ok(path)
}
