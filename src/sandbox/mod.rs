pub mod backend;
pub mod error;
pub mod execution;
pub mod fanout;
pub mod registry;
pub mod types;

// Backend implementations
pub mod firecracker;

pub use backend::{
    BackendCapabilities, DoctorCheck, DoctorReport, GuestStream, ProvisionSpec, SandboxBackend,
    VmHandle,
};
pub use error::{ErrorCode, SandboxError};
pub use execution::Execution;
pub use fanout::{EventFanout, Subscription};
pub use registry::{SandboxEntry, SandboxRegistry};
pub use types::*;

use std::sync::Arc;

use firecracker::host_cmd::{HostRunner, PrivilegeMode};
use firecracker::net::SystemResolver;
use firecracker::rootfs::LocalImageStore;
use firecracker::{FirecrackerBackend, FirecrackerConfig};

/// Build the registry with the configured backends.
pub fn build_registry(config: &crate::config::Config) -> Arc<SandboxRegistry> {
    let runner = Arc::new(HostRunner::new(match &config.helper_path {
        Some(path) => {
            tracing::info!(helper = %path.display(), "privileged commands via root helper");
            PrivilegeMode::Helper {
                helper_path: path.clone(),
            }
        }
        None => PrivilegeMode::Sudo,
    }));

    let fc = FirecrackerBackend::new(
        FirecrackerConfig {
            state_dir: config.state_dir.clone(),
            cache_dir: config.cache_dir.clone(),
            kernel_image: config.kernel_image.clone(),
            firecracker_bin: config.firecracker_bin.clone(),
            guest_agent_binary: config.guest_agent_binary.clone(),
            vcpu_count: config.vcpu_count,
            mem_size_mib: config.mem_size_mib,
            dns_server: config.dns_server.clone(),
        },
        Arc::new(LocalImageStore::new(config.image_dir.clone())),
        runner,
        Arc::new(SystemResolver),
    );

    tracing::info!(
        state_dir = %config.state_dir.display(),
        cache_dir = %config.cache_dir.display(),
        "initializing firecracker sandbox backend"
    );
    Arc::new(SandboxRegistry::new(
        vec![Arc::new(fc) as Arc<dyn SandboxBackend>],
        "firecracker",
    ))
}
