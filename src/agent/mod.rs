//! Guest-agent wire protocol.
//!
//! A fresh byte-stream channel (vsock-style) is opened per execution. The
//! host writes one framed exec request, optionally followed by control
//! frames (stdin, resize, signal). The guest answers with a stream of
//! stdout/stderr frames terminated by a single exit frame.

pub mod protocol;

pub use protocol::{
    AGENT_VSOCK_PORT, ExecRequest, FrameReader, GuestFrame, HostFrame, LegacyResponse,
    WorkspaceAccess, write_exec_request, write_host_frame,
};

/// Fresh entropy bytes for the guest's rng seeding. Exhausting the OS
/// entropy source is not a recoverable condition; an empty seed lets
/// the guest fall back to its own timer mixing.
pub fn entropy_seed() -> Vec<u8> {
    let mut seed = vec![0u8; 32];
    match getrandom::fill(&mut seed) {
        Ok(()) => seed,
        Err(e) => {
            tracing::warn!(error = %e, "entropy seed unavailable");
            Vec::new()
        }
    }
}
