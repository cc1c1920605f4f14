//! Privileged host command execution.
//!
//! Network and rootfs setup need root for a handful of well-known
//! binaries. Two modes: `sudo -n` (developer hosts) or a root-setuid
//! helper binary that accepts a restricted argv set (production hosts).
//! Argv is always passed as a vector; nothing is ever interpolated into
//! a shell string.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;

use crate::sandbox::error::SandboxError;

/// Default install path for the setuid helper.
pub const DEFAULT_HELPER_PATH: &str = "/usr/local/sbin/cleanroom-root-helper";

/// Commands the helper will execute. Everything else is refused before
/// the helper is even spawned. `sysctl` is included for the IPv4
/// forwarding knob.
const HELPER_ALLOWED: &[&str] = &[
    "iptables", "ip", "mount", "umount", "install", "mkdir", "sysctl",
];

/// Result of one privileged command.
#[derive(Debug)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn check(&self, what: &str) -> Result<(), SandboxError> {
        if self.success() {
            Ok(())
        } else {
            Err(SandboxError::Internal(format!(
                "{what} failed: code={:?}, stderr={}",
                self.exit_code,
                String::from_utf8_lossy(&self.stderr).trim()
            )))
        }
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Seam for privileged execution so tests can record instead of run.
#[async_trait]
pub trait PrivilegedRunner: Send + Sync {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput, SandboxError>;
}

/// How privileged commands reach root.
#[derive(Debug, Clone)]
pub enum PrivilegeMode {
    /// Prefix with `sudo -n` (fails rather than prompting).
    Sudo,
    /// Invoke a root-setuid helper with the target argv.
    Helper { helper_path: PathBuf },
}

impl PrivilegeMode {
    pub fn helper_default() -> Self {
        PrivilegeMode::Helper {
            helper_path: PathBuf::from(DEFAULT_HELPER_PATH),
        }
    }
}

pub struct HostRunner {
    mode: PrivilegeMode,
}

impl HostRunner {
    pub fn new(mode: PrivilegeMode) -> Self {
        Self { mode }
    }

    fn full_argv(&self, argv: &[String]) -> Result<Vec<String>, SandboxError> {
        if argv.is_empty() {
            return Err(SandboxError::InvalidArgument("empty command".into()));
        }
        match &self.mode {
            PrivilegeMode::Sudo => {
                let mut full = vec!["sudo".to_string(), "-n".to_string()];
                full.extend_from_slice(argv);
                Ok(full)
            }
            PrivilegeMode::Helper { helper_path } => {
                if !HELPER_ALLOWED.contains(&argv[0].as_str()) {
                    return Err(SandboxError::InvalidArgument(format!(
                        "command {:?} not permitted through the root helper",
                        argv[0]
                    )));
                }
                let mut full = vec![helper_path.to_string_lossy().to_string()];
                full.extend_from_slice(argv);
                Ok(full)
            }
        }
    }
}

#[async_trait]
impl PrivilegedRunner for HostRunner {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput, SandboxError> {
        let full = self.full_argv(argv)?;
        tracing::debug!(command = ?full, "running privileged command");

        let output = tokio::process::Command::new(&full[0])
            .args(&full[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn sudo_mode_prefixes_noninteractive_sudo() {
        let runner = HostRunner::new(PrivilegeMode::Sudo);
        let full = runner
            .full_argv(&argv(&["iptables", "-A", "FORWARD", "-j", "DROP"]))
            .unwrap();
        assert_eq!(full[0], "sudo");
        assert_eq!(full[1], "-n");
        assert_eq!(full[2], "iptables");
    }

    #[test]
    fn helper_mode_allows_listed_commands() {
        let runner = HostRunner::new(PrivilegeMode::Helper {
            helper_path: PathBuf::from("/opt/helper"),
        });
        for cmd in ["iptables", "ip", "mount", "umount", "install", "mkdir"] {
            let full = runner.full_argv(&argv(&[cmd, "x"])).unwrap();
            assert_eq!(full[0], "/opt/helper");
            assert_eq!(full[1], cmd);
        }
    }

    #[test]
    fn helper_mode_refuses_unlisted_commands() {
        let runner = HostRunner::new(PrivilegeMode::helper_default());
        for cmd in ["rm", "bash", "sh", "curl", "dd"] {
            let err = runner.full_argv(&argv(&[cmd, "-rf", "/"])).unwrap_err();
            assert!(matches!(err, SandboxError::InvalidArgument(_)), "{cmd}");
        }
    }

    #[test]
    fn empty_argv_is_invalid() {
        let runner = HostRunner::new(PrivilegeMode::Sudo);
        assert!(matches!(
            runner.full_argv(&[]).unwrap_err(),
            SandboxError::InvalidArgument(_)
        ));
    }

    #[test]
    fn helper_default_path() {
        match PrivilegeMode::helper_default() {
            PrivilegeMode::Helper { helper_path } => {
                assert_eq!(
                    helper_path.to_string_lossy(),
                    "/usr/local/sbin/cleanroom-root-helper"
                );
            }
            other => panic!("unexpected mode: {other:?}"),
        }
    }

    #[test]
    fn command_output_check() {
        let ok = CommandOutput {
            exit_code: Some(0),
            stdout: b"ok".to_vec(),
            stderr: vec![],
        };
        assert!(ok.check("tap create").is_ok());

        let fail = CommandOutput {
            exit_code: Some(2),
            stdout: vec![],
            stderr: b"No such device".to_vec(),
        };
        let err = fail.check("tap delete").unwrap_err();
        assert!(err.to_string().contains("tap delete"));
        assert!(err.to_string().contains("No such device"));
    }
}
