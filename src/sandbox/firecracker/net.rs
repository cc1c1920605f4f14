//! Per-sandbox host network fabric.
//!
//! Every sandbox gets a tap device, a /24 on the host side, NAT for its
//! guest address, and a default-deny FORWARD chain opened only for the
//! compiled allowlist. All identifiers derive deterministically from the
//! sandbox id so teardown can never touch another sandbox's rules.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::host_cmd::PrivilegedRunner;
use crate::policy::CompiledPolicy;
use crate::sandbox::error::SandboxError;
use crate::sandbox::types::{SandboxAddressing, SandboxId};

const TAP_PREFIX: &str = "crm";

/// Derive the sandbox's host networking identity from its id.
///
/// The two subnet octets come from the first hash bytes, forced
/// non-zero; the MAC embeds four further hash bytes under the local
/// admin prefix `02:fc`.
pub fn derive_addressing(sandbox_id: &str) -> SandboxAddressing {
    let hash = Sha256::digest(sandbox_id.as_bytes());
    let a = if hash[0] == 0 { 1 } else { hash[0] };
    let b = if hash[1] == 0 { 1 } else { hash[1] };

    let suffix: String = sandbox_id
        .strip_prefix("sbx_")
        .unwrap_or(sandbox_id)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(12)
        .collect();

    // CIDs 0-2 are reserved by the vsock transport.
    let cid_raw = u32::from_be_bytes([hash[6], hash[7], hash[8], hash[9]]);
    let guest_cid = 3 + (cid_raw % 0xFFFF_0000);

    SandboxAddressing {
        tap_name: format!("{TAP_PREFIX}{suffix}"),
        host_ip: format!("10.{a}.{b}.1"),
        guest_ip: format!("10.{a}.{b}.2"),
        guest_mac: format!(
            "02:fc:{:02x}:{:02x}:{:02x}:{:02x}",
            hash[2], hash[3], hash[4], hash[5]
        ),
        guest_cid,
    }
}

/// Injectable name resolution for allowlist rules.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve_ipv4(&self, host: &str) -> Result<Vec<Ipv4Addr>, SandboxError>;
}

/// Production resolver: the system's own lookup path.
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve_ipv4(&self, host: &str) -> Result<Vec<Ipv4Addr>, SandboxError> {
        let addrs = tokio::net::lookup_host((host, 0u16))
            .await
            .map_err(|e| SandboxError::Internal(format!("resolve {host}: {e}")))?;
        let v4: Vec<Ipv4Addr> = addrs
            .filter_map(|a| match a.ip() {
                std::net::IpAddr::V4(ip) => Some(ip),
                std::net::IpAddr::V6(_) => None,
            })
            .collect();
        if v4.is_empty() {
            return Err(SandboxError::Internal(format!(
                "resolve {host}: no IPv4 addresses"
            )));
        }
        Ok(v4)
    }
}

/// Host-side network state for one sandbox. Consumed by teardown.
#[derive(Debug)]
pub struct NetworkLease {
    pub addressing: SandboxAddressing,
    undo: Vec<Vec<String>>,
}

pub struct NetworkFabric {
    runner: Arc<dyn PrivilegedRunner>,
    resolver: Arc<dyn HostResolver>,
    /// Resolver address the guest is pointed at (DNS accept rules).
    dns_server: String,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

impl NetworkFabric {
    pub fn new(
        runner: Arc<dyn PrivilegedRunner>,
        resolver: Arc<dyn HostResolver>,
        dns_server: String,
    ) -> Self {
        Self {
            runner,
            resolver,
            dns_server,
        }
    }

    pub fn dns_server(&self) -> &str {
        &self.dns_server
    }

    /// Bring up the sandbox network. Any step failure tears down what
    /// was already installed before the error is returned.
    pub async fn setup(
        &self,
        sandbox_id: &SandboxId,
        policy: &CompiledPolicy,
    ) -> Result<NetworkLease, SandboxError> {
        let addressing = derive_addressing(sandbox_id);
        let mut undo: Vec<Vec<String>> = Vec::new();

        match self.setup_inner(&addressing, policy, &mut undo).await {
            Ok(()) => {
                tracing::info!(
                    sandbox_id = %sandbox_id,
                    tap = %addressing.tap_name,
                    guest_ip = %addressing.guest_ip,
                    rules = undo.len(),
                    "sandbox network up"
                );
                Ok(NetworkLease { addressing, undo })
            }
            Err(e) => {
                tracing::warn!(
                    sandbox_id = %sandbox_id,
                    error = %e,
                    "network setup failed, rolling back"
                );
                run_undo(self.runner.clone(), std::mem::take(&mut undo)).await;
                Err(e)
            }
        }
    }

    async fn setup_inner(
        &self,
        addressing: &SandboxAddressing,
        policy: &CompiledPolicy,
        undo: &mut Vec<Vec<String>>,
    ) -> Result<(), SandboxError> {
        let tap = addressing.tap_name.as_str();
        let host_cidr = format!("{}/24", addressing.host_ip);
        let guest_cidr = format!("{}/32", addressing.guest_ip);
        let owner = tap_owner();

        // 1. Tap device, owned by the current uid.
        self.run_checked(
            &argv(&["ip", "tuntap", "add", "dev", tap, "mode", "tap", "user", &owner]),
            "tap create",
        )
        .await?;
        undo.push(argv(&["ip", "link", "del", tap]));

        // 2. Host address + link up.
        self.run_checked(
            &argv(&["ip", "addr", "add", &host_cidr, "dev", tap]),
            "tap address",
        )
        .await?;
        self.run_checked(&argv(&["ip", "link", "set", "dev", tap, "up"]), "tap up")
            .await?;

        // 3. IPv4 forwarding (global knob, never undone).
        self.run_checked(
            &argv(&["sysctl", "-w", "net.ipv4.ip_forward=1"]),
            "ip forwarding",
        )
        .await?;

        // 4. NAT for the guest address.
        let masq = |op: &str| {
            argv(&[
                "iptables",
                "-t",
                "nat",
                op,
                "POSTROUTING",
                "-s",
                &guest_cidr,
                "-j",
                "MASQUERADE",
            ])
        };
        self.run_checked(&masq("-A"), "nat masquerade").await?;
        undo.push(masq("-D"));

        // 5. Conntrack return path, with the legacy `-m state` fallback.
        let conntrack = |op: &str, module: &str, flag: &str| {
            argv(&[
                "iptables",
                op,
                "FORWARD",
                "-o",
                tap,
                "-m",
                module,
                flag,
                "RELATED,ESTABLISHED",
                "-j",
                "ACCEPT",
            ])
        };
        let installed = self
            .runner
            .run(&conntrack("-A", "conntrack", "--ctstate"))
            .await?;
        if installed.success() {
            undo.push(conntrack("-D", "conntrack", "--ctstate"));
        } else {
            self.run_checked(&conntrack("-A", "state", "--state"), "conntrack return path")
                .await?;
            undo.push(conntrack("-D", "state", "--state"));
        }

        // 6. DNS to the configured resolver, tcp and udp.
        for proto in ["tcp", "udp"] {
            let dns = |op: &str| {
                argv(&[
                    "iptables",
                    op,
                    "FORWARD",
                    "-i",
                    tap,
                    "-p",
                    proto,
                    "-d",
                    &self.dns_server,
                    "--dport",
                    "53",
                    "-j",
                    "ACCEPT",
                ])
            };
            self.run_checked(&dns("-A"), "dns accept").await?;
            undo.push(dns("-D"));
        }

        // 7. Allowlist rules, deduplicated across hosts.
        let mut seen: HashSet<(Ipv4Addr, u16)> = HashSet::new();
        for rule in &policy.allow {
            let ips = self.resolver.resolve_ipv4(&rule.host).await?;
            for ip in ips {
                for port in &rule.ports {
                    if !seen.insert((ip, *port)) {
                        continue;
                    }
                    let ip_str = ip.to_string();
                    let port_str = port.to_string();
                    for proto in ["tcp", "udp"] {
                        let allow = |op: &str| {
                            argv(&[
                                "iptables",
                                op,
                                "FORWARD",
                                "-i",
                                tap,
                                "-p",
                                proto,
                                "-d",
                                &ip_str,
                                "--dport",
                                &port_str,
                                "-j",
                                "ACCEPT",
                            ])
                        };
                        self.run_checked(&allow("-A"), "allow rule").await?;
                        undo.push(allow("-D"));
                    }
                }
            }
        }

        // 8. Everything else from the tap is dropped.
        let drop_rule = |op: &str| argv(&["iptables", op, "FORWARD", "-i", tap, "-j", "DROP"]);
        self.run_checked(&drop_rule("-A"), "default drop").await?;
        undo.push(drop_rule("-D"));

        Ok(())
    }

    /// Reverse the undo stack, best effort. Runs on a detached task so
    /// a canceled caller cannot abort half-finished cleanup.
    pub async fn teardown(&self, lease: NetworkLease) {
        let runner = self.runner.clone();
        let tap = lease.addressing.tap_name.clone();
        let handle = tokio::spawn(async move {
            run_undo(runner, lease.undo).await;
            tracing::debug!(tap = %tap, "sandbox network down");
        });
        // Await is cancel-safe: the spawned task finishes regardless.
        let _ = handle.await;
    }

    async fn run_checked(&self, cmd: &[String], what: &str) -> Result<(), SandboxError> {
        self.runner.run(cmd).await?.check(what)
    }
}

async fn run_undo(runner: Arc<dyn PrivilegedRunner>, undo: Vec<Vec<String>>) {
    for cmd in undo.into_iter().rev() {
        match runner.run(&cmd).await {
            Ok(out) if !out.success() => {
                tracing::warn!(command = ?cmd, code = ?out.exit_code, "network undo command failed");
            }
            Err(e) => {
                tracing::warn!(command = ?cmd, error = %e, "network undo command errored");
            }
            Ok(_) => {}
        }
    }
}

fn tap_owner() -> String {
    std::env::var("USER").unwrap_or_else(|_| {
        // No login name in the environment (service managers strip it):
        // fall back to the numeric uid, which `ip tuntap` accepts.
        unsafe { libc::getuid() }.to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::AllowRule;
    use crate::sandbox::firecracker::host_cmd::CommandOutput;
    use std::sync::Mutex;
    use std::time::Duration;

    const REF: &str = "ghcr.io/example/base@sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
    const DIGEST: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    struct Recorder {
        commands: Mutex<Vec<Vec<String>>>,
        fail_matching: Option<String>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                commands: Mutex::new(Vec::new()),
                fail_matching: None,
            })
        }

        fn failing_on(needle: &str) -> Arc<Self> {
            Arc::new(Self {
                commands: Mutex::new(Vec::new()),
                fail_matching: Some(needle.into()),
            })
        }

        fn recorded(&self) -> Vec<Vec<String>> {
            self.commands.lock().unwrap().clone()
        }

        fn contains(&self, needle: &[&str]) -> bool {
            let needle: Vec<String> = needle.iter().map(|s| s.to_string()).collect();
            self.recorded().iter().any(|c| *c == needle)
        }
    }

    #[async_trait]
    impl PrivilegedRunner for Recorder {
        async fn run(&self, command: &[String]) -> Result<CommandOutput, SandboxError> {
            self.commands.lock().unwrap().push(command.to_vec());
            let fail = self
                .fail_matching
                .as_ref()
                .is_some_and(|needle| command.join(" ").contains(needle.as_str()));
            Ok(CommandOutput {
                exit_code: Some(if fail { 2 } else { 0 }),
                stdout: vec![],
                stderr: if fail { b"forced failure".to_vec() } else { vec![] },
            })
        }
    }

    struct FixedResolver(Vec<Ipv4Addr>);

    #[async_trait]
    impl HostResolver for FixedResolver {
        async fn resolve_ipv4(&self, _host: &str) -> Result<Vec<Ipv4Addr>, SandboxError> {
            Ok(self.0.clone())
        }
    }

    fn test_policy() -> CompiledPolicy {
        CompiledPolicy::from_allowlist(
            REF,
            DIGEST,
            [
                AllowRule::new("api.github.com", [443]),
                AllowRule::new("registry.npmjs.org", [443]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn addressing_is_deterministic_and_nonzero() {
        let a = derive_addressing("sbx_0123456789abcdef0123456789abcdef");
        let b = derive_addressing("sbx_0123456789abcdef0123456789abcdef");
        assert_eq!(a, b);

        let octets: Vec<&str> = a.host_ip.split('.').collect();
        assert_eq!(octets[0], "10");
        assert_ne!(octets[1], "0");
        assert_ne!(octets[2], "0");
        assert_eq!(octets[3], "1");
        assert!(a.guest_ip.ends_with(".2"));
        assert!(a.guest_mac.starts_with("02:fc:"));
        assert!(a.guest_cid >= 3);
        assert!(a.tap_name.starts_with("crm"));
        assert!(a.tap_name.len() <= 15);
    }

    #[test]
    fn different_sandboxes_get_different_taps() {
        let a = derive_addressing("sbx_aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let b = derive_addressing("sbx_bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
        assert_ne!(a.tap_name, b.tap_name);
        assert_ne!(a.guest_mac, b.guest_mac);
    }

    #[tokio::test]
    async fn setup_installs_allow_rules_and_default_drop() {
        let recorder = Recorder::new();
        let resolver = Arc::new(FixedResolver(vec![
            Ipv4Addr::new(140, 82, 112, 3),
            Ipv4Addr::new(140, 82, 112, 4),
        ]));
        let fabric = NetworkFabric::new(recorder.clone(), resolver, "1.1.1.1".into());

        let id = "sbx_0123456789abcdef0123456789abcdef".to_string();
        let lease = fabric.setup(&id, &test_policy()).await.unwrap();
        let tap = lease.addressing.tap_name.clone();

        // Default DROP for this tap.
        assert!(recorder.contains(&["iptables", "-A", "FORWARD", "-i", &tap, "-j", "DROP"]));

        // Allow rules for the resolved addresses, both protocols.
        for proto in ["tcp", "udp"] {
            assert!(recorder.contains(&[
                "iptables",
                "-A",
                "FORWARD",
                "-i",
                &tap,
                "-p",
                proto,
                "-d",
                "140.82.112.3",
                "--dport",
                "443",
                "-j",
                "ACCEPT",
            ]));
        }

        // Both hosts resolved to the same address set: rules dedup to
        // one set per (ip, port), i.e. 2 ips x 1 port x 2 protos.
        let accept_count = recorder
            .recorded()
            .iter()
            .filter(|c| c.join(" ").contains("--dport 443"))
            .count();
        assert_eq!(accept_count, 4);
    }

    #[tokio::test]
    async fn teardown_completes_even_when_caller_is_canceled() {
        let recorder = Recorder::new();
        let resolver = Arc::new(FixedResolver(vec![Ipv4Addr::new(140, 82, 112, 3)]));
        let fabric = Arc::new(NetworkFabric::new(
            recorder.clone(),
            resolver,
            "1.1.1.1".into(),
        ));

        let id = "sbx_0123456789abcdef0123456789abcdef".to_string();
        let lease = fabric.setup(&id, &test_policy()).await.unwrap();
        let tap = lease.addressing.tap_name.clone();
        let before = recorder.recorded().len();

        // Cancel the teardown future immediately; the detached task
        // must still run every undo command.
        let _ = tokio::time::timeout(Duration::from_millis(0), fabric.teardown(lease)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let after = recorder.recorded();
        assert!(after.len() > before, "undo commands were recorded");
        assert!(recorder.contains(&["ip", "link", "del", &tap]));
        assert!(recorder.contains(&["iptables", "-D", "FORWARD", "-i", &tap, "-j", "DROP"]));

        // Undo runs in reverse: tap deletion is the last command.
        assert_eq!(after.last().unwrap(), &argv(&["ip", "link", "del", &tap]));
    }

    #[tokio::test]
    async fn failed_step_rolls_back_partial_state() {
        // DNS accept rules fail: the tap and NAT rules installed before
        // them must be removed before the error returns.
        let recorder = Recorder::failing_on("--dport 53");
        let resolver = Arc::new(FixedResolver(vec![Ipv4Addr::new(1, 2, 3, 4)]));
        let fabric = NetworkFabric::new(recorder.clone(), resolver, "1.1.1.1".into());

        let id = "sbx_0123456789abcdef0123456789abcdef".to_string();
        let err = fabric.setup(&id, &test_policy()).await.unwrap_err();
        assert!(err.to_string().contains("dns accept"));

        let tap = derive_addressing(&id).tap_name;
        assert!(recorder.contains(&["ip", "link", "del", &tap]));
        let guest_cidr = format!("{}/32", derive_addressing(&id).guest_ip);
        assert!(recorder.contains(&[
            "iptables",
            "-t",
            "nat",
            "-D",
            "POSTROUTING",
            "-s",
            &guest_cidr,
            "-j",
            "MASQUERADE",
        ]));
    }

    #[tokio::test]
    async fn conntrack_falls_back_to_state_module() {
        let recorder = Recorder::failing_on("-m conntrack");
        let resolver = Arc::new(FixedResolver(vec![Ipv4Addr::new(1, 2, 3, 4)]));
        let fabric = NetworkFabric::new(recorder.clone(), resolver, "1.1.1.1".into());

        let id = "sbx_0123456789abcdef0123456789abcdef".to_string();
        let lease = fabric.setup(&id, &test_policy()).await.unwrap();
        let tap = lease.addressing.tap_name.clone();

        assert!(recorder.contains(&[
            "iptables",
            "-A",
            "FORWARD",
            "-o",
            &tap,
            "-m",
            "state",
            "--state",
            "RELATED,ESTABLISHED",
            "-j",
            "ACCEPT",
        ]));
    }
}
