//! Egress policy: validation, canonicalization, and the stable hash.
//!
//! A policy arrives either as a serialized document (YAML or JSON) or is
//! built in-process from an allowlist. Compilation normalizes the allow
//! list, extracts the image digest, and computes a hash that is stable
//! across logically-equal inputs (permuted entries, duplicate ports).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const POLICY_VERSION: u32 = 1;

/// Compilation failures. Mapped to `invalid_argument` at the RPC edge.
#[derive(thiserror::Error, Debug)]
pub enum PolicyError {
    #[error("version_unsupported: schema version {0} (accepted: 1)")]
    VersionUnsupported(u32),

    #[error("missing_image_digest: image ref {0:?} carries no @sha256 digest")]
    MissingImageDigest(String),

    #[error("default_not_deny: network default {0:?} (must be \"deny\")")]
    DefaultNotDeny(String),

    #[error("invalid_allow_entry: {0}")]
    InvalidAllowEntry(String),

    #[error("image_digest {given} does not match digest in image ref ({in_ref})")]
    DigestMismatch { given: String, in_ref: String },

    #[error("invalid policy document: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkDefault {
    Deny,
    Allow,
}

/// One normalized allow entry: a host plus its sorted, deduplicated ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowRule {
    pub host: String,
    pub ports: Vec<u16>,
}

impl AllowRule {
    pub fn new(host: impl Into<String>, ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            host: host.into(),
            ports: ports.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitProxySource {
    Upstream,
    HostMirror,
}

/// Optional git-proxy scope carried by the policy. Validated and kept,
/// but not part of the stable hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitPolicy {
    pub enabled: bool,
    pub source: GitProxySource,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub allowed_repos: Vec<String>,
}

/// Serialized input form, accepted as YAML or JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub version: u32,
    pub image_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,
    pub network_default: String,
    #[serde(default)]
    pub allow: Vec<AllowRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitPolicy>,
}

/// Immutable compiled policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledPolicy {
    pub version: u32,
    pub image_ref: String,
    pub image_digest: String,
    pub network_default: NetworkDefault,
    pub allow: Vec<AllowRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitPolicy>,
    /// Lowercase hex SHA-256 of the canonical serialization.
    pub hash: String,
}

impl CompiledPolicy {
    /// Compile a serialized document.
    pub fn compile(doc: PolicyDocument) -> Result<Self, PolicyError> {
        if doc.version != POLICY_VERSION {
            return Err(PolicyError::VersionUnsupported(doc.version));
        }

        let digest = image_ref_digest(&doc.image_ref)
            .ok_or_else(|| PolicyError::MissingImageDigest(doc.image_ref.clone()))?;

        if let Some(given) = &doc.image_digest {
            let given = given.trim().to_ascii_lowercase();
            let given = given.strip_prefix("sha256:").unwrap_or(&given).to_string();
            if given != digest {
                return Err(PolicyError::DigestMismatch {
                    given,
                    in_ref: digest,
                });
            }
        }

        if doc.network_default.trim().to_ascii_lowercase() != "deny" {
            return Err(PolicyError::DefaultNotDeny(doc.network_default));
        }

        let allow = normalize_allow(doc.allow)?;

        if let Some(git) = &doc.git {
            for host in &git.allowed_hosts {
                validate_host(host)?;
            }
        }

        let mut policy = CompiledPolicy {
            version: doc.version,
            image_ref: doc.image_ref,
            image_digest: digest,
            network_default: NetworkDefault::Deny,
            allow,
            git: doc.git,
            hash: String::new(),
        };
        policy.hash = policy.compute_hash();
        Ok(policy)
    }

    /// Compile from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, PolicyError> {
        let doc: PolicyDocument =
            serde_yaml::from_str(yaml).map_err(|e| PolicyError::Malformed(e.to_string()))?;
        Self::compile(doc)
    }

    /// Build a deny-default policy straight from an allowlist.
    pub fn from_allowlist(
        image_ref: impl Into<String>,
        image_digest: impl Into<String>,
        rules: impl IntoIterator<Item = AllowRule>,
    ) -> Result<Self, PolicyError> {
        Self::compile(PolicyDocument {
            version: POLICY_VERSION,
            image_ref: image_ref.into(),
            image_digest: Some(image_digest.into()),
            network_default: "deny".into(),
            allow: rules.into_iter().collect(),
            git: None,
        })
    }

    /// True iff the default is allow, or `(host, port)` is in the list.
    pub fn allows(&self, host: &str, port: u16) -> bool {
        if self.network_default == NetworkDefault::Allow {
            return true;
        }
        let host = host.trim().to_ascii_lowercase();
        self.allow
            .iter()
            .any(|r| r.host == host && r.ports.binary_search(&port).is_ok())
    }

    /// Canonical byte stream: version, image digest, default, then one
    /// line per (host, port) in sorted order.
    fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("v{}\n", self.version));
        hasher.update(format!("image:{}\n", self.image_digest));
        hasher.update("default:deny\n");
        for rule in &self.allow {
            for port in &rule.ports {
                hasher.update(format!("allow:{}:{}\n", rule.host, port));
            }
        }
        hex::encode(hasher.finalize())
    }
}

/// Pull the sha256 digest out of `registry/path@sha256:<hex64>`.
/// Returns the lowercase 64-char hex string, or None.
pub fn image_ref_digest(image_ref: &str) -> Option<String> {
    let (_, digest) = image_ref.split_once("@sha256:")?;
    if digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(digest.to_ascii_lowercase())
    } else {
        None
    }
}

fn validate_host(host: &str) -> Result<(), PolicyError> {
    let trimmed = host.trim();
    if trimmed.is_empty() {
        return Err(PolicyError::InvalidAllowEntry("empty host".into()));
    }
    let ok = trimmed
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.' || b == b'_');
    if !ok {
        return Err(PolicyError::InvalidAllowEntry(format!(
            "host {trimmed:?} contains invalid characters"
        )));
    }
    Ok(())
}

/// Lowercase and trim hosts, dedup+sort ports, merge duplicate hosts,
/// drop entries left with zero ports, sort by host.
fn normalize_allow(entries: Vec<AllowRule>) -> Result<Vec<AllowRule>, PolicyError> {
    use std::collections::BTreeMap;

    let mut by_host: BTreeMap<String, Vec<u16>> = BTreeMap::new();
    for entry in entries {
        validate_host(&entry.host)?;
        let host = entry.host.trim().to_ascii_lowercase();
        for port in &entry.ports {
            if *port == 0 {
                return Err(PolicyError::InvalidAllowEntry(format!(
                    "host {host:?}: port 0 out of range"
                )));
            }
        }
        by_host.entry(host).or_default().extend(entry.ports);
    }

    Ok(by_host
        .into_iter()
        .filter_map(|(host, mut ports)| {
            ports.sort_unstable();
            ports.dedup();
            if ports.is_empty() {
                None
            } else {
                Some(AllowRule { host, ports })
            }
        })
        .collect())
}
