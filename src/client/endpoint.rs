//! Endpoint forms accepted by both the client and the server listener:
//! `unix:///path`, a bare absolute path, or `http(s)://host:port`.

use std::path::PathBuf;

use crate::sandbox::error::SandboxError;

/// Environment variable naming the default endpoint for clients.
pub const ENDPOINT_ENV: &str = "CLEANROOM_HOST";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Http(String),
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, SandboxError> {
        let raw = raw.trim();
        if let Some(path) = raw.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(SandboxError::InvalidArgument(format!(
                    "unsupported endpoint {raw:?}: empty unix path"
                )));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if raw.starts_with('/') {
            return Ok(Endpoint::Unix(PathBuf::from(raw)));
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Ok(Endpoint::Http(raw.trim_end_matches('/').to_string()));
        }
        Err(SandboxError::InvalidArgument(format!(
            "unsupported endpoint {raw:?}"
        )))
    }

    /// `CLEANROOM_HOST`, or the default local socket.
    pub fn from_env() -> Result<Self, SandboxError> {
        match std::env::var(ENDPOINT_ENV) {
            Ok(raw) if !raw.is_empty() => Self::parse(&raw),
            _ => {
                let base = dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".cleanroom");
                Ok(Endpoint::Unix(base.join("cleanroom.sock")))
            }
        }
    }
}
