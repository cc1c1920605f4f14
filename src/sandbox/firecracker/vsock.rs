//! Host side of the guest-agent channel.
//!
//! Firecracker exposes the guest's vsock listener through a host unix
//! socket: the host connects, writes `CONNECT <port>\n`, and the VMM
//! answers `OK <assigned>\n` once the guest accepts. Everything after
//! that is the agent byte stream.

use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::sandbox::error::SandboxError;

/// One dial attempt: connect to the vsock uds and complete the CONNECT
/// handshake for `port`. The caller owns retry and deadline policy.
pub async fn dial(uds_path: &Path, port: u32) -> Result<UnixStream, SandboxError> {
    let mut stream = UnixStream::connect(uds_path)
        .await
        .map_err(|e| SandboxError::Internal(format!("vsock connect: {e}")))?;

    stream
        .write_all(format!("CONNECT {port}\n").as_bytes())
        .await
        .map_err(|e| SandboxError::Internal(format!("vsock handshake write: {e}")))?;

    // Response is a single short line; read byte-wise to avoid
    // consuming any agent bytes that follow it.
    let mut line = Vec::with_capacity(16);
    loop {
        let mut byte = [0u8; 1];
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| SandboxError::Internal(format!("vsock handshake read: {e}")))?;
        if n == 0 {
            return Err(SandboxError::Internal(
                "vsock handshake: connection closed before response".into(),
            ));
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > 64 {
            return Err(SandboxError::Internal(
                "vsock handshake: oversized response line".into(),
            ));
        }
    }

    let response = String::from_utf8_lossy(&line);
    if response.starts_with("OK ") || response == "OK" {
        Ok(stream)
    } else {
        Err(SandboxError::Internal(format!(
            "vsock handshake rejected: {response}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::UnixListener;

    async fn serve_one(listener: UnixListener, response: &'static str) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("CONNECT "));
        let mut stream = reader.into_inner();
        stream.write_all(response.as_bytes()).await.unwrap();
        // Keep the stream alive briefly so the client can finish.
        stream.write_all(b"").await.unwrap();
    }

    #[tokio::test]
    async fn dial_completes_connect_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_one(listener, "OK 1073741824\n"));

        let stream = dial(&path, 5005).await.unwrap();
        drop(stream);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn dial_rejects_error_response() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_one(listener, "ERR no listener\n"));

        let err = dial(&path, 5005).await.unwrap_err();
        assert!(err.to_string().contains("rejected"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn dial_fails_when_socket_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let err = dial(&dir.path().join("missing.sock"), 5005).await.unwrap_err();
        assert!(err.to_string().contains("vsock connect"));
    }

    #[tokio::test]
    async fn dial_fails_on_early_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let err = dial(&path, 5005).await.unwrap_err();
        let text = err.to_string();
        assert!(
            text.contains("closed before response") || text.contains("handshake read"),
            "{text}"
        );
        server.await.unwrap();
    }
}
