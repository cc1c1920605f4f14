//! Minimal HTTP/1.1 client over a unix socket.
//!
//! No HTTP client crate in this stack speaks unix sockets, and the
//! control plane's default listener is one, so requests are written by
//! hand: one connection per request, `Connection: close`, responses
//! decoded by content-length, chunked coding, or read-to-EOF. Bodies
//! come back as a chunk stream so SSE responses can be tailed.

use std::path::Path;
use std::pin::Pin;

use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::sandbox::error::SandboxError;

pub type BodyChunks = Pin<Box<dyn Stream<Item = Result<Vec<u8>, SandboxError>> + Send>>;

pub struct RawResponse {
    pub status: u16,
    pub body: BodyChunks,
}

impl RawResponse {
    /// Drain the body into one buffer.
    pub async fn collect(mut self) -> Result<Vec<u8>, SandboxError> {
        use futures::StreamExt;
        let mut out = Vec::new();
        while let Some(chunk) = self.body.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

/// Issue one request over the socket at `socket_path`.
pub async fn unix_request(
    socket_path: &Path,
    method: &str,
    target: &str,
    body: Option<Vec<u8>>,
) -> Result<RawResponse, SandboxError> {
    let stream = UnixStream::connect(socket_path).await.map_err(|e| {
        SandboxError::Internal(format!("connect {}: {e}", socket_path.display()))
    })?;
    let mut stream = BufReader::new(stream);

    let body = body.unwrap_or_default();
    let head = format!(
        "{method} {target} HTTP/1.1\r\n\
host: localhost\r\n\
connection: close\r\n\
accept: application/json, text/event-stream\r\n\
content-type: application/json\r\n\
content-length: {}\r\n\r\n",
        body.len()
    );
    let mut request = head.into_bytes();
    request.extend_from_slice(&body);
    stream.get_mut().write_all(&request).await?;
    stream.get_mut().flush().await?;

    // Status line: "HTTP/1.1 200 OK".
    let mut status_line = String::new();
    stream.read_line(&mut status_line).await?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            SandboxError::Internal(format!("malformed status line {status_line:?}"))
        })?;

    // Headers until the blank line.
    let mut content_length: Option<usize> = None;
    let mut chunked = false;
    loop {
        let mut line = String::new();
        stream.read_line(&mut line).await?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();
            match name.as_str() {
                "content-length" => content_length = value.parse().ok(),
                "transfer-encoding" => {
                    chunked = value.to_ascii_lowercase().contains("chunked");
                }
                _ => {}
            }
        }
    }

    let body: BodyChunks = if chunked {
        Box::pin(chunked_body(stream))
    } else if let Some(len) = content_length {
        Box::pin(sized_body(stream, len))
    } else {
        Box::pin(eof_body(stream))
    };

    Ok(RawResponse { status, body })
}

fn chunked_body(
    mut stream: BufReader<UnixStream>,
) -> impl Stream<Item = Result<Vec<u8>, SandboxError>> {
    async_stream::try_stream! {
        loop {
            let mut size_line = String::new();
            stream.read_line(&mut size_line).await?;
            let size = usize::from_str_radix(
                size_line.trim().split(';').next().unwrap_or("").trim(),
                16,
            )
            .map_err(|_| {
                SandboxError::Internal(format!("malformed chunk size {size_line:?}"))
            })?;
            if size == 0 {
                // Trailer section, then done.
                loop {
                    let mut trailer = String::new();
                    let n = stream.read_line(&mut trailer).await?;
                    if n == 0 || trailer.trim_end().is_empty() {
                        break;
                    }
                }
                break;
            }
            let mut chunk = vec![0u8; size];
            stream.read_exact(&mut chunk).await?;
            let mut crlf = [0u8; 2];
            stream.read_exact(&mut crlf).await?;
            yield chunk;
        }
    }
}

fn sized_body(
    mut stream: BufReader<UnixStream>,
    len: usize,
) -> impl Stream<Item = Result<Vec<u8>, SandboxError>> {
    async_stream::try_stream! {
        let mut body = vec![0u8; len];
        if len > 0 {
            stream.read_exact(&mut body).await?;
        }
        yield body;
    }
}

fn eof_body(
    mut stream: BufReader<UnixStream>,
) -> impl Stream<Item = Result<Vec<u8>, SandboxError>> {
    async_stream::try_stream! {
        loop {
            let mut chunk = vec![0u8; 8192];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            chunk.truncate(n);
            yield chunk;
        }
    }
}
