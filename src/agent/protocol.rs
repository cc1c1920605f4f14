//! Frame codec for the host ↔ guest-agent channel.
//!
//! Wire format, both directions:
//! - 1 byte: frame type tag
//! - 4 bytes: payload length (little endian)
//! - N bytes: payload (JSON encoded; byte fields ride base64)
//!
//! The tag leads so the host can detect a legacy guest by peeking one
//! byte: a legacy agent writes a bare JSON object, whose first byte
//! (`{`) is outside the tag range, and the reader switches to decoding
//! a single `LegacyResponse` from the remaining stream.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::sandbox::error::SandboxError;
use crate::sandbox::types::b64;

/// Guest-agent vsock port. The guest init script passes this to the
/// agent via kernel cmdline; the host dials it per execution.
pub const AGENT_VSOCK_PORT: u32 = 5005;

/// Refuse frames larger than this (corrupt peer, not a real payload).
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

// Frame type tags. Keep dense and low: anything >= 0x20 (printable
// ASCII, e.g. `{`) selects the legacy decode path.
const TAG_EXEC_REQUEST: u8 = 1;
const TAG_STDOUT: u8 = 2;
const TAG_STDERR: u8 = 3;
const TAG_EXIT: u8 = 4;
const TAG_STDIN: u8 = 5;
const TAG_RESIZE: u8 = 6;
const TAG_SIGNAL: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceAccess {
    #[default]
    Rw,
    Ro,
}

/// Host → guest, exactly once per connection, before any reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(with = "b64")]
    pub entropy_seed: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_tar_gz: Option<WorkspaceArchive>,
    #[serde(default)]
    pub workspace_access: WorkspaceAccess,
}

/// Wrapper so the optional archive field still rides base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceArchive(#[serde(with = "b64")] pub Vec<u8>);

/// Guest → host stream frames. `Exit` is terminal and closes the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestFrame {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit { exit_code: i32, error: Option<String> },
}

/// Host → guest control frames, valid after the exec request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostFrame {
    Stdin { data: Vec<u8> },
    Resize { cols: u16, rows: u16 },
    Signal { signal: i32 },
}

/// Single-response form emitted by legacy agents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegacyResponse {
    #[serde(default, with = "b64")]
    pub stdout: Vec<u8>,
    #[serde(default, with = "b64")]
    pub stderr: Vec<u8>,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct BytesPayload {
    #[serde(with = "b64")]
    data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct ExitPayload {
    exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ResizePayload {
    cols: u16,
    rows: u16,
}

#[derive(Serialize, Deserialize)]
struct SignalPayload {
    signal: i32,
}

async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    tag: u8,
    payload: &[u8],
) -> Result<(), SandboxError> {
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(tag);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Send the exec request. Must be the first write on the channel.
pub async fn write_exec_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    req: &ExecRequest,
) -> Result<(), SandboxError> {
    let payload = serde_json::to_vec(req)
        .map_err(|e| SandboxError::Internal(format!("encode exec request: {e}")))?;
    write_frame(w, TAG_EXEC_REQUEST, &payload).await
}

/// Send a control frame after the exec request.
pub async fn write_host_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    frame: &HostFrame,
) -> Result<(), SandboxError> {
    let (tag, payload) = match frame {
        HostFrame::Stdin { data } => (
            TAG_STDIN,
            serde_json::to_vec(&BytesPayload { data: data.clone() }),
        ),
        HostFrame::Resize { cols, rows } => (
            TAG_RESIZE,
            serde_json::to_vec(&ResizePayload {
                cols: *cols,
                rows: *rows,
            }),
        ),
        HostFrame::Signal { signal } => {
            (TAG_SIGNAL, serde_json::to_vec(&SignalPayload { signal: *signal }))
        }
    };
    let payload = payload.map_err(|e| SandboxError::Internal(format!("encode frame: {e}")))?;
    write_frame(w, tag, &payload).await
}

/// Reads guest frames, transparently degrading to the legacy
/// single-response decode when the first byte is not a frame tag.
pub struct FrameReader<R> {
    reader: R,
    state: ReaderState,
}

enum ReaderState {
    /// Nothing read yet; mode not decided.
    Fresh,
    Framed,
    /// Legacy response decoded; frames synthesized from it are drained
    /// in order.
    Legacy(std::vec::IntoIter<GuestFrame>),
    Done,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            state: ReaderState::Fresh,
        }
    }

    /// Next guest frame, or `None` once the channel is closed. After an
    /// `Exit` frame the next call returns `None`.
    pub async fn next(&mut self) -> Result<Option<GuestFrame>, SandboxError> {
        loop {
            match &mut self.state {
                ReaderState::Done => return Ok(None),
                ReaderState::Legacy(frames) => {
                    let frame = frames.next();
                    if frame.is_none() {
                        self.state = ReaderState::Done;
                    }
                    return Ok(frame);
                }
                ReaderState::Fresh => {
                    let mut tag = [0u8; 1];
                    match self.reader.read_exact(&mut tag).await {
                        Ok(_) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                            self.state = ReaderState::Done;
                            return Ok(None);
                        }
                        Err(e) => return Err(e.into()),
                    }
                    if matches!(tag[0], TAG_STDOUT | TAG_STDERR | TAG_EXIT) {
                        self.state = ReaderState::Framed;
                        return self.read_framed(tag[0]).await;
                    }
                    // Not a frame tag: legacy agent. The byte we consumed
                    // is the start of its JSON response.
                    let mut body = vec![tag[0]];
                    self.reader.read_to_end(&mut body).await?;
                    let legacy: LegacyResponse = serde_json::from_slice(&body).map_err(|e| {
                        SandboxError::Internal(format!("decode legacy agent response: {e}"))
                    })?;
                    self.state = ReaderState::Legacy(legacy_frames(legacy).into_iter());
                }
                ReaderState::Framed => {
                    let mut tag = [0u8; 1];
                    match self.reader.read_exact(&mut tag).await {
                        Ok(_) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                            self.state = ReaderState::Done;
                            return Ok(None);
                        }
                        Err(e) => return Err(e.into()),
                    }
                    return self.read_framed(tag[0]).await;
                }
            }
        }
    }

    async fn read_framed(&mut self, tag: u8) -> Result<Option<GuestFrame>, SandboxError> {
        let mut len_buf = [0u8; 4];
        self.reader.read_exact(&mut len_buf).await?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(SandboxError::Internal(format!(
                "guest frame length {len} exceeds limit"
            )));
        }
        let mut payload = vec![0u8; len];
        if len > 0 {
            self.reader.read_exact(&mut payload).await?;
        }

        let frame = match tag {
            TAG_STDOUT => {
                let p: BytesPayload = decode(&payload)?;
                GuestFrame::Stdout(p.data)
            }
            TAG_STDERR => {
                let p: BytesPayload = decode(&payload)?;
                GuestFrame::Stderr(p.data)
            }
            TAG_EXIT => {
                let p: ExitPayload = decode(&payload)?;
                self.state = ReaderState::Done;
                GuestFrame::Exit {
                    exit_code: p.exit_code,
                    error: p.error,
                }
            }
            other => {
                return Err(SandboxError::Internal(format!(
                    "unexpected guest frame tag {other}"
                )));
            }
        };
        Ok(Some(frame))
    }
}

fn decode<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, SandboxError> {
    serde_json::from_slice(payload)
        .map_err(|e| SandboxError::Internal(format!("decode guest frame: {e}")))
}

fn legacy_frames(legacy: LegacyResponse) -> Vec<GuestFrame> {
    let mut frames = Vec::with_capacity(3);
    if !legacy.stdout.is_empty() {
        frames.push(GuestFrame::Stdout(legacy.stdout));
    }
    if !legacy.stderr.is_empty() {
        frames.push(GuestFrame::Stderr(legacy.stderr));
    }
    frames.push(GuestFrame::Exit {
        exit_code: legacy.exit_code,
        error: legacy.error,
    });
    frames
}

/// Encode a guest frame. Used by tests and by in-process fake agents;
/// the real guest binary carries the same codec.
pub fn encode_guest_frame(frame: &GuestFrame) -> Vec<u8> {
    let (tag, payload) = match frame {
        GuestFrame::Stdout(data) => (
            TAG_STDOUT,
            serde_json::to_vec(&BytesPayload { data: data.clone() }).unwrap_or_default(),
        ),
        GuestFrame::Stderr(data) => (
            TAG_STDERR,
            serde_json::to_vec(&BytesPayload { data: data.clone() }).unwrap_or_default(),
        ),
        GuestFrame::Exit { exit_code, error } => (
            TAG_EXIT,
            serde_json::to_vec(&ExitPayload {
                exit_code: *exit_code,
                error: error.clone(),
            })
            .unwrap_or_default(),
        ),
    };
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(tag);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    buf
}
