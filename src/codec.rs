//! Wire codec for the session WebSocket.
//!
//! Two kinds of frames share one connection and are told apart by the
//! transport frame type, never by content:
//!
//! - **Binary** frames start with a one-byte opcode:
//!   - `0x00` resize: `[op][rows: u16 BE][cols: u16 BE]` (exactly 5 bytes)
//!   - `0x01` file upload: `[op][name_len: u16 BE][name: UTF-8][content...]`
//!   - `0x02` chunk: `[op][index: u8][total: u8][fragment...]`
//!   - `0x03` terminal input: `[op][bytes...]`
//! - **Text** frames are single-line JSON objects with a `type` field.
//!
//! Server → client PTY output is sent as untagged binary frames.
//!
//! A chunked payload has at most 255 fragments: `total` is a u8 count and
//! zero is invalid, so indexes run `0..=254`.
//!
//! A server that closes a session for good ends each viewer's socket with
//! [`SESSION_CLOSED_CODE`]. Any other close means the viewer may reconnect.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::worktree::WorktreeInfo;

/// Opcode byte values for client → server binary frames.
pub mod opcode {
    pub const RESIZE: u8 = 0x00;
    pub const UPLOAD: u8 = 0x01;
    pub const CHUNK: u8 = 0x02;
    pub const INPUT: u8 = 0x03;
}

/// Upper bound on fragments per logical payload (the `total` field is a u8).
pub const MAX_CHUNKS: usize = u8::MAX as usize;

/// Application close code: the session was closed and will not come back.
pub const SESSION_CLOSED_CODE: u16 = 4000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("empty frame")]
    Empty,

    #[error("unknown opcode: 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("truncated frame for opcode 0x{opcode:02x}: need {needed} bytes, got {got}")]
    Truncated { opcode: u8, needed: usize, got: usize },

    #[error("resize frame must be exactly 5 bytes, got {0}")]
    ResizeLength(usize),

    #[error("filename is {0} bytes, exceeds u16 length prefix")]
    FilenameTooLong(usize),

    #[error("filename is not valid UTF-8")]
    FilenameEncoding,

    #[error("payload needs {0} chunks, max is {MAX_CHUNKS}")]
    TooManyChunks(usize),

    #[error("chunk fragment size must be non-zero")]
    ZeroFragmentSize,
}

/// A decoded client → server binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryFrame {
    Resize { rows: u16, cols: u16 },
    Upload { filename: String, data: Bytes },
    Chunk { index: u8, total: u8, payload: Bytes },
    Input(Bytes),
}

impl BinaryFrame {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Resize { .. } => opcode::RESIZE,
            Self::Upload { .. } => opcode::UPLOAD,
            Self::Chunk { .. } => opcode::CHUNK,
            Self::Input(_) => opcode::INPUT,
        }
    }

    /// Encode this frame into its wire representation.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        match self {
            Self::Resize { rows, cols } => {
                let mut buf = BytesMut::with_capacity(5);
                buf.put_u8(opcode::RESIZE);
                buf.put_u16(*rows);
                buf.put_u16(*cols);
                Ok(buf.freeze())
            }
            Self::Upload { filename, data } => {
                let name = filename.as_bytes();
                if name.len() > u16::MAX as usize {
                    return Err(CodecError::FilenameTooLong(name.len()));
                }
                let mut buf = BytesMut::with_capacity(3 + name.len() + data.len());
                buf.put_u8(opcode::UPLOAD);
                buf.put_u16(name.len() as u16);
                buf.put(name);
                buf.put(data.as_ref());
                Ok(buf.freeze())
            }
            Self::Chunk { index, total, payload } => {
                let mut buf = BytesMut::with_capacity(3 + payload.len());
                buf.put_u8(opcode::CHUNK);
                buf.put_u8(*index);
                buf.put_u8(*total);
                buf.put(payload.as_ref());
                Ok(buf.freeze())
            }
            Self::Input(data) => {
                let mut buf = BytesMut::with_capacity(1 + data.len());
                buf.put_u8(opcode::INPUT);
                buf.put(data.as_ref());
                Ok(buf.freeze())
            }
        }
    }

    /// Decode a binary frame. Payload slices share the input buffer.
    pub fn decode(frame: Bytes) -> Result<Self, CodecError> {
        let Some(&op) = frame.first() else {
            return Err(CodecError::Empty);
        };
        match op {
            opcode::RESIZE => {
                if frame.len() != 5 {
                    return Err(CodecError::ResizeLength(frame.len()));
                }
                let mut body = &frame[1..];
                let rows = body.get_u16();
                let cols = body.get_u16();
                Ok(Self::Resize { rows, cols })
            }
            opcode::UPLOAD => {
                if frame.len() < 3 {
                    return Err(CodecError::Truncated { opcode: op, needed: 3, got: frame.len() });
                }
                let name_len = u16::from_be_bytes([frame[1], frame[2]]) as usize;
                let needed = 3 + name_len;
                if frame.len() < needed {
                    return Err(CodecError::Truncated { opcode: op, needed, got: frame.len() });
                }
                let filename = std::str::from_utf8(&frame[3..needed])
                    .map_err(|_| CodecError::FilenameEncoding)?
                    .to_string();
                Ok(Self::Upload { filename, data: frame.slice(needed..) })
            }
            opcode::CHUNK => {
                if frame.len() < 3 {
                    return Err(CodecError::Truncated { opcode: op, needed: 3, got: frame.len() });
                }
                Ok(Self::Chunk {
                    index: frame[1],
                    total: frame[2],
                    payload: frame.slice(3..),
                })
            }
            opcode::INPUT => Ok(Self::Input(frame.slice(1..))),
            other => Err(CodecError::UnknownOpcode(other)),
        }
    }
}

/// Split an encoded logical frame into chunk fragments of at most
/// `fragment_size` payload bytes each.
pub fn encode_chunks(logical: &[u8], fragment_size: usize) -> Result<Vec<Bytes>, CodecError> {
    if fragment_size == 0 {
        return Err(CodecError::ZeroFragmentSize);
    }
    let count = logical.len().div_ceil(fragment_size).max(1);
    if count > MAX_CHUNKS {
        return Err(CodecError::TooManyChunks(count));
    }
    let mut out = Vec::with_capacity(count);
    if logical.is_empty() {
        out.push(
            BinaryFrame::Chunk { index: 0, total: 1, payload: Bytes::new() }.encode()?,
        );
        return Ok(out);
    }
    for (index, piece) in logical.chunks(fragment_size).enumerate() {
        out.push(
            BinaryFrame::Chunk {
                index: index as u8,
                total: count as u8,
                payload: Bytes::copy_from_slice(piece),
            }
            .encode()?,
        );
    }
    Ok(out)
}

// ── Chunk reassembly ───────────────────────────────────────────────

/// Why a chunk sequence was abandoned.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChunkError {
    #[error("chunk total must be non-zero")]
    ZeroTotal,

    #[error("chunk index {index} out of range for total {total}")]
    IndexOutOfRange { index: u8, total: u8 },

    #[error("expected chunk {expected}, got {got}")]
    OutOfOrder { expected: u8, got: u8 },

    #[error("chunk total changed from {was} to {now}")]
    TotalMismatch { was: u8, now: u8 },

    #[error("reassembled payload exceeds {0} bytes")]
    TooLarge(usize),
}

struct Partial {
    total: u8,
    next: u8,
    buf: BytesMut,
}

/// Reassembles chunk fragments for one connection.
///
/// Fragments must arrive as `0, 1, ..., total-1`. Any deviation discards
/// the partial payload; nothing is emitted for it. A fragment with index 0
/// always starts a new payload, abandoning whatever was in progress.
pub struct ChunkAssembler {
    partial: Option<Partial>,
    max_bytes: usize,
}

impl ChunkAssembler {
    pub fn new(max_bytes: usize) -> Self {
        Self { partial: None, max_bytes }
    }

    /// True while a payload is partially assembled.
    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    /// Feed one fragment. Returns the full payload once the last fragment
    /// arrives, `Ok(None)` while more are expected.
    pub fn push(&mut self, index: u8, total: u8, payload: &[u8]) -> Result<Option<Bytes>, ChunkError> {
        if total == 0 {
            self.partial = None;
            return Err(ChunkError::ZeroTotal);
        }
        if index >= total {
            self.partial = None;
            return Err(ChunkError::IndexOutOfRange { index, total });
        }

        if index == 0 {
            if self.partial.is_some() {
                tracing::debug!("new chunk sequence started, discarding partial payload");
            }
            self.partial = Some(Partial { total, next: 0, buf: BytesMut::new() });
        }

        let Some(partial) = self.partial.as_mut() else {
            return Err(ChunkError::OutOfOrder { expected: 0, got: index });
        };
        if partial.total != total {
            let was = partial.total;
            self.partial = None;
            return Err(ChunkError::TotalMismatch { was, now: total });
        }
        if partial.next != index {
            let expected = partial.next;
            self.partial = None;
            return Err(ChunkError::OutOfOrder { expected, got: index });
        }
        if partial.buf.len() + payload.len() > self.max_bytes {
            self.partial = None;
            return Err(ChunkError::TooLarge(self.max_bytes));
        }

        partial.buf.extend_from_slice(payload);
        partial.next += 1;
        if partial.next == partial.total {
            let done = self.partial.take().map(|p| p.buf.freeze());
            return Ok(done);
        }
        Ok(None)
    }
}

// ── JSON control messages ──────────────────────────────────────────

/// Client → server JSON control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    Resize { rows: u16, cols: u16 },
    /// Single-frame upload with base64 content.
    FileUpload { filename: String, data: String },
    RenameSession { name: String },
    /// Absent `enabled` flips the current value.
    ToggleYolo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        enabled: Option<bool>,
    },
    Chat { text: String },
    Input { data: String },
    Restart,
}

/// Decode a text frame. Anything that is not a well-formed control message
/// yields `None`; callers drop the frame and keep the connection open.
pub fn decode_client_message(text: &str) -> Option<ClientMessage> {
    match serde_json::from_str(text) {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::trace!(error = %e, "dropping undecodable control frame");
            None
        }
    }
}

/// Which kind of start an `exec_start` announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    Fresh,
    Resume,
}

/// Server → client JSON control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "pong")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    #[serde(rename = "status")]
    Status(StatusSnapshot),
    #[serde(rename = "chatMsg")]
    ChatMsg {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        text: String,
        ts: u64,
    },
    #[serde(rename = "fileUploaded")]
    FileUploaded {
        filename: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "exit")]
    Exit {
        code: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        worktree: Option<WorktreeInfo>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "exec_start")]
    ExecStart { mode: LaunchMode },
    #[serde(rename = "renameSession")]
    SessionRenamed { name: String },
    #[serde(rename = "toggleYolo")]
    YoloToggled { enabled: bool },
}

impl ServerMessage {
    /// Serialize to the text frame payload.
    pub fn to_text(&self) -> String {
        // Every variant is plain data with string keys.
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to serialize server message");
            String::from("{}")
        })
    }
}

/// Point-in-time view of a session pushed to every viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub session: SessionSummary,
    pub terminal: TerminalDims,
    pub viewers: usize,
    pub yolo: bool,
    pub ports: Vec<u16>,
    pub process: ProcessStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub agent: String,
    pub cwd: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalDims {
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
}
