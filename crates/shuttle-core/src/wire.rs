//! Shuttle wire format — the datagram framing shared by server and client.
//!
//! Every datagram is `[verb: 1 byte][serialized message]`. The verb selects
//! the message type and the remainder is that message encoded as JSON. The
//! verb values and field names ARE the protocol: changing either after
//! release breaks every deployed peer.
//!
//! Decoding never panics. An empty datagram, an unknown verb byte, or a body
//! that does not deserialize as the verb's message type each map to a
//! distinct [`WireError`] that the caller answers with
//! `INVALID_PACKET_FORMAT` or skips.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

// ── Verbs ─────────────────────────────────────────────────────────────────────

/// One-byte discriminator at offset 0 of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Verb {
    /// Client → server: `RequestFile`.
    Request = 0,

    /// Server → client: `FileChunk`.
    Response = 1,

    /// Either direction: `Confirmation` (ack, nack, status).
    Confirmation = 2,
}

impl TryFrom<u8> for Verb {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Verb::Request),
            1 => Ok(Verb::Response),
            2 => Ok(Verb::Confirmation),
            other => Err(WireError::UnknownVerb(other)),
        }
    }
}

impl From<Verb> for u8 {
    fn from(v: Verb) -> u8 {
        v as u8
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verb::Request => "REQUEST",
            Verb::Response => "RESPONSE",
            Verb::Confirmation => "CONFIRMATION",
        };
        f.write_str(name)
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// Ask the server for the content at `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFile {
    pub path: String,
}

/// One chunk of the requested content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    /// Canonical token identifier (`token_idx_<offset>`).
    pub token: String,

    /// Raw chunk bytes, hex-encoded on the wire.
    #[serde(with = "hex")]
    pub chunk: Vec<u8>,

    /// Checksum of the whole content. Only carried by the first token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Outcome carried by a [`Confirmation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfirmResult {
    /// Chunk `token` was applied.
    Ok,
    /// Receiver stalled; sender should resend its lowest unacknowledged token.
    PacketMiss,
    /// Ack for a token the sender does not know or already confirmed.
    InvalidToken,
    /// The peer's last datagram could not be decoded.
    InvalidPacketFormat,
    /// The requested path does not exist on the server.
    FileNotFound,
    /// The server could not compute the content checksum.
    ErrorChecksum,
    /// Server: every token acknowledged, `token` carries the checksum.
    /// Client: the checksum matched, transfer is complete.
    ValidChecksum,
}

impl fmt::Display for ConfirmResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfirmResult::Ok => "OK",
            ConfirmResult::PacketMiss => "PACKET_MISS",
            ConfirmResult::InvalidToken => "INVALID_TOKEN",
            ConfirmResult::InvalidPacketFormat => "INVALID_PACKET_FORMAT",
            ConfirmResult::FileNotFound => "FILE_NOT_FOUND",
            ConfirmResult::ErrorChecksum => "ERROR_CHECKSUM",
            ConfirmResult::ValidChecksum => "VALID_CHECKSUM",
        };
        f.write_str(name)
    }
}

/// Acknowledgment / status message.
///
/// `token` is a token identifier for `OK` and `INVALID_TOKEN`, the content
/// checksum for `VALID_CHECKSUM`, and empty otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub result: ConfirmResult,
    #[serde(default)]
    pub token: String,
}

impl Confirmation {
    pub fn new(result: ConfirmResult, token: impl Into<String>) -> Self {
        Self {
            result,
            token: token.into(),
        }
    }

    /// A confirmation with no token attached.
    pub fn bare(result: ConfirmResult) -> Self {
        Self::new(result, String::new())
    }
}

/// Every message that can appear in a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(RequestFile),
    Response(FileChunk),
    Confirmation(Confirmation),
}

impl Message {
    pub fn verb(&self) -> Verb {
        match self {
            Message::Request(_) => Verb::Request,
            Message::Response(_) => Verb::Response,
            Message::Confirmation(_) => Verb::Confirmation,
        }
    }

    /// Frame as `[verb][json]`.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let verb = self.verb();
        let body = match self {
            Message::Request(m) => serde_json::to_vec(m),
            Message::Response(m) => serde_json::to_vec(m),
            Message::Confirmation(m) => serde_json::to_vec(m),
        }
        .map_err(|e| WireError::Encode {
            verb,
            reason: e.to_string(),
        })?;

        let mut frame = BytesMut::with_capacity(1 + body.len());
        frame.put_u8(verb.into());
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }

    /// Parse a whole datagram.
    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        let (verb, body) = split_frame(frame)?;
        let malformed = |e: serde_json::Error| WireError::Malformed {
            verb,
            reason: e.to_string(),
        };
        let message = match verb {
            Verb::Request => Message::Request(serde_json::from_slice(body).map_err(malformed)?),
            Verb::Response => Message::Response(serde_json::from_slice(body).map_err(malformed)?),
            Verb::Confirmation => {
                Message::Confirmation(serde_json::from_slice(body).map_err(malformed)?)
            }
        };
        Ok(message)
    }
}

impl From<RequestFile> for Message {
    fn from(m: RequestFile) -> Self {
        Message::Request(m)
    }
}

impl From<FileChunk> for Message {
    fn from(m: FileChunk) -> Self {
        Message::Response(m)
    }
}

impl From<Confirmation> for Message {
    fn from(m: Confirmation) -> Self {
        Message::Confirmation(m)
    }
}

/// Split a datagram into its verb and raw body.
///
/// Trailing NUL bytes are stripped from the body: peers that send fixed-size
/// zero-padded buffers are still understood.
pub fn split_frame(frame: &[u8]) -> Result<(Verb, &[u8]), WireError> {
    let (&first, rest) = frame.split_first().ok_or(WireError::Empty)?;
    let verb = Verb::try_from(first)?;
    let end = rest.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    Ok((verb, &rest[..end]))
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Default maximum datagram size. Keeps every frame under a typical path MTU.
pub const DEFAULT_MAX_DATAGRAM: usize = 1100;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Upper bound on a `RESPONSE` frame's bytes beyond the hex-encoded chunk:
/// verb byte, JSON punctuation, the token identifier and a checksum.
pub const CHUNK_FRAME_OVERHEAD: usize = 160;

/// Largest encoded `RESPONSE` frame for a given chunk size.
pub const fn chunk_frame_len(chunk_size: usize) -> usize {
    1 + 2 * chunk_size + CHUNK_FRAME_OVERHEAD
}

/// Largest chunk size whose frames fit in `max_datagram`.
pub const fn max_chunk_size(max_datagram: usize) -> usize {
    max_datagram.saturating_sub(1 + CHUNK_FRAME_OVERHEAD) / 2
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty datagram")]
    Empty,

    #[error("unknown verb byte: 0x{0:02x}")]
    UnknownVerb(u8),

    #[error("malformed {verb} payload: {reason}")]
    Malformed { verb: Verb, reason: String },

    #[error("malformed token identifier: {0:?}")]
    BadToken(String),

    #[error("failed to encode {verb} payload: {reason}")]
    Encode { verb: Verb, reason: String },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
