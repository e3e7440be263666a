use std::time::Duration;

use shuttle_core::checksum::ChecksumError;
use shuttle_core::{ConfirmResult, WireError};

use crate::store::StoreError;

/// Everything that can go wrong inside one transfer session, on either side.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("undecodable datagram: {0}")]
    Decode(#[from] WireError),

    #[error("requested content {0:?} not found")]
    ContentNotFound(String),

    #[error(transparent)]
    Checksum(#[from] ChecksumError),

    #[error("checksum mismatch: server sent {expected}, received content hashes to {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("unknown token {0:?}")]
    UnknownToken(String),

    #[error("token {0:?} was already acknowledged")]
    DuplicateAck(String),

    #[error("no traffic for {0:?}, giving up on the session")]
    SessionTimeout(Duration),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("encoded request is {len} bytes, max datagram is {max}")]
    RequestTooLarge { len: usize, max: usize },

    #[error("server ended the transfer with {0}")]
    Rejected(ConfirmResult),
}

impl SessionError {
    /// The confirmation owed to the peer when this error ends or interrupts a
    /// session. `None` means the peer is not told anything.
    pub fn result(&self) -> Option<ConfirmResult> {
        match self {
            SessionError::Decode(_) => Some(ConfirmResult::InvalidPacketFormat),
            SessionError::ContentNotFound(_) => Some(ConfirmResult::FileNotFound),
            SessionError::Checksum(_) => Some(ConfirmResult::ErrorChecksum),
            SessionError::UnknownToken(_) | SessionError::DuplicateAck(_) => {
                Some(ConfirmResult::InvalidToken)
            }
            _ => None,
        }
    }
}
