//! Token addressing — one token per fixed-size chunk, keyed by byte offset.
//!
//! A token's wire identifier is `token_idx_<offset>`. Only the canonical
//! form is accepted back: `token_idx_007` or `token_idx_+7` are rejected so
//! that every identifier maps to exactly one offset and back.

use crate::wire::WireError;

/// Prefix of every token identifier.
pub const TOKEN_PREFIX: &str = "token_idx_";

/// One chunk of a file, identified by its byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    /// Byte offset of the chunk. Always a multiple of the chunk size.
    pub index: u64,
    /// Set once the chunk is acknowledged (sender) or applied (receiver).
    /// Never cleared.
    pub received: bool,
}

impl Token {
    pub fn new(index: u64) -> Self {
        Self {
            index,
            received: false,
        }
    }

    /// Wire identifier of this token.
    pub fn id(&self) -> String {
        token_id(self.index)
    }
}

/// Canonical identifier for the chunk at `index`.
pub fn token_id(index: u64) -> String {
    format!("{TOKEN_PREFIX}{index}")
}

/// Parse a token identifier back into its byte offset.
pub fn parse_token_id(id: &str) -> Result<u64, WireError> {
    let bad = || WireError::BadToken(id.to_string());
    let digits = id.strip_prefix(TOKEN_PREFIX).ok_or_else(bad)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return Err(bad());
    }
    digits.parse().map_err(|_| bad())
}

/// Offsets of every token covering `[0, size)` in strides of `chunk_size`.
pub fn token_indices(size: u64, chunk_size: usize) -> impl Iterator<Item = u64> {
    let stride = chunk_size.max(1);
    (0..size).step_by(stride)
}

/// `ceil(size / chunk_size)`.
pub fn token_count(size: u64, chunk_size: usize) -> usize {
    let stride = chunk_size.max(1) as u64;
    size.div_ceil(stride) as usize
}
