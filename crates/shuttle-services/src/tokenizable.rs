//! Tokenizable file — content split into fixed-size, offset-keyed chunks.
//!
//! The sending side opens existing content, computes its checksum once,
//! and tokenizes it; acknowledgments then mark tokens received until none
//! are pending. The receiving side creates the output, applies chunks at
//! their offsets as they arrive (in any order, duplicates harmless), and
//! finally digests what it wrote.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use shuttle_core::checksum::{ChecksumError, Digester};
use shuttle_core::token::{parse_token_id, token_indices, Token};

use crate::error::SessionError;
use crate::store::{ContentSink, ContentSource, ContentStore, StoreError};

/// Bytes fed to the digester per read while checksumming.
const DIGEST_BLOCK: usize = 64 * 1024;

enum Handle {
    Source(Box<dyn ContentSource>),
    Sink(Box<dyn ContentSink>),
    Closed,
}

/// What [`TokenizableFile::apply_chunk`] did with a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// First time this token was seen; bytes were written.
    Written,
    /// Token already applied; nothing was written.
    Duplicate,
}

pub struct TokenizableFile {
    path: PathBuf,
    handle: Handle,
    size: u64,
    chunk_size: usize,
    tokens: BTreeMap<u64, Token>,
    /// Every token below this offset is acknowledged.
    cursor: u64,
    checksum: Option<String>,
}

impl TokenizableFile {
    // ── Sending side ──────────────────────────────────────────────────────────

    /// Open existing content for chunked reading.
    pub fn open(
        store: &dyn ContentStore,
        path: &Path,
        chunk_size: usize,
    ) -> Result<Self, StoreError> {
        let source = store.open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            size: source.len(),
            handle: Handle::Source(source),
            chunk_size: chunk_size.max(1),
            tokens: BTreeMap::new(),
            cursor: 0,
            checksum: None,
        })
    }

    /// Digest the whole content. Computed once; later calls return the
    /// cached value.
    pub fn compute_checksum(&mut self) -> Result<&str, ChecksumError> {
        if self.checksum.is_none() {
            let sum = match &self.handle {
                Handle::Source(source) => digest_source(source.as_ref())?,
                _ => {
                    return Err(ChecksumError::Io {
                        path: self.path.clone(),
                        source: StoreError::Closed(self.path.clone()).into_io(),
                    })
                }
            };
            self.checksum = Some(sum);
        }
        Ok(self.checksum.as_deref().unwrap_or_default())
    }

    /// Create one pending token per chunk. Returns the token count.
    pub fn tokenize(&mut self) -> usize {
        self.tokens = token_indices(self.size, self.chunk_size)
            .map(|index| (index, Token::new(index)))
            .collect();
        self.cursor = 0;
        self.tokens.len()
    }

    /// Bytes covered by the token at `index`. The last chunk may be short.
    pub fn read_chunk(&self, index: u64) -> Result<Bytes, StoreError> {
        let Handle::Source(source) = &self.handle else {
            return Err(StoreError::Closed(self.path.clone()));
        };
        let len = self
            .size
            .saturating_sub(index)
            .min(self.chunk_size as u64) as usize;
        source.read_at(index, len)
    }

    /// Mark the token named `id` as acknowledged and return its offset.
    pub fn confirm(&mut self, id: &str) -> Result<u64, SessionError> {
        let index = parse_token_id(id).map_err(|_| SessionError::UnknownToken(id.to_string()))?;
        let token = self
            .tokens
            .get_mut(&index)
            .ok_or_else(|| SessionError::UnknownToken(id.to_string()))?;
        if token.received {
            return Err(SessionError::DuplicateAck(id.to_string()));
        }
        token.received = true;
        if index == self.cursor {
            self.cursor = self.pending_from(index).unwrap_or(u64::MAX);
        }
        Ok(index)
    }

    /// Lowest token not yet acknowledged.
    pub fn next_pending(&self) -> Option<u64> {
        self.pending_from(self.cursor)
    }

    pub fn all_received(&self) -> bool {
        self.next_pending().is_none()
    }

    fn pending_from(&self, from: u64) -> Option<u64> {
        self.tokens
            .range(from..)
            .find(|(_, t)| !t.received)
            .map(|(&index, _)| index)
    }

    // ── Receiving side ────────────────────────────────────────────────────────

    /// Create (or truncate) the output for chunked writing.
    pub fn create(store: &dyn ContentStore, path: &Path) -> Result<Self, StoreError> {
        let sink = store.create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            handle: Handle::Sink(sink),
            size: 0,
            chunk_size: 0,
            tokens: BTreeMap::new(),
            cursor: 0,
            checksum: None,
        })
    }

    /// Write a chunk at its offset unless that token was already applied.
    pub fn apply_chunk(&mut self, index: u64, data: &[u8]) -> Result<Applied, StoreError> {
        if self.tokens.contains_key(&index) {
            return Ok(Applied::Duplicate);
        }
        let end = index
            .checked_add(data.len() as u64)
            .ok_or_else(|| StoreError::OutOfRange {
                path: self.path.clone(),
                offset: index,
                len: data.len(),
                size: self.size,
            })?;
        let Handle::Sink(sink) = &mut self.handle else {
            return Err(StoreError::Closed(self.path.clone()));
        };
        sink.write_at(index, data)?;

        self.tokens.insert(
            index,
            Token {
                index,
                received: true,
            },
        );
        self.size = self.size.max(end);
        self.chunk_size = self.chunk_size.max(data.len());
        Ok(Applied::Written)
    }

    /// Flush and close the output, then digest what was written.
    pub fn verify(&mut self, store: &dyn ContentStore) -> Result<String, SessionError> {
        self.close()?;
        let source = store.open(&self.path).map_err(|e| ChecksumError::Io {
            path: self.path.clone(),
            source: e.into_io(),
        })?;
        Ok(digest_source(source.as_ref())?)
    }

    /// Close and delete the content.
    pub fn discard(mut self, store: &dyn ContentStore) -> Result<(), StoreError> {
        // The delete matters more than a clean flush.
        let _ = self.close();
        store.delete(&self.path)
    }

    // ── Both sides ────────────────────────────────────────────────────────────

    /// Release the underlying handle. Writers are flushed first.
    pub fn close(&mut self) -> Result<(), StoreError> {
        match std::mem::replace(&mut self.handle, Handle::Closed) {
            Handle::Sink(mut sink) => sink.close(),
            Handle::Source(_) | Handle::Closed => Ok(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn token(&self, index: u64) -> Option<&Token> {
        self.tokens.get(&index)
    }

    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    pub fn set_checksum(&mut self, checksum: String) {
        self.checksum = Some(checksum);
    }
}

fn digest_source(source: &dyn ContentSource) -> Result<String, ChecksumError> {
    let mut digester = Digester::new();
    let size = source.len();
    let mut offset = 0u64;
    while offset < size {
        let len = (size - offset).min(DIGEST_BLOCK as u64) as usize;
        let block = source.read_at(offset, len).map_err(|e| ChecksumError::Io {
            path: source.path().to_path_buf(),
            source: e.into_io(),
        })?;
        digester.update(&block);
        offset += len as u64;
    }
    Ok(digester.finish())
}
