//! Content checksums — BLAKE3, hex-encoded.
//!
//! The sender digests the content it is about to tokenize; the receiver
//! digests the file it wrote. Both sides must produce the same string for the
//! same bytes, so everything here goes through one hasher configuration.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Hex digest of an in-memory buffer.
pub fn digest(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Hex digest of a file on disk, streamed.
pub fn digest_file(path: &Path) -> Result<String, ChecksumError> {
    let io_err = |source| ChecksumError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(io_err)?;
    let mut digester = Digester::new();
    io::copy(&mut file, &mut digester.hasher).map_err(io_err)?;
    Ok(digester.finish())
}

/// Incremental digest for content read piecewise.
#[derive(Default)]
pub struct Digester {
    hasher: blake3::Hasher,
}

impl Digester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finish(self) -> String {
        self.hasher.finalize().to_hex().to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("failed to read {} for checksum: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic_hex() {
        let a = digest(b"shuttle");
        let b = digest(b"shuttle");
        let c = digest(b"shuttle!");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn incremental_matches_one_shot() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let mut d = Digester::new();
        for piece in data.chunks(333) {
            d.update(piece);
        }
        assert_eq!(d.finish(), digest(&data));
    }

    #[test]
    fn file_digest_matches_buffer_digest() {
        let path = std::env::temp_dir().join(format!("shuttle-checksum-{}", std::process::id()));
        std::fs::write(&path, b"file contents").unwrap();
        assert_eq!(digest_file(&path).unwrap(), digest(b"file contents"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_a_checksum_error() {
        let err = digest_file(Path::new("/nonexistent/shuttle/file")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/shuttle/file"));
    }
}
