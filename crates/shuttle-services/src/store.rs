//! Content store — where chunk bytes are read from and written to.
//!
//! The protocol only needs sequential content addressed by offset:
//! open / read-at-offset on the sending side, create / write-at-offset /
//! close / delete on the receiving side. [`FsStore`] backs this with the
//! local file system; reads go through a read-only memory map so a chunk
//! read is a slice copy with the page cache doing the I/O.

use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use memmap2::Mmap;

/// Opens content for reading and writing.
pub trait ContentStore: Send + Sync {
    /// Open existing content for reading. Missing or unreadable content is
    /// [`StoreError::NotFound`].
    fn open(&self, path: &Path) -> Result<Box<dyn ContentSource>, StoreError>;

    /// Create (or truncate) content for writing.
    fn create(&self, path: &Path) -> Result<Box<dyn ContentSink>, StoreError>;

    /// Remove content. Removing something that is already gone is not an error.
    fn delete(&self, path: &Path) -> Result<(), StoreError>;
}

/// Read side of an open content handle.
pub trait ContentSource: Send + Sync {
    fn path(&self) -> &Path;

    /// Total size in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read exactly `len` bytes starting at `offset`.
    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, StoreError>;
}

/// Write side of an open content handle.
pub trait ContentSink: Send + Sync {
    fn path(&self) -> &Path;

    /// Write `data` at `offset`, extending the content if needed.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), StoreError>;

    /// Flush to durable storage and release the handle. Further writes fail.
    fn close(&mut self) -> Result<(), StoreError>;
}

// ── File system store ─────────────────────────────────────────────────────────

/// [`ContentStore`] over the local file system.
#[derive(Debug, Clone, Default)]
pub struct FsStore;

impl FsStore {
    pub fn new() -> Self {
        Self
    }
}

impl ContentStore for FsStore {
    fn open(&self, path: &Path) -> Result<Box<dyn ContentSource>, StoreError> {
        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                StoreError::NotFound(path.to_path_buf())
            }
            _ => StoreError::io(path, e),
        })?;
        let meta = file.metadata().map_err(|e| StoreError::io(path, e))?;
        if !meta.is_file() {
            return Err(StoreError::NotFound(path.to_path_buf()));
        }

        // Zero-length files cannot be mapped.
        let map = if meta.len() == 0 {
            None
        } else {
            // Safety: mapped read-only and never handed out mutably
            let map = unsafe { Mmap::map(&file) }.map_err(|e| StoreError::io(path, e))?;
            Some(map)
        };

        tracing::trace!(path = %path.display(), bytes = meta.len(), "content opened");
        Ok(Box::new(FsSource {
            path: path.to_path_buf(),
            map,
        }))
    }

    fn create(&self, path: &Path) -> Result<Box<dyn ContentSink>, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let file = File::create(path).map_err(|e| StoreError::io(path, e))?;
        tracing::trace!(path = %path.display(), "content created");
        Ok(Box::new(FsSink {
            path: path.to_path_buf(),
            file: Some(file),
        }))
    }

    fn delete(&self, path: &Path) -> Result<(), StoreError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }
}

struct FsSource {
    path: PathBuf,
    map: Option<Mmap>,
}

impl ContentSource for FsSource {
    fn path(&self) -> &Path {
        &self.path
    }

    fn len(&self) -> u64 {
        self.map.as_ref().map_or(0, |m| m.len() as u64)
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, StoreError> {
        let data: &[u8] = self.map.as_deref().unwrap_or(&[]);
        let start = usize::try_from(offset).ok();
        let end = start.and_then(|s| s.checked_add(len));
        match (start, end) {
            (Some(start), Some(end)) if end <= data.len() => {
                Ok(Bytes::copy_from_slice(&data[start..end]))
            }
            _ => Err(StoreError::OutOfRange {
                path: self.path.clone(),
                offset,
                len,
                size: data.len() as u64,
            }),
        }
    }
}

struct FsSink {
    path: PathBuf,
    file: Option<File>,
}

impl ContentSink for FsSink {
    fn path(&self) -> &Path {
        &self.path
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), StoreError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StoreError::Closed(self.path.clone()))?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(data))
            .map_err(|e| StoreError::io(&self.path, e))
    }

    fn close(&mut self) -> Result<(), StoreError> {
        match self.file.take() {
            Some(file) => file.sync_all().map_err(|e| StoreError::io(&self.path, e)),
            None => Ok(()),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{} not found", .0.display())]
    NotFound(PathBuf),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("read of {len} bytes at offset {offset} is outside {} ({size} bytes)", path.display())]
    OutOfRange {
        path: PathBuf,
        offset: u64,
        len: usize,
        size: u64,
    },

    #[error("{} is already closed", .0.display())]
    Closed(PathBuf),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Collapse into an `io::Error`, keeping the message.
    pub fn into_io(self) -> io::Error {
        match self {
            StoreError::Io { source, .. } => source,
            StoreError::NotFound(_) => io::Error::new(io::ErrorKind::NotFound, self.to_string()),
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}
