//! Storage backends
//!
//! A backend is a byte-addressable persistent store for one database
//! image. The container owns exactly one backend and serializes all
//! access to it; backends only have to honor the read/write/length
//! contract, never locking.

mod file;
mod memory;
mod mmap;

pub use file::FileBackend;
pub use memory::{BlobStore, MemBlobStore, MemoryBackend};
pub use mmap::MmapBackend;

use crate::Result;
use bytes::{Buf, BufMut, BytesMut};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Contract for byte-addressable persistent storage
pub trait RrdBackend: Send {
    /// Path identifying the underlying image
    fn path(&self) -> &Path;

    /// Read `buf.len()` bytes starting at `offset`
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` starting at `offset`
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Current image length in bytes
    fn length(&self) -> Result<u64>;

    /// Size the image; called exactly once at creation, zero-initializes
    fn set_length(&mut self, length: u64) -> Result<()>;

    /// Flush pending writes and release resources
    fn close(&mut self) -> Result<()>;

    /// Whether the frontend may cache immutable definition cells in RAM
    fn caching_allowed(&self) -> bool {
        true
    }
}

/// Backend selection for opening or creating a database
#[derive(Clone)]
pub enum BackendType {
    /// Unbuffered file I/O
    File,
    /// Memory-mapped file with periodic background flush
    Mmap {
        /// Time between background flushes of dirty pages
        sync_period: Duration,
    },
    /// Whole image kept in memory, written back to a blob store on close
    Memory { store: Arc<dyn BlobStore> },
}

impl Default for BackendType {
    fn default() -> Self {
        BackendType::File
    }
}

impl BackendType {
    /// Memory-mapped storage with the default sync period
    pub fn mmap() -> Self {
        BackendType::Mmap {
            sync_period: Duration::from_secs(crate::config::DEFAULT_SYNC_PERIOD_SECS),
        }
    }

    /// Open an existing database image
    pub fn open(&self, path: &Path, read_only: bool) -> Result<Box<dyn RrdBackend>> {
        match self {
            BackendType::File => Ok(Box::new(FileBackend::open(path, read_only)?)),
            BackendType::Mmap { sync_period } => {
                Ok(Box::new(MmapBackend::open(path, read_only, *sync_period)?))
            }
            BackendType::Memory { store } => {
                Ok(Box::new(MemoryBackend::open(path, store.clone())?))
            }
        }
    }

    /// Create a fresh database image, truncating anything at `path`
    pub fn create(&self, path: &Path) -> Result<Box<dyn RrdBackend>> {
        match self {
            BackendType::File => Ok(Box::new(FileBackend::create(path)?)),
            BackendType::Mmap { sync_period } => {
                Ok(Box::new(MmapBackend::create(path, *sync_period)?))
            }
            BackendType::Memory { store } => {
                Ok(Box::new(MemoryBackend::create(path, store.clone())?))
            }
        }
    }
}

/// Typed big-endian accessors over a backend
///
/// All multi-byte values on disk are big-endian; doubles are stored
/// bit-exact so NaN payloads survive a round trip.
pub struct Storage {
    backend: Box<dyn RrdBackend>,
}

impl Storage {
    pub(crate) fn new(backend: Box<dyn RrdBackend>) -> Self {
        Self { backend }
    }

    pub(crate) fn path(&self) -> &Path {
        self.backend.path()
    }

    pub(crate) fn caching_allowed(&self) -> bool {
        self.backend.caching_allowed()
    }

    pub(crate) fn length(&self) -> Result<u64> {
        self.backend.length()
    }

    pub(crate) fn set_length(&mut self, length: u64) -> Result<()> {
        self.backend.set_length(length)
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        self.backend.close()
    }

    pub(crate) fn read_bytes(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.backend.read(offset, &mut buf)?;
        Ok(buf)
    }

    pub(crate) fn write_bytes(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.backend.write(offset, buf)
    }

    pub(crate) fn read_long(&mut self, offset: u64) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.backend.read(offset, &mut buf)?;
        Ok((&buf[..]).get_i64())
    }

    pub(crate) fn write_long(&mut self, offset: u64, value: i64) -> Result<()> {
        self.backend.write(offset, &value.to_be_bytes())
    }

    pub(crate) fn read_double(&mut self, offset: u64) -> Result<f64> {
        let mut buf = [0u8; 8];
        self.backend.read(offset, &mut buf)?;
        Ok(f64::from_bits((&buf[..]).get_u64()))
    }

    pub(crate) fn write_double(&mut self, offset: u64, value: f64) -> Result<()> {
        self.backend.write(offset, &value.to_bits().to_be_bytes())
    }

    pub(crate) fn read_doubles(&mut self, offset: u64, count: usize) -> Result<Vec<f64>> {
        let buf = self.read_bytes(offset, count * 8)?;
        let mut cursor = &buf[..];
        Ok((0..count).map(|_| f64::from_bits(cursor.get_u64())).collect())
    }

    pub(crate) fn write_doubles(&mut self, offset: u64, values: &[f64]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(values.len() * 8);
        for value in values {
            buf.put_u64(value.to_bits());
        }
        self.backend.write(offset, &buf)
    }
}
