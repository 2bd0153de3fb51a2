//! Blob-in-store backend
//!
//! Keeps the whole database image in memory and exchanges it with a
//! key-value blob store in one shot: the image is read at open and
//! written back at close. Definition caching in the frontend is
//! pointless here, every byte is already in RAM.

use super::RrdBackend;
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Minimal key-value contract for image storage, keyed by path
pub trait BlobStore: Send + Sync {
    /// Fetch the blob stored under `key`, if any
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Store `data` under `key`, replacing any previous blob
    fn put(&self, key: &str, data: Vec<u8>);
}

/// In-process blob store backed by a hash map
#[derive(Default)]
pub struct MemBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored images
    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

impl BlobStore for MemBlobStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.lock().get(key).cloned()
    }

    fn put(&self, key: &str, data: Vec<u8>) {
        self.blobs.lock().insert(key.to_string(), data);
    }
}

/// Backend holding the image in a byte buffer, persisted through a
/// [`BlobStore`] on close
pub struct MemoryBackend {
    path: PathBuf,
    key: String,
    buffer: Vec<u8>,
    store: Arc<dyn BlobStore>,
}

impl MemoryBackend {
    /// Open an image previously stored under `path`
    pub fn open(path: &Path, store: Arc<dyn BlobStore>) -> Result<Self> {
        let key = path.to_string_lossy().into_owned();
        let buffer = store.get(&key).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no blob stored for {:?}", path))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            key,
            buffer,
            store,
        })
    }

    /// Create an empty image; sized later by `set_length`
    pub fn create(path: &Path, store: Arc<dyn BlobStore>) -> Result<Self> {
        let key = path.to_string_lossy().into_owned();
        Ok(Self {
            path: path.to_path_buf(),
            key,
            buffer: Vec::new(),
            store,
        })
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<()> {
        if offset as usize + len > self.buffer.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("access past end of {:?}", self.path),
            )
            .into());
        }
        Ok(())
    }
}

impl RrdBackend for MemoryBackend {
    fn path(&self) -> &Path {
        &self.path
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.buffer[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        let start = offset as usize;
        self.buffer[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn length(&self) -> Result<u64> {
        Ok(self.buffer.len() as u64)
    }

    fn set_length(&mut self, length: u64) -> Result<()> {
        self.buffer = vec![0u8; length as usize];
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.store.put(&self.key, std::mem::take(&mut self.buffer));
        Ok(())
    }

    fn caching_allowed(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend_write_back_on_close() {
        let store: Arc<MemBlobStore> = Arc::new(MemBlobStore::new());
        let path = Path::new("mem://a.rrd");

        let mut backend = MemoryBackend::create(path, store.clone()).unwrap();
        backend.set_length(16).unwrap();
        backend.write(4, &[1, 2, 3, 4]).unwrap();
        assert!(store.is_empty(), "image written back only on close");
        backend.close().unwrap();
        assert_eq!(store.len(), 1);

        let mut backend = MemoryBackend::open(path, store.clone()).unwrap();
        assert_eq!(backend.length().unwrap(), 16);
        let mut buf = [0u8; 4];
        backend.read(4, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert!(!backend.caching_allowed());
    }

    #[test]
    fn test_open_missing_blob_fails() {
        let store: Arc<MemBlobStore> = Arc::new(MemBlobStore::new());
        assert!(MemoryBackend::open(Path::new("mem://missing"), store).is_err());
    }
}
