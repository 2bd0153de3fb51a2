//! Memory-mapped file backend with periodic background flush

use super::RrdBackend;
use crate::Result;
use crossbeam_channel::{bounded, select, tick, Sender};
use memmap2::{Mmap, MmapMut};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

enum MapState {
    /// No mapping yet; only valid before `set_length` on a fresh image
    Unmapped,
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

/// Backend keeping the database image in a memory-mapped file.
///
/// Writes land in the page cache; a background thread flushes dirty
/// pages every `sync_period`. The map mutex serializes flushes with
/// in-flight reads and writes.
pub struct MmapBackend {
    path: PathBuf,
    file: File,
    map: Arc<Mutex<MapState>>,
    read_only: bool,
    stop_tx: Option<Sender<()>>,
    flusher: Option<JoinHandle<()>>,
}

impl MmapBackend {
    /// Open an existing image
    pub fn open(path: &Path, read_only: bool, sync_period: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        let state = if read_only {
            MapState::ReadOnly(unsafe { Mmap::map(&file)? })
        } else {
            MapState::ReadWrite(unsafe { MmapMut::map_mut(&file)? })
        };
        Ok(Self::build(path, file, state, read_only, sync_period))
    }

    /// Create a fresh image; the mapping is established by `set_length`
    pub fn create(path: &Path, sync_period: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::build(path, file, MapState::Unmapped, false, sync_period))
    }

    fn build(
        path: &Path,
        file: File,
        state: MapState,
        read_only: bool,
        sync_period: Duration,
    ) -> Self {
        let map = Arc::new(Mutex::new(state));
        let (stop_tx, flusher) = if read_only {
            (None, None)
        } else {
            let (tx, rx) = bounded::<()>(1);
            let map = map.clone();
            let path = path.to_path_buf();
            let handle = std::thread::spawn(move || {
                let ticker = tick(sync_period);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            if let MapState::ReadWrite(m) = &*map.lock() {
                                if let Err(e) = m.flush() {
                                    tracing::warn!("Background sync of {:?} failed: {}", path, e);
                                } else {
                                    tracing::trace!("Synced {:?}", path);
                                }
                            }
                        }
                        recv(rx) -> _ => break,
                    }
                }
            });
            (Some(tx), Some(handle))
        };
        Self {
            path: path.to_path_buf(),
            file,
            map,
            read_only,
            stop_tx,
            flusher,
        }
    }

    fn stop_flusher(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
    }
}

impl RrdBackend for MmapBackend {
    fn path(&self) -> &Path {
        &self.path
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let map = self.map.lock();
        let bytes: &[u8] = match &*map {
            MapState::Unmapped => {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "image not sized").into())
            }
            MapState::ReadOnly(m) => m,
            MapState::ReadWrite(m) => m,
        };
        let start = offset as usize;
        let end = start + buf.len();
        if end > bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read past end of {:?}", self.path),
            )
            .into());
        }
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut map = self.map.lock();
        let bytes: &mut [u8] = match &mut *map {
            MapState::ReadWrite(m) => m,
            _ => {
                return Err(
                    io::Error::new(io::ErrorKind::PermissionDenied, "read-only mapping").into(),
                )
            }
        };
        let start = offset as usize;
        let end = start + buf.len();
        if end > bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("write past end of {:?}", self.path),
            )
            .into());
        }
        bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn length(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_length(&mut self, length: u64) -> Result<()> {
        let mut map = self.map.lock();
        // drop the old mapping before resizing the file under it
        *map = MapState::Unmapped;
        self.file.set_len(length)?;
        *map = MapState::ReadWrite(unsafe { MmapMut::map_mut(&self.file)? });
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.stop_flusher();
        let mut map = self.map.lock();
        if let MapState::ReadWrite(m) = &*map {
            m.flush()?;
        }
        *map = MapState::Unmapped;
        drop(map);
        if !self.read_only {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

impl Drop for MmapBackend {
    fn drop(&mut self) {
        self.stop_flusher();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mmap_backend_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("t.rrd");

        let mut backend = MmapBackend::create(&path, Duration::from_secs(300)).unwrap();
        backend.set_length(32).unwrap();
        backend.write(0, b"RRD").unwrap();
        backend.write(24, &12345u64.to_be_bytes()).unwrap();
        backend.close().unwrap();
        drop(backend);

        let mut backend = MmapBackend::open(&path, true, Duration::from_secs(300)).unwrap();
        let mut sig = [0u8; 3];
        backend.read(0, &mut sig).unwrap();
        assert_eq!(&sig, b"RRD");
        let mut buf = [0u8; 8];
        backend.read(24, &mut buf).unwrap();
        assert_eq!(u64::from_be_bytes(buf), 12345);

        // writes are rejected on a read-only mapping
        assert!(backend.write(0, b"X").is_err());
        backend.close().unwrap();
    }

    #[test]
    fn test_background_flush_persists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("t.rrd");

        let mut backend = MmapBackend::create(&path, Duration::from_millis(20)).unwrap();
        backend.set_length(16).unwrap();
        backend.write(0, &7u64.to_be_bytes()).unwrap();
        std::thread::sleep(Duration::from_millis(80));
        backend.close().unwrap();

        let mut backend = MmapBackend::open(&path, true, Duration::from_secs(300)).unwrap();
        let mut buf = [0u8; 8];
        backend.read(0, &mut buf).unwrap();
        assert_eq!(u64::from_be_bytes(buf), 7);
        backend.close().unwrap();
    }
}
