//! Unbuffered file backend

use super::RrdBackend;
use crate::Result;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Backend storing the database image in an ordinary file, one
/// seek + read/write per access
pub struct FileBackend {
    path: PathBuf,
    file: File,
    read_only: bool,
}

impl FileBackend {
    /// Open an existing image
    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            read_only,
        })
    }

    /// Create a fresh image, truncating any existing file
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            read_only: false,
        })
    }
}

impl RrdBackend for FileBackend {
    fn path(&self) -> &Path {
        &self.path
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn length(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_length(&mut self, length: u64) -> Result<()> {
        // set_len zero-fills the extension
        self.file.set_len(length)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.read_only {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_backend_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("t.rrd");

        let mut backend = FileBackend::create(&path).unwrap();
        backend.set_length(64).unwrap();
        assert_eq!(backend.length().unwrap(), 64);

        backend.write(8, &0x1122334455667788u64.to_be_bytes()).unwrap();
        backend.close().unwrap();

        let mut backend = FileBackend::open(&path, true).unwrap();
        let mut buf = [0u8; 8];
        backend.read(8, &mut buf).unwrap();
        assert_eq!(u64::from_be_bytes(buf), 0x1122334455667788);

        // the rest of the image is zero-initialized
        backend.read(16, &mut buf).unwrap();
        assert_eq!(u64::from_be_bytes(buf), 0);
    }

    #[test]
    fn test_read_past_end_fails() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("t.rrd");
        let mut backend = FileBackend::create(&path).unwrap();
        backend.set_length(16).unwrap();
        let mut buf = [0u8; 8];
        assert!(backend.read(12, &mut buf).is_err());
    }
}
