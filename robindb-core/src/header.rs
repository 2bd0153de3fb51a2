//! Database header

use crate::backend::Storage;
use crate::cell::{IntCell, LongCell, RrdAllocator, NUMERIC_CELL_SIZE};
use crate::types::Timestamp;
use crate::{Result, RrdError};

/// Magic bytes opening every database image
pub const SIGNATURE: &[u8; 3] = b"RRD";

/// Header block: signature, version tag, step, last-update timestamp
/// and the immutable datasource/archive counts
pub(crate) struct Header {
    last_update: LongCell,

    // definition, immutable after creation
    version: i32,
    step: i64,
    ds_count: usize,
    arc_count: usize,
}

impl Header {
    /// Total header width in bytes
    pub(crate) const SIZE: u64 = 3 + 4 + 4 * NUMERIC_CELL_SIZE;

    /// Lay out and write a fresh header
    pub(crate) fn create(
        alloc: &mut RrdAllocator,
        st: &mut Storage,
        version: i32,
        step: i64,
        start: Timestamp,
        ds_count: usize,
        arc_count: usize,
    ) -> Result<Self> {
        let sig_offset = alloc.allocate(3);
        let ver_offset = alloc.allocate(4);
        let mut step_cell = LongCell::new(alloc, true);
        let mut last_update = LongCell::new(alloc, false);
        let mut ds_count_cell = IntCell::new(alloc, true);
        let mut arc_count_cell = IntCell::new(alloc, true);

        st.write_bytes(sig_offset, SIGNATURE)?;
        st.write_bytes(ver_offset, format!("{:04}", version).as_bytes())?;
        step_cell.set(st, step)?;
        last_update.set(st, start)?;
        ds_count_cell.set(st, ds_count as i32)?;
        arc_count_cell.set(st, arc_count as i32)?;

        Ok(Self {
            last_update,
            version,
            step,
            ds_count,
            arc_count,
        })
    }

    /// Lay out and read an existing header, validating the signature
    pub(crate) fn open(alloc: &mut RrdAllocator, st: &mut Storage) -> Result<Self> {
        let sig_offset = alloc.allocate(3);
        let ver_offset = alloc.allocate(4);
        let mut step_cell = LongCell::new(alloc, true);
        let mut last_update = LongCell::new(alloc, false);
        let mut ds_count_cell = IntCell::new(alloc, true);
        let mut arc_count_cell = IntCell::new(alloc, true);

        let sig = st.read_bytes(sig_offset, 3)?;
        if sig != SIGNATURE {
            return Err(RrdError::InvalidArgument(format!(
                "Invalid signature in {:?}",
                st.path()
            )));
        }
        let tag = st.read_bytes(ver_offset, 4)?;
        let version = std::str::from_utf8(&tag)
            .ok()
            .and_then(|s| s.parse::<i32>().ok())
            .ok_or_else(|| {
                RrdError::InvalidArgument(format!("Invalid version tag in {:?}", st.path()))
            })?;
        if version != 1 && version != 2 {
            return Err(RrdError::InvalidArgument(format!(
                "Unsupported version [{:04}] in {:?}",
                version,
                st.path()
            )));
        }

        let step = step_cell.get(st)?;
        let ds_count = ds_count_cell.get(st)? as usize;
        let arc_count = arc_count_cell.get(st)? as usize;
        if step <= 0 || ds_count == 0 || arc_count == 0 {
            return Err(RrdError::InvalidArgument(format!(
                "Corrupted header in {:?}",
                st.path()
            )));
        }

        Ok(Self {
            last_update,
            version,
            step,
            ds_count,
            arc_count,
        })
    }

    pub(crate) fn version(&self) -> i32 {
        self.version
    }

    pub(crate) fn step(&self) -> i64 {
        self.step
    }

    pub(crate) fn ds_count(&self) -> usize {
        self.ds_count
    }

    pub(crate) fn arc_count(&self) -> usize {
        self.arc_count
    }

    pub(crate) fn last_update(&mut self, st: &mut Storage) -> Result<Timestamp> {
        self.last_update.get(st)
    }

    pub(crate) fn set_last_update(&mut self, st: &mut Storage, time: Timestamp) -> Result<()> {
        self.last_update.set(st, time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendType;
    use tempfile::TempDir;

    fn scratch(size: u64) -> (TempDir, Storage) {
        let temp_dir = TempDir::new().unwrap();
        let backend = BackendType::File
            .create(&temp_dir.path().join("h.rrd"))
            .unwrap();
        let mut st = Storage::new(backend);
        st.set_length(size).unwrap();
        (temp_dir, st)
    }

    #[test]
    fn test_header_round_trip() {
        let (_dir, mut st) = scratch(Header::SIZE);
        let mut alloc = RrdAllocator::new();
        let mut header =
            Header::create(&mut alloc, &mut st, 2, 300, 1_000_000_000, 3, 4).unwrap();
        assert_eq!(alloc.allocated(), Header::SIZE);
        header.set_last_update(&mut st, 1_000_000_300).unwrap();

        let mut alloc = RrdAllocator::new();
        let mut header = Header::open(&mut alloc, &mut st).unwrap();
        assert_eq!(header.version(), 2);
        assert_eq!(header.step(), 300);
        assert_eq!(header.ds_count(), 3);
        assert_eq!(header.arc_count(), 4);
        assert_eq!(header.last_update(&mut st).unwrap(), 1_000_000_300);
    }

    #[test]
    fn test_bad_signature_rejected() {
        let (_dir, mut st) = scratch(Header::SIZE);
        st.write_bytes(0, b"XXX0001").unwrap();
        let mut alloc = RrdAllocator::new();
        assert!(matches!(
            Header::open(&mut alloc, &mut st),
            Err(RrdError::InvalidArgument(_))
        ));
    }
}
