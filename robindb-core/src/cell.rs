//! Primitive cells
//!
//! A cell is a typed handle to a fixed offset in the database image.
//! Offsets are handed out by [`RrdAllocator`] while the container walks
//! the schema; in create mode the walk writes initial values, in open
//! mode it re-reads them, so both walks land on identical offsets.
//!
//! Cells marked constant cache their value in RAM on first access when
//! the backend permits it (file-backed images do, in-memory images have
//! nothing to gain).

use crate::backend::Storage;
use crate::{Result, RrdError};
use bytes::{Buf, BufMut, BytesMut};

/// Width of every numeric cell in bytes
pub(crate) const NUMERIC_CELL_SIZE: u64 = 8;

/// Fixed string cell capacity in UTF-16 code units
pub(crate) const STRING_LENGTH: usize = 20;

/// String cell width: content units plus a terminator, two bytes each
pub(crate) const STRING_CELL_SIZE: u64 = ((STRING_LENGTH + 1) * 2) as u64;

/// Sequential offset allocator for one database image
pub struct RrdAllocator {
    offset: u64,
}

impl RrdAllocator {
    pub(crate) fn new() -> Self {
        Self { offset: 0 }
    }

    /// Reserve `size` bytes, returning their starting offset
    pub(crate) fn allocate(&mut self, size: u64) -> u64 {
        let offset = self.offset;
        self.offset += size;
        offset
    }

    /// Total bytes allocated so far
    pub(crate) fn allocated(&self) -> u64 {
        self.offset
    }
}

/// 32-bit integer cell, stored in an 8-byte big-endian slot
pub(crate) struct IntCell {
    offset: u64,
    constant: bool,
    cached: Option<i32>,
}

impl IntCell {
    pub(crate) fn new(alloc: &mut RrdAllocator, constant: bool) -> Self {
        Self {
            offset: alloc.allocate(NUMERIC_CELL_SIZE),
            constant,
            cached: None,
        }
    }

    pub(crate) fn get(&mut self, st: &mut Storage) -> Result<i32> {
        if let Some(value) = self.cached {
            return Ok(value);
        }
        let value = st.read_long(self.offset)? as i32;
        if self.constant && st.caching_allowed() {
            self.cached = Some(value);
        }
        Ok(value)
    }

    pub(crate) fn set(&mut self, st: &mut Storage, value: i32) -> Result<()> {
        st.write_long(self.offset, value as i64)?;
        if self.constant && st.caching_allowed() {
            self.cached = Some(value);
        }
        Ok(())
    }
}

/// 64-bit integer cell
pub(crate) struct LongCell {
    offset: u64,
    constant: bool,
    cached: Option<i64>,
}

impl LongCell {
    pub(crate) fn new(alloc: &mut RrdAllocator, constant: bool) -> Self {
        Self {
            offset: alloc.allocate(NUMERIC_CELL_SIZE),
            constant,
            cached: None,
        }
    }

    pub(crate) fn get(&mut self, st: &mut Storage) -> Result<i64> {
        if let Some(value) = self.cached {
            return Ok(value);
        }
        let value = st.read_long(self.offset)?;
        if self.constant && st.caching_allowed() {
            self.cached = Some(value);
        }
        Ok(value)
    }

    pub(crate) fn set(&mut self, st: &mut Storage, value: i64) -> Result<()> {
        st.write_long(self.offset, value)?;
        if self.constant && st.caching_allowed() {
            self.cached = Some(value);
        }
        Ok(())
    }
}

/// IEEE-754 double cell, NaN preserved bit-exactly
pub(crate) struct DoubleCell {
    offset: u64,
    constant: bool,
    cached: Option<f64>,
}

impl DoubleCell {
    pub(crate) fn new(alloc: &mut RrdAllocator, constant: bool) -> Self {
        Self {
            offset: alloc.allocate(NUMERIC_CELL_SIZE),
            constant,
            cached: None,
        }
    }

    pub(crate) fn get(&mut self, st: &mut Storage) -> Result<f64> {
        if let Some(value) = self.cached {
            return Ok(value);
        }
        let value = st.read_double(self.offset)?;
        if self.constant && st.caching_allowed() {
            self.cached = Some(value);
        }
        Ok(value)
    }

    pub(crate) fn set(&mut self, st: &mut Storage, value: f64) -> Result<()> {
        st.write_double(self.offset, value)?;
        if self.constant && st.caching_allowed() {
            self.cached = Some(value);
        }
        Ok(())
    }
}

/// Fixed-width string cell: 20 UTF-16 code units padded with spaces,
/// followed by a NUL terminator unit
pub(crate) struct StringCell {
    offset: u64,
    constant: bool,
    cached: Option<String>,
}

impl StringCell {
    pub(crate) fn new(alloc: &mut RrdAllocator, constant: bool) -> Self {
        Self {
            offset: alloc.allocate(STRING_CELL_SIZE),
            constant,
            cached: None,
        }
    }

    pub(crate) fn get(&mut self, st: &mut Storage) -> Result<String> {
        if let Some(value) = &self.cached {
            return Ok(value.clone());
        }
        let buf = st.read_bytes(self.offset, STRING_CELL_SIZE as usize)?;
        let mut cursor = &buf[..];
        let units: Vec<u16> = (0..STRING_LENGTH).map(|_| cursor.get_u16()).collect();
        let value = String::from_utf16(&units)
            .map_err(|_| RrdError::InvalidArgument("Malformed string cell".to_string()))?
            .trim_end()
            .to_string();
        if self.constant && st.caching_allowed() {
            self.cached = Some(value.clone());
        }
        Ok(value)
    }

    pub(crate) fn set(&mut self, st: &mut Storage, value: &str) -> Result<()> {
        let units: Vec<u16> = value.encode_utf16().collect();
        if units.len() > STRING_LENGTH {
            return Err(RrdError::InvalidArgument(format!(
                "String [{}] longer than {} characters",
                value, STRING_LENGTH
            )));
        }
        let mut buf = BytesMut::with_capacity(STRING_CELL_SIZE as usize);
        for unit in &units {
            buf.put_u16(*unit);
        }
        for _ in units.len()..STRING_LENGTH {
            buf.put_u16(0x0020);
        }
        buf.put_u16(0);
        st.write_bytes(self.offset, &buf)?;
        if self.constant && st.caching_allowed() {
            self.cached = Some(value.to_string());
        }
        Ok(())
    }
}

/// Fixed-length array of doubles; never cached, robins can be large
pub(crate) struct DoubleArrayCell {
    offset: u64,
    length: usize,
}

impl DoubleArrayCell {
    pub(crate) fn new(alloc: &mut RrdAllocator, length: usize) -> Self {
        Self {
            offset: alloc.allocate(length as u64 * NUMERIC_CELL_SIZE),
            length,
        }
    }

    pub(crate) fn length(&self) -> usize {
        self.length
    }

    fn slot(&self, index: usize) -> u64 {
        debug_assert!(index < self.length);
        self.offset + index as u64 * NUMERIC_CELL_SIZE
    }

    pub(crate) fn get(&self, st: &mut Storage, index: usize) -> Result<f64> {
        st.read_double(self.slot(index))
    }

    pub(crate) fn set(&self, st: &mut Storage, index: usize, value: f64) -> Result<()> {
        st.write_double(self.slot(index), value)
    }

    /// Write `count` copies of `value` starting at `index`
    pub(crate) fn fill(&self, st: &mut Storage, index: usize, count: usize, value: f64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        st.write_doubles(self.slot(index), &vec![value; count])
    }

    pub(crate) fn read(&self, st: &mut Storage, index: usize, count: usize) -> Result<Vec<f64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        st.read_doubles(self.slot(index), count)
    }

    pub(crate) fn write_all(&self, st: &mut Storage, values: &[f64]) -> Result<()> {
        debug_assert_eq!(values.len(), self.length);
        st.write_doubles(self.offset, values)
    }
}

/// Row-major `rows x cols` matrix of doubles, shared by all
/// datasources of a version-2 archive
#[derive(Clone, Copy)]
pub(crate) struct DoubleMatrixCell {
    offset: u64,
    rows: usize,
    cols: usize,
}

impl DoubleMatrixCell {
    pub(crate) fn new(alloc: &mut RrdAllocator, rows: usize, cols: usize) -> Self {
        Self {
            offset: alloc.allocate((rows * cols) as u64 * NUMERIC_CELL_SIZE),
            rows,
            cols,
        }
    }

    pub(crate) fn rows(&self) -> usize {
        self.rows
    }

    fn slot(&self, row: usize, col: usize) -> u64 {
        debug_assert!(row < self.rows && col < self.cols);
        self.offset + (row * self.cols + col) as u64 * NUMERIC_CELL_SIZE
    }

    pub(crate) fn get(&self, st: &mut Storage, row: usize, col: usize) -> Result<f64> {
        st.read_double(self.slot(row, col))
    }

    pub(crate) fn set(&self, st: &mut Storage, row: usize, col: usize, value: f64) -> Result<()> {
        st.write_double(self.slot(row, col), value)
    }
}
