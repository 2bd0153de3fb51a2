//! Round-robin value storage
//!
//! A robin is a fixed-capacity circular buffer of consolidated values
//! for one datasource of one archive. The head index points at the
//! oldest slot; a store lands at the head and advances it, so logical
//! index `i` maps to physical slot `(head + i) % rows`.
//!
//! Two on-disk layouts exist: version 1 gives each datasource its own
//! array, version 2 packs all datasources of an archive into one
//! shared `rows x ds_count` matrix, each robin owning a column.

use crate::backend::Storage;
use crate::cell::{DoubleArrayCell, DoubleMatrixCell, IntCell, RrdAllocator};
use crate::{Result, RrdError};

pub(crate) enum Robin {
    /// Version 1: a private array per datasource
    Array {
        values: DoubleArrayCell,
        pointer: IntCell,
    },
    /// Version 2: a column of the archive-wide matrix
    Matrix {
        values: DoubleMatrixCell,
        pointer: IntCell,
        column: usize,
    },
}

impl Robin {
    /// Lay out a version-1 robin; `initialize` fills it with NaN
    pub(crate) fn create_array(
        alloc: &mut RrdAllocator,
        st: &mut Storage,
        rows: usize,
        initialize: bool,
    ) -> Result<Self> {
        let values = DoubleArrayCell::new(alloc, rows);
        let mut pointer = IntCell::new(alloc, false);
        if initialize {
            values.fill(st, 0, rows, f64::NAN)?;
            pointer.set(st, 0)?;
        }
        Ok(Robin::Array { values, pointer })
    }

    /// Wrap a column of a version-2 matrix; the matrix itself is laid
    /// out (and NaN-filled) by the archive
    pub(crate) fn matrix_column(values: DoubleMatrixCell, pointer: IntCell, column: usize) -> Self {
        Robin::Matrix {
            values,
            pointer,
            column,
        }
    }

    /// Robin capacity
    pub(crate) fn size(&self) -> usize {
        match self {
            Robin::Array { values, .. } => values.length(),
            Robin::Matrix { values, .. } => values.rows(),
        }
    }

    fn pointer(&mut self, st: &mut Storage) -> Result<usize> {
        let cell = match self {
            Robin::Array { pointer, .. } => pointer,
            Robin::Matrix { pointer, .. } => pointer,
        };
        Ok(cell.get(st)? as usize)
    }

    fn set_pointer(&mut self, st: &mut Storage, value: usize) -> Result<()> {
        let cell = match self {
            Robin::Array { pointer, .. } => pointer,
            Robin::Matrix { pointer, .. } => pointer,
        };
        cell.set(st, value as i32)
    }

    fn slot(&self, st: &mut Storage, position: usize) -> Result<f64> {
        match self {
            Robin::Array { values, .. } => values.get(st, position),
            Robin::Matrix { values, column, .. } => values.get(st, position, *column),
        }
    }

    fn set_slot(&self, st: &mut Storage, position: usize, value: f64) -> Result<()> {
        match self {
            Robin::Array { values, .. } => values.set(st, position, value),
            Robin::Matrix { values, column, .. } => values.set(st, position, *column, value),
        }
    }

    /// Store one consolidated value, advancing the head
    pub(crate) fn store(&mut self, st: &mut Storage, value: f64) -> Result<()> {
        let size = self.size();
        let position = self.pointer(st)?;
        self.set_slot(st, position, value)?;
        self.set_pointer(st, (position + 1) % size)
    }

    /// Store the same value into `count` consecutive slots in one
    /// pass; `count` never exceeds the robin size, which caps the work
    /// after long outages at one full wrap
    pub(crate) fn bulk_store(&mut self, st: &mut Storage, value: f64, count: usize) -> Result<()> {
        debug_assert!(count <= self.size());
        if count == 0 {
            return Ok(());
        }
        let size = self.size();
        let position = self.pointer(st)?;
        let tail_count = count.min(size - position);
        match self {
            Robin::Array { values, .. } => values.fill(st, position, tail_count, value)?,
            Robin::Matrix { values, column, .. } => {
                for row in position..position + tail_count {
                    values.set(st, row, *column, value)?;
                }
            }
        }
        self.set_pointer(st, (position + tail_count) % size)?;
        let head_count = count - tail_count;
        if head_count > 0 {
            match self {
                Robin::Array { values, .. } => values.fill(st, 0, head_count, value)?,
                Robin::Matrix { values, column, .. } => {
                    for row in 0..head_count {
                        values.set(st, row, *column, value)?;
                    }
                }
            }
            self.set_pointer(st, head_count)?;
        }
        Ok(())
    }

    /// Value at logical `index`; index zero is the oldest slot
    pub(crate) fn value(&mut self, st: &mut Storage, index: usize) -> Result<f64> {
        let position = (self.pointer(st)? + index) % self.size();
        self.slot(st, position)
    }

    /// Overwrite the value at logical `index`
    pub(crate) fn set_value(&mut self, st: &mut Storage, index: usize, value: f64) -> Result<()> {
        let position = (self.pointer(st)? + index) % self.size();
        self.set_slot(st, position, value)
    }

    /// Read `count` values from logical `index`, oldest first
    pub(crate) fn values(&mut self, st: &mut Storage, index: usize, count: usize) -> Result<Vec<f64>> {
        let size = self.size();
        let start = (self.pointer(st)? + index) % size;
        let tail_count = count.min(size - start);
        let mut out = Vec::with_capacity(count);
        match self {
            Robin::Array { values, .. } => {
                out.extend(values.read(st, start, tail_count)?);
                if count > tail_count {
                    out.extend(values.read(st, 0, count - tail_count)?);
                }
            }
            Robin::Matrix { values, column, .. } => {
                for row in start..start + tail_count {
                    out.push(values.get(st, row, *column)?);
                }
                for row in 0..count - tail_count {
                    out.push(values.get(st, row, *column)?);
                }
            }
        }
        Ok(out)
    }

    /// All stored values, oldest first
    pub(crate) fn all_values(&mut self, st: &mut Storage) -> Result<Vec<f64>> {
        let size = self.size();
        self.values(st, 0, size)
    }

    /// Replace the whole buffer; the head resets so logical and
    /// physical order coincide. Used by XML restore.
    pub(crate) fn update(&mut self, st: &mut Storage, new_values: &[f64]) -> Result<()> {
        if new_values.len() != self.size() {
            return Err(RrdError::InvalidArgument(format!(
                "Expected {} robin values, got {}",
                self.size(),
                new_values.len()
            )));
        }
        self.set_pointer(st, 0)?;
        match self {
            Robin::Array { values, .. } => values.write_all(st, new_values)?,
            Robin::Matrix { values, column, .. } => {
                for (row, value) in new_values.iter().enumerate() {
                    values.set(st, row, *column, *value)?;
                }
            }
        }
        Ok(())
    }

    /// Silently replace archived values outside `[min, max]` with NaN;
    /// NaN bounds are no bounds
    pub(crate) fn filter_values(&mut self, st: &mut Storage, min: f64, max: f64) -> Result<()> {
        let size = self.size();
        for position in 0..size {
            let value = self.slot(st, position)?;
            if value.is_nan() {
                continue;
            }
            if (!min.is_nan() && value < min) || (!max.is_nan() && value > max) {
                self.set_slot(st, position, f64::NAN)?;
            }
        }
        Ok(())
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
            .create(&temp_dir.path().join("robin.rrd"))
            .unwrap();
        let mut st = Storage::new(backend);
        st.set_length(size).unwrap();
        (temp_dir, st)
    }

    fn array_robin(st: &mut Storage, rows: usize) -> Robin {
        let mut alloc = RrdAllocator::new();
        Robin::create_array(&mut alloc, st, rows, true).unwrap()
    }

    fn matrix_robins(st: &mut Storage, rows: usize, cols: usize) -> Vec<Robin> {
        let mut alloc = RrdAllocator::new();
        let pointers: Vec<IntCell> = (0..cols).map(|_| IntCell::new(&mut alloc, false)).collect();
        let matrix = DoubleMatrixCell::new(&mut alloc, rows, cols);
        for row in 0..rows {
            for col in 0..cols {
                matrix.set(st, row, col, f64::NAN).unwrap();
            }
        }
        pointers
            .into_iter()
            .enumerate()
            .map(|(col, pointer)| Robin::matrix_column(matrix, pointer, col))
            .collect()
    }

    #[test]
    fn test_capacity_overwrites_oldest() {
        let (_dir, mut st) = scratch(256);
        let mut robin = array_robin(&mut st, 4);
        for i in 0..5 {
            robin.store(&mut st, i as f64).unwrap();
        }
        // the fifth write evicted value 0
        assert_eq!(robin.all_values(&mut st).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_bulk_store_wraps() {
        let (_dir, mut st) = scratch(256);
        let mut robin = array_robin(&mut st, 5);
        robin.store(&mut st, 1.0).unwrap();
        robin.store(&mut st, 2.0).unwrap();
        robin.store(&mut st, 3.0).unwrap();
        robin.bulk_store(&mut st, 9.0, 4).unwrap();
        let values = robin.all_values(&mut st).unwrap();
        assert_eq!(values, vec![3.0, 9.0, 9.0, 9.0, 9.0]);
    }

    #[test]
    fn test_matrix_columns_are_independent() {
        let (_dir, mut st) = scratch(1024);
        let mut robins = matrix_robins(&mut st, 3, 2);
        robins[0].store(&mut st, 1.0).unwrap();
        robins[1].store(&mut st, 7.0).unwrap();
        robins[1].store(&mut st, 8.0).unwrap();

        let left = robins[0].all_values(&mut st).unwrap();
        assert!(left[0].is_nan() && left[1].is_nan());
        assert_eq!(left[2], 1.0);

        let right = robins[1].all_values(&mut st).unwrap();
        assert!(right[0].is_nan());
        assert_eq!(&right[1..], &[7.0, 8.0]);
    }

    #[test]
    fn test_logical_read_spans_wrap() {
        let (_dir, mut st) = scratch(256);
        let mut robin = array_robin(&mut st, 3);
        for i in 0..5 {
            robin.store(&mut st, i as f64).unwrap();
        }
        assert_eq!(robin.values(&mut st, 0, 3).unwrap(), vec![2.0, 3.0, 4.0]);
        assert_eq!(robin.values(&mut st, 1, 2).unwrap(), vec![3.0, 4.0]);
        assert_eq!(robin.value(&mut st, 2).unwrap(), 4.0);
    }

    #[test]
    fn test_update_and_filter() {
        let (_dir, mut st) = scratch(256);
        let mut robin = array_robin(&mut st, 4);
        robin
            .update(&mut st, &[1.0, 50.0, f64::NAN, 3.0])
            .unwrap();
        assert!(robin.update(&mut st, &[1.0]).is_err());

        robin.filter_values(&mut st, 0.0, 10.0).unwrap();
        let values = robin.all_values(&mut st).unwrap();
        assert_eq!(values[0], 1.0);
        assert!(values[1].is_nan());
        assert!(values[2].is_nan());
        assert_eq!(values[3], 3.0);
    }
}
