//! Sample: one batch of raw values bound to a single timestamp

use crate::db::RrdDb;
use crate::types::Timestamp;
use crate::{Result, RrdError};

/// Collects raw values for one timestamp before committing them.
///
/// Values start out unknown; assign them by datasource name (template
/// form, any subset) or positionally. `update` commits the batch and
/// consumes the sample.
pub struct Sample<'a> {
    db: &'a mut RrdDb,
    time: Timestamp,
    values: Vec<f64>,
}

impl<'a> Sample<'a> {
    pub(crate) fn new(db: &'a mut RrdDb, time: Timestamp) -> Self {
        let ds_count = db.ds_count();
        Self {
            db,
            time,
            values: vec![f64::NAN; ds_count],
        }
    }

    pub fn time(&self) -> Timestamp {
        self.time
    }

    /// Current values, in datasource definition order
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Assign a value by datasource name
    pub fn set_value(&mut self, name: &str, value: f64) -> Result<&mut Self> {
        let index = self.db.ds_index(name)?;
        self.values[index] = value;
        Ok(self)
    }

    /// Assign a value by datasource index
    pub fn set_value_at(&mut self, index: usize, value: f64) -> Result<&mut Self> {
        if index >= self.values.len() {
            return Err(RrdError::InvalidArgument(format!(
                "Invalid datasource index: {}",
                index
            )));
        }
        self.values[index] = value;
        Ok(self)
    }

    /// Assign all values at once, in definition order
    pub fn set_values(&mut self, values: &[f64]) -> Result<&mut Self> {
        if values.len() != self.values.len() {
            return Err(RrdError::InvalidArgument(format!(
                "Expected {} values, got {}",
                self.values.len(),
                values.len()
            )));
        }
        self.values.copy_from_slice(values);
        Ok(self)
    }

    /// Commit the sample to every archive of the database
    pub fn update(self) -> Result<()> {
        self.db.store(self.time, &self.values)
    }
}
