//! Fetch request and result types

use crate::types::{format_double, ConsolFun, Timestamp};
use crate::{Result, RrdError};
use std::fmt;

/// A request for consolidated data over a time range
#[derive(Debug, Clone)]
pub struct FetchRequest {
    consol_fun: ConsolFun,
    fetch_start: Timestamp,
    fetch_end: Timestamp,
    resolution: i64,
    filter: Option<Vec<String>>,
}

impl FetchRequest {
    /// Build a request; `resolution` selects the coarsest acceptable
    /// archive step (1 accepts only the finest)
    pub fn new(
        consol_fun: ConsolFun,
        fetch_start: Timestamp,
        fetch_end: Timestamp,
        resolution: i64,
    ) -> Result<Self> {
        if fetch_start < 0 {
            return Err(RrdError::InvalidArgument(format!(
                "Invalid start time: {}",
                fetch_start
            )));
        }
        if fetch_end <= fetch_start {
            return Err(RrdError::InvalidArgument(format!(
                "Invalid fetch range: [{}, {}]",
                fetch_start, fetch_end
            )));
        }
        if resolution <= 0 {
            return Err(RrdError::InvalidArgument(format!(
                "Invalid resolution: {}",
                resolution
            )));
        }
        Ok(Self {
            consol_fun,
            fetch_start,
            fetch_end,
            resolution,
            filter: None,
        })
    }

    /// Restrict the result to the named datasources, in this order
    pub fn set_filter(&mut self, ds_names: Vec<String>) {
        self.filter = Some(ds_names);
    }

    pub fn consol_fun(&self) -> ConsolFun {
        self.consol_fun
    }

    pub fn fetch_start(&self) -> Timestamp {
        self.fetch_start
    }

    pub fn fetch_end(&self) -> Timestamp {
        self.fetch_end
    }

    pub fn resolution(&self) -> i64 {
        self.resolution
    }

    pub fn filter(&self) -> Option<&[String]> {
        self.filter.as_deref()
    }
}

/// Dense fetch result: aligned timestamps and one value column per
/// requested datasource, NaN where the archive has no data
#[derive(Debug, Clone)]
pub struct FetchData {
    arc_step: i64,
    ds_names: Vec<String>,
    timestamps: Vec<Timestamp>,
    /// Indexed `[ds][row]`
    values: Vec<Vec<f64>>,
}

impl FetchData {
    pub(crate) fn new(
        arc_step: i64,
        ds_names: Vec<String>,
        timestamps: Vec<Timestamp>,
        values: Vec<Vec<f64>>,
    ) -> Self {
        Self {
            arc_step,
            ds_names,
            timestamps,
            values,
        }
    }

    /// Step of the archive that served this request
    pub fn step(&self) -> i64 {
        self.arc_step
    }

    pub fn row_count(&self) -> usize {
        self.timestamps.len()
    }

    pub fn column_count(&self) -> usize {
        self.ds_names.len()
    }

    pub fn timestamps(&self) -> &[Timestamp] {
        &self.timestamps
    }

    pub fn ds_names(&self) -> &[String] {
        &self.ds_names
    }

    /// Value column for a datasource index
    pub fn values(&self, ds_index: usize) -> &[f64] {
        &self.values[ds_index]
    }

    /// Value column by datasource name
    pub fn values_by_name(&self, name: &str) -> Result<&[f64]> {
        let index = self
            .ds_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| RrdError::InvalidArgument(format!("Unknown datasource: {}", name)))?;
        Ok(&self.values[index])
    }

    /// One fetched value, addressed by row and column
    pub fn value(&self, row: usize, ds_index: usize) -> f64 {
        self.values[ds_index][row]
    }
}

impl fmt::Display for FetchData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timestamp")?;
        for name in &self.ds_names {
            write!(f, " {}", name)?;
        }
        writeln!(f)?;
        for (row, ts) in self.timestamps.iter().enumerate() {
            write!(f, "{}:", ts)?;
            for column in &self.values {
                write!(f, " {}", format_double(column[row]))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_validation() {
        assert!(FetchRequest::new(ConsolFun::Average, 100, 200, 1).is_ok());
        assert!(FetchRequest::new(ConsolFun::Average, -1, 200, 1).is_err());
        assert!(FetchRequest::new(ConsolFun::Average, 200, 200, 1).is_err());
        assert!(FetchRequest::new(ConsolFun::Average, 100, 200, 0).is_err());
    }

    #[test]
    fn test_data_accessors() {
        let data = FetchData::new(
            60,
            vec!["a".to_string(), "b".to_string()],
            vec![60, 120],
            vec![vec![1.0, 2.0], vec![f64::NAN, 4.0]],
        );
        assert_eq!(data.row_count(), 2);
        assert_eq!(data.column_count(), 2);
        assert_eq!(data.value(1, 0), 2.0);
        assert!(data.values_by_name("b").unwrap()[0].is_nan());
        assert!(data.values_by_name("c").is_err());

        let text = data.to_string();
        assert!(text.contains("timestamp a b"));
        assert!(text.contains("60: 1 U"));
    }
}
