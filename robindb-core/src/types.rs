//! Core types for RobinDB

use crate::{Result, RrdError};
use std::fmt;
use std::str::FromStr;

/// Timestamp in seconds since Unix epoch
pub type Timestamp = i64;

/// Datasource type, controls how raw readings are turned into rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DsType {
    /// Store the reading as-is
    Gauge,
    /// Monotonic counter with 32/64-bit wrap detection
    Counter,
    /// Signed counter, no wrap handling
    Derive,
    /// Counter reset at each read
    Absolute,
}

impl DsType {
    /// All known datasource types
    pub const ALL: [DsType; 4] = [
        DsType::Gauge,
        DsType::Counter,
        DsType::Derive,
        DsType::Absolute,
    ];

    /// Canonical uppercase name
    pub fn name(&self) -> &'static str {
        match self {
            DsType::Gauge => "GAUGE",
            DsType::Counter => "COUNTER",
            DsType::Derive => "DERIVE",
            DsType::Absolute => "ABSOLUTE",
        }
    }
}

impl FromStr for DsType {
    type Err = RrdError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "GAUGE" => Ok(DsType::Gauge),
            "COUNTER" => Ok(DsType::Counter),
            "DERIVE" => Ok(DsType::Derive),
            "ABSOLUTE" => Ok(DsType::Absolute),
            _ => Err(RrdError::InvalidArgument(format!(
                "Unknown datasource type: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for DsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Consolidation function applied when collapsing primary datapoints
/// into archive rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsolFun {
    Average,
    Min,
    Max,
    Last,
}

impl ConsolFun {
    /// Canonical uppercase name
    pub fn name(&self) -> &'static str {
        match self {
            ConsolFun::Average => "AVERAGE",
            ConsolFun::Min => "MIN",
            ConsolFun::Max => "MAX",
            ConsolFun::Last => "LAST",
        }
    }
}

impl FromStr for ConsolFun {
    type Err = RrdError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "AVERAGE" => Ok(ConsolFun::Average),
            "MIN" => Ok(ConsolFun::Min),
            "MAX" => Ok(ConsolFun::Max),
            "LAST" => Ok(ConsolFun::Last),
            _ => Err(RrdError::InvalidArgument(format!(
                "Unknown consolidation function: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for ConsolFun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Floor-align a timestamp to a step boundary
pub fn normalize(time: Timestamp, step: i64) -> Timestamp {
    time - time % step
}

/// NaN-safe minimum: an unknown side never wins
pub(crate) fn nan_min(a: f64, b: f64) -> f64 {
    if a.is_nan() {
        b
    } else if b.is_nan() {
        a
    } else {
        a.min(b)
    }
}

/// NaN-safe maximum: an unknown side never wins
pub(crate) fn nan_max(a: f64, b: f64) -> f64 {
    if a.is_nan() {
        b
    } else if b.is_nan() {
        a
    } else {
        a.max(b)
    }
}

/// NaN-safe sum: an unknown side contributes nothing
pub(crate) fn nan_sum(a: f64, b: f64) -> f64 {
    if a.is_nan() {
        b
    } else if b.is_nan() {
        a
    } else {
        a + b
    }
}

/// Parse a double, with `"U"` meaning unknown (NaN)
pub fn parse_double(s: &str) -> Result<f64> {
    match s {
        "U" | "NaN" | "nan" => Ok(f64::NAN),
        _ => s
            .parse::<f64>()
            .map_err(|_| RrdError::InvalidArgument(format!("Invalid double value: {}", s))),
    }
}

/// Format a double for text I/O, with NaN spelled `"U"`
pub fn format_double(value: f64) -> String {
    if value.is_nan() {
        "U".to_string()
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(1000000060, 60), 1000000060);
        assert_eq!(normalize(1000000061, 60), 1000000060);
        assert_eq!(normalize(1000000119, 60), 1000000060);
        assert_eq!(normalize(0, 300), 0);
    }

    #[test]
    fn test_type_round_trip() {
        for ds_type in DsType::ALL {
            assert_eq!(ds_type.name().parse::<DsType>().unwrap(), ds_type);
        }
        assert!("gauge".parse::<DsType>().is_err());
        assert_eq!("AVERAGE".parse::<ConsolFun>().unwrap(), ConsolFun::Average);
        assert!("MEAN".parse::<ConsolFun>().is_err());
    }

    #[test]
    fn test_nan_safe_ops() {
        assert_eq!(nan_min(f64::NAN, 3.0), 3.0);
        assert_eq!(nan_min(2.0, f64::NAN), 2.0);
        assert_eq!(nan_min(2.0, 3.0), 2.0);
        assert_eq!(nan_max(f64::NAN, 3.0), 3.0);
        assert_eq!(nan_max(5.0, 3.0), 5.0);
        assert_eq!(nan_sum(f64::NAN, 3.0), 3.0);
        assert_eq!(nan_sum(1.0, 2.0), 3.0);
        assert!(nan_sum(f64::NAN, f64::NAN).is_nan());
    }

    #[test]
    fn test_unknown_spelling() {
        assert!(parse_double("U").unwrap().is_nan());
        assert_eq!(parse_double("1.5").unwrap(), 1.5);
        assert!(parse_double("x").is_err());
        assert_eq!(format_double(f64::NAN), "U");
        assert_eq!(format_double(2.5), "2.5");
    }
}
