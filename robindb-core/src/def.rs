//! Create-time database definition

use crate::cell::{NUMERIC_CELL_SIZE, STRING_CELL_SIZE, STRING_LENGTH};
use crate::header::Header;
use crate::types::{ConsolFun, DsType, Timestamp};
use crate::{Result, RrdError};
use std::path::{Path, PathBuf};

/// Datasource definition
#[derive(Debug, Clone, PartialEq)]
pub struct DsDef {
    pub(crate) name: String,
    pub(crate) ds_type: DsType,
    pub(crate) heartbeat: i64,
    pub(crate) min: f64,
    pub(crate) max: f64,
}

impl DsDef {
    /// On-disk width of one datasource block
    pub(crate) const SIZE: u64 = 2 * STRING_CELL_SIZE + 6 * NUMERIC_CELL_SIZE;

    /// Define a datasource. `min`/`max` may be NaN, meaning unbounded.
    pub fn new(name: &str, ds_type: DsType, heartbeat: i64, min: f64, max: f64) -> Result<Self> {
        if name.is_empty() {
            return Err(RrdError::InvalidArgument(
                "Datasource name must not be empty".to_string(),
            ));
        }
        if name.encode_utf16().count() > STRING_LENGTH {
            return Err(RrdError::InvalidArgument(format!(
                "Datasource name [{}] longer than {} characters",
                name, STRING_LENGTH
            )));
        }
        if heartbeat <= 0 {
            return Err(RrdError::InvalidArgument(format!(
                "Invalid heartbeat: {}",
                heartbeat
            )));
        }
        if !min.is_nan() && !max.is_nan() && min >= max {
            return Err(RrdError::InvalidArgument(format!(
                "Invalid min/max: {} >= {}",
                min, max
            )));
        }
        Ok(Self {
            name: name.to_string(),
            ds_type,
            heartbeat,
            min,
            max,
        })
    }

    /// Parse a `DS:name:TYPE:heartbeat:min:max` specification
    pub fn from_spec(spec: &str) -> Result<Self> {
        let tokens: Vec<&str> = spec.split(':').collect();
        if tokens.len() != 6 || tokens[0] != "DS" {
            return Err(RrdError::InvalidArgument(format!(
                "Invalid DS definition: {}",
                spec
            )));
        }
        Self::new(
            tokens[1],
            tokens[2].parse()?,
            tokens[3]
                .parse()
                .map_err(|_| RrdError::InvalidArgument(format!("Invalid heartbeat: {}", tokens[3])))?,
            crate::types::parse_double(tokens[4])?,
            crate::types::parse_double(tokens[5])?,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ds_type(&self) -> DsType {
        self.ds_type
    }

    pub fn heartbeat(&self) -> i64 {
        self.heartbeat
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}

/// Archive definition
#[derive(Debug, Clone, PartialEq)]
pub struct ArcDef {
    pub(crate) consol_fun: ConsolFun,
    pub(crate) xff: f64,
    pub(crate) steps: i64,
    pub(crate) rows: usize,
}

impl ArcDef {
    /// On-disk width of the archive definition block, robins excluded
    pub(crate) const SIZE: u64 = STRING_CELL_SIZE + 3 * NUMERIC_CELL_SIZE;

    pub fn new(consol_fun: ConsolFun, xff: f64, steps: i64, rows: usize) -> Result<Self> {
        if !(0.0..1.0).contains(&xff) {
            return Err(RrdError::InvalidArgument(format!(
                "Invalid xff: {}, must be >= 0 and < 1",
                xff
            )));
        }
        if steps < 1 {
            return Err(RrdError::InvalidArgument(format!(
                "Invalid steps: {}",
                steps
            )));
        }
        if rows < 1 {
            return Err(RrdError::InvalidArgument(format!("Invalid rows: {}", rows)));
        }
        Ok(Self {
            consol_fun,
            xff,
            steps,
            rows,
        })
    }

    /// Parse a `RRA:CF:xff:steps:rows` specification
    pub fn from_spec(spec: &str) -> Result<Self> {
        let tokens: Vec<&str> = spec.split(':').collect();
        if tokens.len() != 5 || tokens[0] != "RRA" {
            return Err(RrdError::InvalidArgument(format!(
                "Invalid RRA definition: {}",
                spec
            )));
        }
        let parse_err = |what: &str, token: &str| {
            RrdError::InvalidArgument(format!("Invalid {}: {}", what, token))
        };
        Self::new(
            tokens[1].parse()?,
            tokens[2]
                .parse()
                .map_err(|_| parse_err("xff", tokens[2]))?,
            tokens[3]
                .parse()
                .map_err(|_| parse_err("steps", tokens[3]))?,
            tokens[4]
                .parse()
                .map_err(|_| parse_err("rows", tokens[4]))?,
        )
    }

    pub fn consol_fun(&self) -> ConsolFun {
        self.consol_fun
    }

    pub fn xff(&self) -> f64 {
        self.xff
    }

    pub fn steps(&self) -> i64 {
        self.steps
    }

    pub fn rows(&self) -> usize {
        self.rows
    }
}

/// Complete definition of a database to be created
#[derive(Debug, Clone)]
pub struct RrdDef {
    path: PathBuf,
    start: Timestamp,
    step: i64,
    version: i32,
    datasources: Vec<DsDef>,
    archives: Vec<ArcDef>,
}

impl RrdDef {
    /// Start a definition; samples may be committed for any timestamp
    /// strictly greater than `start`
    pub fn new(path: impl Into<PathBuf>, start: Timestamp, step: i64) -> Self {
        Self {
            path: path.into(),
            start,
            step,
            version: 2,
            datasources: Vec::new(),
            archives: Vec::new(),
        }
    }

    /// Select the on-disk robin layout version (1 or 2)
    pub fn with_version(mut self, version: i32) -> Result<Self> {
        if version != 1 && version != 2 {
            return Err(RrdError::InvalidArgument(format!(
                "Unsupported version: {}",
                version
            )));
        }
        self.version = version;
        Ok(self)
    }

    pub fn add_datasource(&mut self, def: DsDef) -> Result<()> {
        if self.datasources.iter().any(|d| d.name == def.name) {
            return Err(RrdError::InvalidArgument(format!(
                "Duplicate datasource name: {}",
                def.name
            )));
        }
        self.datasources.push(def);
        Ok(())
    }

    pub fn add_archive(&mut self, def: ArcDef) -> Result<()> {
        if self
            .archives
            .iter()
            .any(|a| a.consol_fun == def.consol_fun && a.steps == def.steps)
        {
            return Err(RrdError::InvalidArgument(format!(
                "Duplicate archive: {}:{}",
                def.consol_fun, def.steps
            )));
        }
        self.archives.push(def);
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.step <= 0 {
            return Err(RrdError::InvalidArgument(format!(
                "Invalid step: {}",
                self.step
            )));
        }
        if self.start < 0 {
            return Err(RrdError::InvalidArgument(format!(
                "Invalid start time: {}",
                self.start
            )));
        }
        if self.datasources.is_empty() {
            return Err(RrdError::InvalidArgument(
                "No datasources defined".to_string(),
            ));
        }
        if self.archives.is_empty() {
            return Err(RrdError::InvalidArgument("No archives defined".to_string()));
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn step(&self) -> i64 {
        self.step
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn datasources(&self) -> &[DsDef] {
        &self.datasources
    }

    pub fn archives(&self) -> &[ArcDef] {
        &self.archives
    }

    /// Exact on-disk image size for this definition
    pub fn exact_size(&self) -> u64 {
        let ds_count = self.datasources.len() as u64;
        let mut size = Header::SIZE + ds_count * DsDef::SIZE;
        for arc in &self.archives {
            let rows = arc.rows as u64;
            size += ArcDef::SIZE;
            // one ArcState per datasource
            size += ds_count * 2 * NUMERIC_CELL_SIZE;
            size += match self.version {
                1 => ds_count * (rows + 1) * NUMERIC_CELL_SIZE,
                _ => ds_count * NUMERIC_CELL_SIZE + rows * ds_count * NUMERIC_CELL_SIZE,
            };
        }
        size
    }
}
