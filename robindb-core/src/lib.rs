//! RobinDB Core - Fixed-Footprint Round-Robin Time-Series Database
//!
//! A pure-Rust reimplementation of RRDTool's storage core: numeric
//! samples land in pre-allocated round-robin archives, consolidated
//! into multiple coarser resolutions as time advances. A database
//! never grows after creation.
//!
//! # Architecture
//!
//! - **Backend**: byte-addressable storage for one database image
//!   (plain file, memory-mapped file, or an in-memory blob)
//! - **Cells**: typed fixed-offset handles over a backend
//! - **RrdDb**: the container binding header, datasources and
//!   archives to one backend
//! - **Sample / FetchRequest**: the update and query surfaces
//! - **RrdDbPool**: process-wide reference-counted registry keeping
//!   at most one open container per path

pub mod backend;

mod archive;
mod cell;
mod datasource;
mod db;
mod def;
mod error;
mod fetch;
mod header;
mod pool;
mod robin;
mod sample;
mod types;
mod xml;

pub use archive::ArcSnapshot;
pub use datasource::DsSnapshot;
pub use db::RrdDb;
pub use def::{ArcDef, DsDef, RrdDef};
pub use error::{Result, RrdError};
pub use fetch::{FetchData, FetchRequest};
pub use pool::RrdDbPool;
pub use sample::Sample;
pub use types::{format_double, normalize, parse_double, ConsolFun, DsType, Timestamp};

/// RobinDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Maximum number of simultaneously open databases in the pool
    pub const DEFAULT_POOL_CAPACITY: usize = 200;

    /// Seconds between background syncs of a memory-mapped backend
    pub const DEFAULT_SYNC_PERIOD_SECS: u64 = 300;

    /// Default seconds per primary datapoint
    pub const DEFAULT_STEP: i64 = 300;

    /// Maximum datasource name length in UTF-16 code units
    pub const DS_NAME_LENGTH: usize = 20;
}
