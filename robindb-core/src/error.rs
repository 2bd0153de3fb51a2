//! Error types for RobinDB

use thiserror::Error;

/// Result type alias for RobinDB operations
pub type Result<T> = std::result::Result<T, RrdError>;

/// RobinDB error types
#[derive(Error, Debug)]
pub enum RrdError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed specification, unknown name, bad timestamp or value count
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation on a closed database, or a pool operation in the wrong state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Pool create/import targeting a path that is already open
    #[error("Already open: {0}")]
    AlreadyOpen(String),
}

impl RrdError {
    /// Check if the error originates in the storage backend
    pub fn is_io(&self) -> bool {
        matches!(self, RrdError::Io(_))
    }
}
