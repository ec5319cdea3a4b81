//! Error types for walfs
//!
//! Transient conditions (a full log, a stale handle, a pending shrink) are
//! ordinary error values that callers map to their own status codes.
//! Contract violations between layers are not represented here; they panic.

use crate::types::Inum;
use thiserror::Error;

/// Common result type for walfs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for walfs
#[derive(Debug, Error)]
pub enum Error {
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("transaction of {blocks} blocks exceeds log capacity of {capacity} blocks")]
    LogFull { blocks: usize, capacity: u64 },

    #[error("log worker failed: {0}")]
    LogFailed(String),

    #[error("stale handle: inode {inum} generation {generation}")]
    Stale { inum: Inum, generation: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no free space")]
    NoSpace,

    #[error("inode {inum} is still being shrunk")]
    ShrinkInProgress { inum: Inum },

    #[error("on-disk corruption: {0}")]
    Corrupted(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("engine is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Create a corruption error
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Check if the operation may succeed when retried later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LogFull { .. } | Self::ShrinkInProgress { .. })
    }

    /// Check if this is a stale handle error
    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
