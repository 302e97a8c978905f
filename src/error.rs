use thiserror::Error;

use crate::store::FetchError;

pub type Result<T> = std::result::Result<T, ReadError>;

/// Unified error type for block-stream read operations.
///
/// Transient remote failures are retried inside the fetcher and never appear
/// here; [`ReadError::Remote`] carries only failures that survived the retry
/// budget or were permanent to begin with.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("stream is closed")]
    Closed,

    #[error("invalid seek to {pos} (object length {length})")]
    InvalidSeek { pos: u64, length: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("remote fetch failed: {0}")]
    Remote(#[from] FetchError),

    /// Disk-backed cache spill/read failure.
    ///
    /// Stores a human-readable `String` rather than `std::io::Error` so the
    /// error stays cloneable across fetch-waiter channels.
    #[error("cache I/O failure: {0}")]
    CacheIo(String),

    #[error("operation cancelled")]
    Cancelled,
}
