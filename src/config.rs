use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ReadError, Result};

pub const DEFAULT_BLOCK_SIZE: u64 = 8 * 1024 * 1024; // 8 MiB

/// Retry budget for a single block fetch.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts (first try included). Must be non-zero.
    pub attempts: usize,
    /// Backoff before the second attempt; doubles per retry.
    pub backoff_base: Duration,
    /// Cap applied to the doubled backoff.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            backoff_base: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Tuning options for one [`BlockStream`](crate::BlockStream).
///
/// All knobs are fixed at open time for the stream's lifetime.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Fetch/cache unit for the remote object.
    pub block_size: u64,
    /// Maximum blocks held in memory at once by the cache backend.
    pub resident_blocks: usize,
    /// How many blocks past the read cursor to keep in flight. Zero disables
    /// prefetching.
    pub prefetch_window: u64,
    /// Maximum concurrent remote fetches (foreground and prefetch combined).
    pub prefetch_concurrency: usize,
    pub retry: RetryPolicy,
    /// Objects no longer than this stay entirely in memory; larger objects
    /// spill ready blocks to `scratch_dir`. `None` means one block.
    pub in_memory_threshold: Option<u64>,
    /// Writable directory handed out by the caller; the disk backend creates
    /// a private subdirectory per stream and removes it on close.
    pub scratch_dir: PathBuf,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            resident_blocks: 8,
            prefetch_window: 2,
            prefetch_concurrency: 4,
            retry: RetryPolicy::default(),
            in_memory_threshold: None,
            scratch_dir: std::env::temp_dir(),
        }
    }
}

impl StreamOptions {
    pub fn memory_threshold(&self) -> u64 {
        self.in_memory_threshold.unwrap_or(self.block_size)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(ReadError::InvalidConfig("block_size must be > 0"));
        }
        if self.resident_blocks == 0 {
            return Err(ReadError::InvalidConfig("resident_blocks must be > 0"));
        }
        if self.prefetch_concurrency == 0 {
            return Err(ReadError::InvalidConfig(
                "prefetch_concurrency must be > 0",
            ));
        }
        if self.retry.attempts == 0 {
            return Err(ReadError::InvalidConfig("retry.attempts must be > 0"));
        }
        Ok(())
    }
}
