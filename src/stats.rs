use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic per-stream counters.
///
/// Owned by the stream facade, shared with the block manager and cache via
/// `Arc`; readers take point-in-time [`StreamStatsSnapshot`]s.
#[derive(Default)]
pub struct StreamStats {
    pub(crate) bytes_read: AtomicU64,
    pub(crate) blocks_fetched: AtomicU64,
    pub(crate) cache_hits: AtomicU64,
    pub(crate) cache_misses: AtomicU64,
    pub(crate) fetch_failures: AtomicU64,
    pub(crate) fetch_retries: AtomicU64,
    pub(crate) prefetched_unused_bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamStatsSnapshot {
    pub bytes_read: u64,
    pub blocks_fetched: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub fetch_failures: u64,
    pub fetch_retries: u64,
    /// Bytes fetched by the prefetcher that were evicted or discarded at
    /// close without ever serving a read.
    pub prefetched_unused_bytes: u64,
}

impl StreamStats {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            blocks_fetched: self.blocks_fetched.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            fetch_retries: self.fetch_retries.load(Ordering::Relaxed),
            prefetched_unused_bytes: self.prefetched_unused_bytes.load(Ordering::Relaxed),
        }
    }
}
