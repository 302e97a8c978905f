use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::cache::BlockCache;
use crate::config::StreamOptions;
use crate::error::{ReadError, Result};
use crate::layout::BlockLayout;
use crate::manager::BlockManager;
use crate::scheduler::PrefetchScheduler;
use crate::stats::{StreamStats, StreamStatsSnapshot};
use crate::store::ObjectStore;

/// Read-only, seekable stream over one immutable remote object, with
/// background prefetching and a bounded block cache.
///
/// Objects no larger than [`StreamOptions::memory_threshold`] are served by a
/// purely memory-resident cache; larger objects spill ready blocks to scratch
/// files. The choice is fixed at open time.
///
/// Reads and seeks are intended to be issued by one logical reader; a
/// concurrent [`BlockStream::read_at`] serializes against them rather than
/// interleaving partial copies.
pub struct BlockStream {
    manager: Arc<BlockManager>,
    scheduler: Arc<PrefetchScheduler>,
    layout: BlockLayout,
    stats: Arc<StreamStats>,
    /// Serializes the copy loop across `read` and `read_at`.
    read_gate: Mutex<()>,
    pos: u64,
    closed: AtomicBool,
}

impl BlockStream {
    /// Open a stream over an object of `length` bytes served by `store`.
    ///
    /// Issues no remote calls; the first read (or prefetch) does.
    pub fn open(
        store: Arc<dyn ObjectStore>,
        length: u64,
        options: StreamOptions,
    ) -> Result<Self> {
        options.validate()?;
        let resident = NonZeroUsize::new(options.resident_blocks)
            .ok_or(ReadError::InvalidConfig("resident_blocks must be > 0"))?;

        let stats = Arc::new(StreamStats::default());
        let layout = BlockLayout::new(length, options.block_size);

        let cache = if length <= options.memory_threshold() {
            debug!(length, "opening memory-backed block stream");
            BlockCache::memory(resident, stats.clone())
        } else {
            debug!(
                length,
                scratch = %options.scratch_dir.display(),
                "opening disk-backed block stream"
            );
            BlockCache::disk(&options.scratch_dir, resident, stats.clone())?
        };

        let manager = Arc::new(BlockManager::new(
            store,
            layout,
            options.retry.clone(),
            options.prefetch_concurrency,
            cache,
            stats.clone(),
        ));
        let scheduler = PrefetchScheduler::new(manager.clone(), options.prefetch_window);

        Ok(Self {
            manager,
            scheduler,
            layout,
            stats,
            read_gate: Mutex::new(()),
            pos: 0,
            closed: AtomicBool::new(false),
        })
    }

    pub fn length(&self) -> u64 {
        self.layout.object_len()
    }

    pub fn position(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.pos)
    }

    /// Sequential read at the current position. Returns the number of bytes
    /// copied, `Ok(0)` at end of object. Advances the position and tops up
    /// the readahead window.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        let n = self.read_span(self.pos, buf).await?;
        self.pos += n as u64;
        if n > 0 {
            self.top_up();
        }
        Ok(n)
    }

    /// Positional read; does not move the stream position and does not touch
    /// the readahead window. Clamps at end of object.
    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        self.read_span(offset, buf).await
    }

    /// Re-position the stream. Never fetches: the next read resolves blocks
    /// on demand from the new position. Prefetches left in flight outside the
    /// new window are detached, not awaited; their results still land in the
    /// cache.
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        self.check_open()?;
        let length = self.layout.object_len();
        if pos > length {
            return Err(ReadError::InvalidSeek { pos, length });
        }
        if pos != self.pos {
            self.pos = pos;
            let window_block = if pos < length {
                self.layout.block_of(pos)
            } else {
                self.layout.block_count()
            };
            self.scheduler.on_seek(window_block);
        }
        Ok(())
    }

    /// Close the stream: cancel background work without waiting for it,
    /// release all buffers and delete any spill files. Idempotent; every
    /// other operation fails with [`ReadError::Closed`] afterwards.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.manager.shutdown().await;
    }

    /// Re-tune the readahead window width in blocks; zero disables
    /// prefetching. Takes effect from the next sequential read.
    pub fn set_readahead(&self, window: u64) -> Result<()> {
        self.check_open()?;
        self.scheduler.set_window(window);
        Ok(())
    }

    /// Capability probe in the spirit of filesystem stream capabilities:
    /// readahead tuning ([`BlockStream::set_readahead`]) is supported,
    /// write-oriented capabilities are not.
    pub fn has_capability(&self, capability: &str) -> bool {
        matches!(
            capability.to_ascii_lowercase().as_str(),
            "in:readahead" | "readahead"
        )
    }

    pub fn stats(&self) -> StreamStatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of blocks currently held in memory by the cache backend.
    pub async fn resident_block_count(&self) -> usize {
        self.manager.resident_block_count().await
    }

    async fn read_span(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let _serialized = self.read_gate.lock().await;

        let length = self.layout.object_len();
        if buf.is_empty() || offset >= length {
            return Ok(0);
        }
        let end = (offset + buf.len() as u64).min(length);

        let copied = self.copy_blocks(offset, end, buf).await;
        // Lift the eviction pin, also on a failed read.
        self.manager.unpin().await;

        let written = copied?;
        StreamStats::add(&self.stats.bytes_read, written as u64);
        Ok(written)
    }

    async fn copy_blocks(&self, offset: u64, end: u64, buf: &mut [u8]) -> Result<usize> {
        let mut written = 0usize;
        for index in self.layout.block_of(offset)..=self.layout.block_of(end - 1) {
            self.check_open()?;
            // Pin before resolving: a prefetch completing mid-copy must
            // evict around this block, not through it.
            self.manager.pin(index).await;
            let bytes = match self.manager.try_get(index).await {
                Some(bytes) => {
                    StreamStats::incr(&self.stats.cache_hits);
                    bytes
                }
                None => self.manager.ensure_ready(index).await?,
            };

            let (block_start, _) = self.layout.range_of(index);
            let abs = offset + written as u64;
            let in_block = (abs - block_start) as usize;
            let to_copy = ((end - abs) as usize).min(bytes.len() - in_block);
            buf[written..written + to_copy]
                .copy_from_slice(&bytes[in_block..in_block + to_copy]);
            written += to_copy;
        }
        Ok(written)
    }

    /// Ask the scheduler to keep the window ahead of `pos` in flight.
    fn top_up(&self) {
        if self.pos >= self.layout.object_len() {
            return;
        }
        // The block containing `pos` is already cached unless `pos` sits
        // exactly on a block boundary.
        let next = if self.layout.offset_in_block(self.pos) == 0 {
            self.layout.block_of(self.pos)
        } else {
            self.layout.block_of(self.pos) + 1
        };
        self.scheduler.on_advance(next);
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ReadError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for BlockStream {
    fn drop(&mut self) {
        // Cannot await in Drop; detach from background work and let the
        // cache backend's own Drop remove any spill directory once the last
        // in-flight task releases the manager.
        self.closed.store(true, Ordering::SeqCst);
        self.manager.detach();
    }
}
