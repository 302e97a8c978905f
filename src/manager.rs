use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cache::BlockCache;
use crate::config::RetryPolicy;
use crate::error::{ReadError, Result};
use crate::layout::BlockLayout;
use crate::stats::StreamStats;
use crate::store::{fetch_with_retries, FetchError, ObjectStore};

type FetchResult = std::result::Result<Bytes, FetchError>;

/// Owns the per-stream block-state table and the cache backend.
///
/// Block states are implicit in the table: a block in the cache is Ready, a
/// block with an `in_flight` entry is Fetching, a block in `failed` is Failed,
/// anything else is Absent. The dedup invariant (at most one remote fetch per
/// index) holds because a fetch may only start by inserting into `in_flight`
/// under the table lock; later demands for the same index join as waiters.
pub(crate) struct BlockManager {
    store: Arc<dyn ObjectStore>,
    layout: BlockLayout,
    retry: RetryPolicy,
    /// Bounds all outstanding remote fetches, foreground and prefetch alike.
    fetch_sem: Semaphore,
    cancel: CancellationToken,
    closed: AtomicBool,
    stats: Arc<StreamStats>,
    state: Mutex<BlockTable>,
}

struct BlockTable {
    cache: BlockCache,
    in_flight: HashMap<u64, Vec<oneshot::Sender<FetchResult>>>,
    failed: HashMap<u64, FetchError>,
}

enum Claim {
    /// This caller owns the fetch for the block.
    Own,
    /// Another fetch is in flight; wait for its result.
    Join(oneshot::Receiver<FetchResult>),
}

impl BlockManager {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        layout: BlockLayout,
        retry: RetryPolicy,
        fetch_concurrency: usize,
        cache: BlockCache,
        stats: Arc<StreamStats>,
    ) -> Self {
        Self {
            store,
            layout,
            retry,
            fetch_sem: Semaphore::new(fetch_concurrency.max(1)),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            stats,
            state: Mutex::new(BlockTable {
                cache,
                in_flight: HashMap::new(),
                failed: HashMap::new(),
            }),
        }
    }

    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    /// Resolve block `index`, blocking the caller until it is Ready or the
    /// fetch fails. Never issues a duplicate remote fetch; a Failed block is
    /// retried here (and only here).
    pub async fn ensure_ready(&self, index: u64) -> Result<Bytes> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReadError::Closed);
        }

        let claim = {
            let mut table = self.state.lock().await;
            match table.cache.get(index) {
                Ok(Some(bytes)) => {
                    StreamStats::incr(&self.stats.cache_hits);
                    return Ok(bytes);
                }
                Ok(None) => {}
                Err(e) => {
                    // Spill-file damage degrades to a remote re-fetch.
                    warn!(block = index, error = %e, "cache read failed, re-fetching block");
                    table.cache.invalidate(index);
                }
            }
            StreamStats::incr(&self.stats.cache_misses);

            if let Some(waiters) = table.in_flight.get_mut(&index) {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Claim::Join(rx)
            } else {
                table.failed.remove(&index);
                table.in_flight.insert(index, Vec::new());
                Claim::Own
            }
        };

        match claim {
            Claim::Join(rx) => match rx.await {
                Ok(result) => result.map_err(ReadError::from),
                Err(_) => Err(self.closed_or_cancelled()),
            },
            Claim::Own => {
                let result = self.fetch_block(index).await;
                self.publish(index, result, false).await.map_err(ReadError::from)
            }
        }
    }

    /// Non-blocking cache probe. Touches LRU order but no counters.
    pub async fn try_get(&self, index: u64) -> Option<Bytes> {
        let mut table = self.state.lock().await;
        table.cache.get(index).ok().flatten()
    }

    /// Pin the block a reader is about to copy from; it stays readable
    /// through any eviction until [`BlockManager::unpin`].
    pub async fn pin(&self, index: u64) {
        self.state.lock().await.cache.set_pin(Some(index));
    }

    pub async fn unpin(&self) {
        self.state.lock().await.cache.set_pin(None);
    }

    /// Background-prefetch entry point: fire-and-forget, idempotent when the
    /// block is already Ready or Fetching, and skips Failed blocks (those
    /// retry lazily on the next foreground demand). Errors are counted and
    /// logged, never propagated.
    pub async fn request_prefetch(&self, index: u64) {
        if self.cancel.is_cancelled() || index >= self.layout.block_count() {
            return;
        }

        {
            let mut table = self.state.lock().await;
            if table.cache.contains(index)
                || table.in_flight.contains_key(&index)
                || table.failed.contains_key(&index)
            {
                return;
            }
            table.in_flight.insert(index, Vec::new());
        }

        let result = self.fetch_block(index).await;
        if let Err(e) = self.publish(index, result, true).await {
            warn!(block = index, error = %e, "background prefetch failed");
        }
    }

    /// Publish a fetch outcome: cache it (Ready) or record the failure
    /// (Failed), then wake all joiners with the same result.
    async fn publish(&self, index: u64, result: FetchResult, from_prefetch: bool) -> FetchResult {
        let waiters = {
            let mut table = self.state.lock().await;
            let waiters = table.in_flight.remove(&index).unwrap_or_default();
            match &result {
                Ok(bytes) => {
                    // A result landing after close is simply discarded; the
                    // cache (and any spill directory) is already gone.
                    if !self.closed.load(Ordering::SeqCst) {
                        table.cache.insert(index, bytes.clone(), from_prefetch);
                        StreamStats::incr(&self.stats.blocks_fetched);
                    }
                }
                Err(e) => {
                    table.failed.insert(index, e.clone());
                    StreamStats::incr(&self.stats.fetch_failures);
                }
            }
            waiters
        };

        for tx in waiters {
            let _ = tx.send(result.clone());
        }
        result
    }

    async fn fetch_block(&self, index: u64) -> FetchResult {
        let permit = tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(FetchError::Permanent("stream closed".into()));
            }
            permit = self.fetch_sem.acquire() => permit,
        };
        let _permit = permit.map_err(|_| FetchError::Permanent("stream closed".into()))?;

        let (start, end) = self.layout.range_of(index);
        let bytes = fetch_with_retries(
            self.store.as_ref(),
            start,
            end,
            &self.retry,
            &self.stats,
            &self.cancel,
        )
        .await?;

        if bytes.len() as u64 != end - start {
            return Err(FetchError::Permanent(format!(
                "short read for block {index}: expected {} bytes, got {}",
                end - start,
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    /// Terminal transition: cancel background work, drop all waiters, release
    /// buffers and delete spill files. Does not wait for in-flight fetches;
    /// their late results are discarded in `publish`.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();

        let mut table = self.state.lock().await;
        // Dropping the senders fails every joiner with `Closed`.
        table.in_flight.clear();
        table.failed.clear();
        table.cache.clear();
    }

    /// Synchronous part of shutdown, safe to call from `Drop`.
    pub fn detach(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub async fn resident_block_count(&self) -> usize {
        self.state.lock().await.cache.resident_len()
    }

    fn closed_or_cancelled(&self) -> ReadError {
        if self.closed.load(Ordering::SeqCst) {
            ReadError::Closed
        } else {
            ReadError::Cancelled
        }
    }
}
