use std::collections::HashMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use tracing::warn;

use crate::error::{ReadError, Result};
use crate::stats::StreamStats;

struct Entry {
    data: Bytes,
    /// Set for blocks fetched by the prefetcher and cleared on first read;
    /// still-set entries are counted as wasted prefetch when discarded.
    from_prefetch: bool,
}

/// Per-stream ready-block cache, chosen once at open time.
///
/// The memory variant drops evicted buffers (a later read re-fetches
/// remotely); the disk variant spills them to private scratch files and
/// reloads from disk instead. Both bound the number of memory-resident
/// blocks.
///
/// A reader pins the block it is copying from via [`BlockCache::set_pin`];
/// an eviction that would reclaim the pinned block parks it in a side slot
/// instead, so it stays readable until the pin is lifted. At most one block
/// is parked at a time (reads are serialized upstream).
pub(crate) enum BlockCache {
    Memory(MemoryCache),
    Disk(DiskCache),
}

impl BlockCache {
    pub fn memory(resident_blocks: NonZeroUsize, stats: Arc<StreamStats>) -> Self {
        BlockCache::Memory(MemoryCache {
            cache: LruCache::new(resident_blocks),
            pin: None,
            parked: None,
            stats,
        })
    }

    pub fn disk(
        scratch_dir: &Path,
        resident_blocks: NonZeroUsize,
        stats: Arc<StreamStats>,
    ) -> Result<Self> {
        Ok(BlockCache::Disk(DiskCache::create(
            scratch_dir,
            resident_blocks,
            stats,
        )?))
    }

    /// Non-destructive lookup; touches LRU order and clears the prefetch
    /// flag. The disk variant may reload a spilled block, failing with
    /// [`ReadError::CacheIo`] when the spill file is missing or corrupt.
    pub fn get(&mut self, index: u64) -> Result<Option<Bytes>> {
        match self {
            BlockCache::Memory(c) => Ok(c.get(index)),
            BlockCache::Disk(c) => c.get(index),
        }
    }

    /// Install a ready block, evicting (or spilling) least-recently-used
    /// blocks over the resident bound. The pinned block is parked rather
    /// than evicted.
    pub fn insert(&mut self, index: u64, data: Bytes, from_prefetch: bool) {
        match self {
            BlockCache::Memory(c) => c.insert(index, data, from_prefetch),
            BlockCache::Disk(c) => c.insert(index, data, from_prefetch),
        }
    }

    /// Mark `index` ineligible for eviction while a reader copies from it;
    /// `None` lifts the pin. Lifting releases a parked block: back into the
    /// cache when room remains, otherwise dropped (memory) or spilled (disk).
    pub fn set_pin(&mut self, index: Option<u64>) {
        match self {
            BlockCache::Memory(c) => {
                if c.pin != index {
                    c.release_parked();
                    c.pin = index;
                }
            }
            BlockCache::Disk(c) => {
                if c.pin != index {
                    c.release_parked();
                    c.pin = index;
                }
            }
        }
    }

    pub fn contains(&self, index: u64) -> bool {
        match self {
            BlockCache::Memory(c) => c.cache.contains(&index) || c.parked_index() == Some(index),
            BlockCache::Disk(c) => {
                c.resident.contains(&index)
                    || c.parked_index() == Some(index)
                    || c.spilled.contains_key(&index)
            }
        }
    }

    /// Drop a block entirely (buffer, parked slot and spill file). Used
    /// after a spill re-read fails, so the next access falls back to a
    /// remote fetch.
    pub fn invalidate(&mut self, index: u64) {
        match self {
            BlockCache::Memory(c) => {
                if let Some(entry) = c.cache.pop(&index) {
                    c.account_discard(&entry);
                }
                if c.parked_index() == Some(index) {
                    if let Some((_, entry)) = c.parked.take() {
                        c.account_discard(&entry);
                    }
                }
            }
            BlockCache::Disk(c) => c.invalidate(index),
        }
    }

    /// Release every buffer and delete all spill files.
    pub fn clear(&mut self) {
        match self {
            BlockCache::Memory(c) => {
                while let Some((_, entry)) = c.cache.pop_lru() {
                    c.account_discard(&entry);
                }
                if let Some((_, entry)) = c.parked.take() {
                    c.account_discard(&entry);
                }
            }
            BlockCache::Disk(c) => c.clear(),
        }
    }

    pub fn resident_len(&self) -> usize {
        match self {
            BlockCache::Memory(c) => c.cache.len() + usize::from(c.parked.is_some()),
            BlockCache::Disk(c) => c.resident.len() + usize::from(c.parked.is_some()),
        }
    }
}

pub(crate) struct MemoryCache {
    cache: LruCache<u64, Entry>,
    /// Index a reader is currently copying from, if any.
    pin: Option<u64>,
    /// Pinned block displaced by an eviction, held outside the LRU until the
    /// pin is lifted.
    parked: Option<(u64, Entry)>,
    stats: Arc<StreamStats>,
}

impl MemoryCache {
    fn get(&mut self, index: u64) -> Option<Bytes> {
        if let Some(entry) = self.cache.get_mut(&index) {
            entry.from_prefetch = false;
            return Some(entry.data.clone());
        }
        match &mut self.parked {
            Some((idx, entry)) if *idx == index => {
                entry.from_prefetch = false;
                Some(entry.data.clone())
            }
            _ => None,
        }
    }

    fn insert(&mut self, index: u64, data: Bytes, from_prefetch: bool) {
        if self.cache.contains(&index) || self.parked_index() == Some(index) {
            let entry = Entry { data, from_prefetch };
            if self.parked_index() == Some(index) {
                self.parked = Some((index, entry));
            } else {
                self.cache.put(index, entry);
            }
            return;
        }

        // Make room before `put`, or the LRU would silently drop a victim of
        // its own choosing. A victim matching the pin is parked, not freed.
        while self.cache.len() >= self.cache.cap().get() {
            match self.cache.pop_lru() {
                Some((idx, entry)) if self.pin == Some(idx) && self.parked.is_none() => {
                    self.parked = Some((idx, entry));
                }
                Some((_, entry)) => self.account_discard(&entry),
                None => break,
            }
        }

        self.cache.put(index, Entry { data, from_prefetch });
    }

    fn parked_index(&self) -> Option<u64> {
        self.parked.as_ref().map(|(idx, _)| *idx)
    }

    fn release_parked(&mut self) {
        if let Some((idx, entry)) = self.parked.take() {
            if self.cache.len() < self.cache.cap().get() {
                self.cache.put(idx, entry);
            } else {
                self.account_discard(&entry);
            }
        }
    }

    fn account_discard(&self, entry: &Entry) {
        if entry.from_prefetch {
            StreamStats::add(&self.stats.prefetched_unused_bytes, entry.data.len() as u64);
        }
    }
}

struct SpillSlot {
    len: usize,
    from_prefetch: bool,
}

pub(crate) struct DiskCache {
    dir: PathBuf,
    resident: LruCache<u64, Entry>,
    pin: Option<u64>,
    parked: Option<(u64, Entry)>,
    spilled: HashMap<u64, SpillSlot>,
    stats: Arc<StreamStats>,
}

impl DiskCache {
    fn create(
        scratch_dir: &Path,
        resident_blocks: NonZeroUsize,
        stats: Arc<StreamStats>,
    ) -> Result<Self> {
        // Private per-stream subdirectory so concurrent streams sharing a
        // scratch directory never collide.
        let dir = scratch_dir.join(format!(
            "blockstream-{}-{:08x}",
            std::process::id(),
            rand::random::<u32>()
        ));
        fs::create_dir_all(&dir).map_err(|e| ReadError::CacheIo(e.to_string()))?;
        Ok(Self {
            dir,
            resident: LruCache::new(resident_blocks),
            pin: None,
            parked: None,
            spilled: HashMap::new(),
            stats,
        })
    }

    fn block_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("block-{index}"))
    }

    fn get(&mut self, index: u64) -> Result<Option<Bytes>> {
        if let Some(entry) = self.resident.get_mut(&index) {
            entry.from_prefetch = false;
            return Ok(Some(entry.data.clone()));
        }
        if let Some((idx, entry)) = &mut self.parked {
            if *idx == index {
                entry.from_prefetch = false;
                return Ok(Some(entry.data.clone()));
            }
        }

        let Some(slot) = self.spilled.get(&index) else {
            return Ok(None);
        };
        let expected_len = slot.len;

        let path = self.block_path(index);
        let raw = match fs::read(&path) {
            Ok(raw) if raw.len() == expected_len => raw,
            Ok(raw) => {
                self.drop_spill(index);
                return Err(ReadError::CacheIo(format!(
                    "spill file for block {index} has {} bytes, expected {expected_len}",
                    raw.len()
                )));
            }
            Err(e) => {
                self.drop_spill(index);
                return Err(ReadError::CacheIo(format!(
                    "failed to read spill file for block {index}: {e}"
                )));
            }
        };

        // Reload counts as a read of the block, so the prefetch flag is
        // cleared. The spill file stays valid and is reused on re-eviction.
        if let Some(slot) = self.spilled.get_mut(&index) {
            slot.from_prefetch = false;
        }
        let data = Bytes::from(raw);
        self.install(
            index,
            Entry {
                data: data.clone(),
                from_prefetch: false,
            },
        );
        Ok(Some(data))
    }

    fn insert(&mut self, index: u64, data: Bytes, from_prefetch: bool) {
        // Re-fetch after invalidation may race a stale spill file; supersede it.
        self.drop_spill(index);
        self.install(index, Entry { data, from_prefetch });
    }

    fn install(&mut self, index: u64, entry: Entry) {
        if self.resident.contains(&index) || self.parked_index() == Some(index) {
            if self.parked_index() == Some(index) {
                self.parked = Some((index, entry));
            } else {
                self.resident.put(index, entry);
            }
            return;
        }

        while self.resident.len() >= self.resident.cap().get() {
            match self.resident.pop_lru() {
                Some((idx, evicted)) if self.pin == Some(idx) && self.parked.is_none() => {
                    self.parked = Some((idx, evicted));
                }
                Some((idx, evicted)) => self.spill(idx, evicted),
                None => break,
            }
        }

        self.resident.put(index, entry);
    }

    /// Move an evicted resident block onto disk. Best-effort: a spill
    /// failure drops the block (the next read re-fetches remotely) rather
    /// than failing the operation that triggered the eviction.
    fn spill(&mut self, index: u64, entry: Entry) {
        if let Some(slot) = self.spilled.get_mut(&index) {
            // File already written by an earlier eviction of this block.
            slot.from_prefetch = entry.from_prefetch;
            return;
        }

        let path = self.block_path(index);
        let tmp = path.with_extension("tmp");
        let written = fs::write(&tmp, &entry.data)
            .and_then(|()| fs::rename(&tmp, &path));
        if let Err(e) = written {
            warn!(block = index, error = %e, "failed to spill block, dropping it");
            let _ = fs::remove_file(&tmp);
            self.account_discard(&entry);
            return;
        }

        self.spilled.insert(
            index,
            SpillSlot {
                len: entry.data.len(),
                from_prefetch: entry.from_prefetch,
            },
        );
    }

    fn parked_index(&self) -> Option<u64> {
        self.parked.as_ref().map(|(idx, _)| *idx)
    }

    fn release_parked(&mut self) {
        if let Some((idx, entry)) = self.parked.take() {
            if self.resident.len() < self.resident.cap().get() {
                self.resident.put(idx, entry);
            } else {
                self.spill(idx, entry);
            }
        }
    }

    fn invalidate(&mut self, index: u64) {
        if let Some(entry) = self.resident.pop(&index) {
            self.account_discard(&entry);
        }
        if self.parked_index() == Some(index) {
            if let Some((_, entry)) = self.parked.take() {
                self.account_discard(&entry);
            }
        }
        self.drop_spill(index);
    }

    fn drop_spill(&mut self, index: u64) {
        if let Some(slot) = self.spilled.remove(&index) {
            if slot.from_prefetch {
                StreamStats::add(&self.stats.prefetched_unused_bytes, slot.len as u64);
            }
            let _ = fs::remove_file(self.block_path(index));
        }
    }

    fn clear(&mut self) {
        while let Some((_, entry)) = self.resident.pop_lru() {
            self.account_discard(&entry);
        }
        if let Some((_, entry)) = self.parked.take() {
            self.account_discard(&entry);
        }
        for (_, slot) in self.spilled.drain() {
            if slot.from_prefetch {
                StreamStats::add(&self.stats.prefetched_unused_bytes, slot.len as u64);
            }
        }
        let _ = fs::remove_dir_all(&self.dir);
    }

    fn account_discard(&self, entry: &Entry) {
        if entry.from_prefetch {
            StreamStats::add(&self.stats.prefetched_unused_bytes, entry.data.len() as u64);
        }
    }
}

impl Drop for DiskCache {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}
