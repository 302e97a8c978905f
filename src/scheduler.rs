use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::manager::BlockManager;

/// Keeps a sliding window of blocks ahead of the read cursor in flight.
///
/// Each advance spawns at most `window` lightweight intents; an intent
/// re-checks the live window right before fetching, so intents queued behind
/// a seek abandon silently. Fetches that already started are never cancelled;
/// they finish and populate the cache.
pub(crate) struct PrefetchScheduler {
    manager: Arc<BlockManager>,
    block_count: u64,
    state: Mutex<WindowState>,
}

#[derive(Clone, Copy)]
struct WindowState {
    generation: u64,
    window_start: u64,
    /// Window width in blocks; zero disables prefetching. Tunable while the
    /// stream is live.
    window: u64,
}

impl PrefetchScheduler {
    pub fn new(manager: Arc<BlockManager>, window: u64) -> Arc<Self> {
        let block_count = manager.layout().block_count();
        Arc::new(Self {
            manager,
            block_count,
            state: Mutex::new(WindowState {
                generation: 0,
                window_start: 0,
                window,
            }),
        })
    }

    /// Top up the window after the read cursor moved to `next_block` (the
    /// first block the reader has not consumed yet).
    pub fn on_advance(self: &Arc<Self>, next_block: u64) {
        if next_block >= self.block_count {
            return;
        }

        let (generation, window) = {
            let mut state = self.state.lock().expect("scheduler state poisoned");
            state.window_start = next_block;
            (state.generation, state.window)
        };
        if window == 0 {
            return;
        }

        let end = next_block.saturating_add(window).min(self.block_count);
        trace!(from = next_block, to = end, "topping up readahead window");
        for index in next_block..end {
            let scheduler = self.clone();
            tokio::spawn(async move {
                if scheduler.is_stale(generation, index) {
                    return;
                }
                scheduler.manager.request_prefetch(index).await;
            });
        }
    }

    /// Re-aim the window after a seek. Queued intents outside the new window
    /// become stale; dispatched fetches finish and land in the cache.
    pub fn on_seek(&self, new_block: u64) {
        let mut state = self.state.lock().expect("scheduler state poisoned");
        state.generation += 1;
        state.window_start = new_block;
    }

    /// Change the window width. Takes effect on the next advance; a shrink
    /// also stales queued intents past the new edge.
    pub fn set_window(&self, window: u64) {
        let mut state = self.state.lock().expect("scheduler state poisoned");
        state.window = window;
    }

    fn is_stale(&self, generation: u64, index: u64) -> bool {
        let state = self.state.lock().expect("scheduler state poisoned");
        state.generation != generation
            || index < state.window_start
            || index >= state.window_start.saturating_add(state.window)
    }
}
