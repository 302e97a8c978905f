//! Prefetching block-cache read engine for large immutable remote objects.
//!
//! A remote, high-latency, range-addressable store is wrapped in a stream
//! that hides per-request latency behind background prefetching and a
//! bounded per-stream block cache:
//!
//! - [`ObjectStore`]: the capability the remote must provide — read bytes
//!   `[start, end)` of one object, failing retryably or permanently
//! - [`HttpRangeStore`]: that capability over HTTP `Range` requests
//! - [`BlockStream`]: seekable read facade; picks a memory-resident or
//!   disk-spilling cache backend at open time and keeps a readahead window
//!   of blocks in flight behind the read cursor
//! - [`StreamOptions`]: block size, cache bounds, window width, worker
//!   concurrency and the retry budget
//!
//! Cached bytes are private to one stream; there is no cross-stream sharing
//! and no write path.

mod cache;
mod config;
mod error;
mod http;
mod layout;
mod manager;
mod scheduler;
mod stats;
mod store;
mod stream;

pub use config::{RetryPolicy, StreamOptions, DEFAULT_BLOCK_SIZE};
pub use error::{ReadError, Result};
pub use http::HttpRangeStore;
pub use layout::BlockLayout;
pub use stats::{StreamStats, StreamStatsSnapshot};
pub use store::{FetchError, ObjectStore};
pub use stream::BlockStream;

#[cfg(test)]
mod proptests;
