use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use proptest::prelude::*;

use crate::store::{FetchError, ObjectStore};
use crate::{BlockStream, StreamOptions};

#[derive(Debug, Clone)]
enum Op {
    Seek { pos: u64 },
    Read { len: usize },
}

const MAX_OBJECT_SIZE: u64 = 64 * 1024;
const MAX_OPS: usize = 32;
const MAX_READ_LEN: usize = 8 * 1024;

struct SliceStore {
    data: Vec<u8>,
    fetches: AtomicUsize,
}

impl ObjectStore for SliceStore {
    fn fetch_range(&self, start: u64, end: u64) -> BoxFuture<'_, Result<Bytes, FetchError>> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::copy_from_slice(
                &self.data[start as usize..end as usize],
            ))
        })
    }
}

fn object_strategy() -> impl Strategy<Value = Vec<u8>> {
    (1u64..=MAX_OBJECT_SIZE).prop_map(|len| (0..len).map(|i| (i % 251) as u8).collect())
}

fn block_size_strategy() -> impl Strategy<Value = u64> {
    prop_oneof![Just(512u64), Just(1024), Just(3000), Just(4096)]
}

fn ops_strategy(object_len: u64) -> impl Strategy<Value = Vec<Op>> {
    let op = prop_oneof![
        (0..=object_len).prop_map(|pos| Op::Seek { pos }),
        (1..=MAX_READ_LEN).prop_map(|len| Op::Read { len }),
    ];
    proptest::collection::vec(op, 1..=MAX_OPS)
}

fn options(block_size: u64, resident_blocks: usize) -> StreamOptions {
    StreamOptions {
        block_size,
        resident_blocks,
        prefetch_window: 2,
        prefetch_concurrency: 2,
        // Force the memory backend regardless of object size; disk spill is
        // covered by the integration tests.
        in_memory_threshold: Some(MAX_OBJECT_SIZE),
        ..StreamOptions::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 32, ..ProptestConfig::default() })]

    /// Any interleaving of seeks and reads returns exactly the object's
    /// bytes at the stream position, and the resident bound holds throughout.
    #[test]
    fn reads_match_object_contents(
        data in object_strategy(),
        block_size in block_size_strategy(),
        resident_blocks in 1usize..=3,
        ops in ops_strategy(MAX_OBJECT_SIZE),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let object_len = data.len() as u64;
            let store = Arc::new(SliceStore { data: data.clone(), fetches: AtomicUsize::new(0) });
            let mut stream = BlockStream::open(
                store,
                object_len,
                options(block_size, resident_blocks),
            ).unwrap();

            let mut pos = 0u64;
            for op in ops {
                match op {
                    Op::Seek { pos: p } => {
                        let p = p.min(object_len);
                        stream.seek(p).unwrap();
                        pos = p;
                    }
                    Op::Read { len } => {
                        let mut buf = vec![0u8; len];
                        let n = stream.read(&mut buf).await.unwrap();
                        let expected_n = (object_len - pos).min(len as u64) as usize;
                        prop_assert_eq!(n, expected_n);
                        prop_assert_eq!(
                            &buf[..n],
                            &data[pos as usize..pos as usize + n]
                        );
                        pos += n as u64;
                        prop_assert_eq!(stream.position().unwrap(), pos);
                    }
                }
                prop_assert!(stream.resident_block_count().await <= resident_blocks);
            }
            Ok(())
        })?;
    }

    /// Positional reads agree with the raw object regardless of offset
    /// alignment, and never move the stream position.
    #[test]
    fn positional_reads_match_object_contents(
        data in object_strategy(),
        block_size in block_size_strategy(),
        offsets in proptest::collection::vec((0u64..=MAX_OBJECT_SIZE, 1usize..=MAX_READ_LEN), 1..=8),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let object_len = data.len() as u64;
            let store = Arc::new(SliceStore { data: data.clone(), fetches: AtomicUsize::new(0) });
            let stream = BlockStream::open(store, object_len, options(block_size, 2)).unwrap();

            for (offset, len) in offsets {
                let mut buf = vec![0u8; len];
                let n = stream.read_at(offset, &mut buf).await.unwrap();
                let expected_n = object_len.saturating_sub(offset).min(len as u64) as usize;
                prop_assert_eq!(n, expected_n);
                prop_assert_eq!(
                    &buf[..n],
                    &data[offset.min(object_len) as usize..offset.min(object_len) as usize + n]
                );
                prop_assert_eq!(stream.position().unwrap(), 0);
            }
            Ok(())
        })?;
    }
}
