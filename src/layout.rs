/// Pure offset -> block arithmetic for one object.
///
/// Blocks are fixed-size; the last block may be short. All ranges are
/// half-open `[start, end)` byte ranges clamped to the object length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    object_len: u64,
    block_size: u64,
}

impl BlockLayout {
    /// `block_size` must be non-zero; enforced by option validation before
    /// any layout is constructed.
    pub fn new(object_len: u64, block_size: u64) -> Self {
        debug_assert!(block_size > 0);
        Self {
            object_len,
            block_size,
        }
    }

    pub fn object_len(&self) -> u64 {
        self.object_len
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.object_len.div_ceil(self.block_size)
    }

    /// Block containing byte `offset`. Callers must keep `offset` in bounds.
    pub fn block_of(&self, offset: u64) -> u64 {
        offset / self.block_size
    }

    pub fn offset_in_block(&self, offset: u64) -> u64 {
        offset % self.block_size
    }

    /// Byte range `[start, end)` of block `index`, clamped to the object.
    pub fn range_of(&self, index: u64) -> (u64, u64) {
        let start = index.saturating_mul(self.block_size).min(self.object_len);
        let end = start.saturating_add(self.block_size).min(self.object_len);
        (start, end)
    }

    pub fn len_of(&self, index: u64) -> u64 {
        let (start, end) = self.range_of(index);
        end - start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_blocks_with_short_tail() {
        let layout = BlockLayout::new(10_000, 4_000);
        assert_eq!(layout.block_count(), 3);
        assert_eq!(layout.len_of(0), 4_000);
        assert_eq!(layout.len_of(1), 4_000);
        assert_eq!(layout.len_of(2), 2_000);
        assert_eq!(layout.range_of(2), (8_000, 10_000));
    }

    #[test]
    fn boundary_offsets_map_to_adjacent_blocks() {
        let layout = BlockLayout::new(10_000, 4_000);
        assert_eq!(layout.block_of(3_999), 0);
        assert_eq!(layout.block_of(4_000), 1);
        assert_eq!(layout.offset_in_block(3_999), 3_999);
        assert_eq!(layout.offset_in_block(4_000), 0);
    }

    #[test]
    fn exact_multiple_has_no_short_tail() {
        let layout = BlockLayout::new(8_192, 4_096);
        assert_eq!(layout.block_count(), 2);
        assert_eq!(layout.len_of(1), 4_096);
    }

    #[test]
    fn empty_object_has_no_blocks() {
        let layout = BlockLayout::new(0, 4_096);
        assert_eq!(layout.block_count(), 0);
    }

    #[test]
    fn range_past_the_end_is_empty() {
        let layout = BlockLayout::new(100, 64);
        assert_eq!(layout.range_of(5), (100, 100));
        assert_eq!(layout.len_of(5), 0);
    }
}
