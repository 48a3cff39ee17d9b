//! Data-device block allocator
//!
//! One bit per block: 0 = free, 1 = used. The map is volatile; it is
//! rebuilt at startup from the clean index and journal replay, so there is
//! nothing to persist here.

use stripeio_common::{Error, Result};

pub struct BlockBitmap {
    data: Vec<u8>,
    total_blocks: u64,
    free_blocks: u64,
    /// Hint for the next free-block search.
    search_hint: u64,
}

impl BlockBitmap {
    /// Create a bitmap with all blocks free.
    #[must_use]
    pub fn new(total_blocks: u64) -> Self {
        Self {
            data: vec![0u8; total_blocks.div_ceil(8) as usize],
            total_blocks,
            free_blocks: total_blocks,
            search_hint: 0,
        }
    }

    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.free_blocks
    }

    #[must_use]
    pub fn is_used(&self, block: u64) -> bool {
        if block >= self.total_blocks {
            return true;
        }
        self.data[(block / 8) as usize] & (1 << (block % 8)) != 0
    }

    /// Mark a specific block used (startup rebuild path).
    pub fn mark_used(&mut self, block: u64) -> Result<()> {
        if block >= self.total_blocks {
            return Err(Error::internal(format!(
                "block {block} out of range ({} total)",
                self.total_blocks
            )));
        }
        if !self.is_used(block) {
            self.data[(block / 8) as usize] |= 1 << (block % 8);
            self.free_blocks -= 1;
        }
        Ok(())
    }

    /// Allocate one block, or `None` when the device is full.
    pub fn allocate(&mut self) -> Option<u64> {
        let hint = self.search_hint;
        let found = self
            .find_free(hint, self.total_blocks)
            .or_else(|| self.find_free(0, hint));
        if let Some(block) = found {
            self.data[(block / 8) as usize] |= 1 << (block % 8);
            self.free_blocks -= 1;
            self.search_hint = block + 1;
        }
        found
    }

    /// Return a block to the free pool.
    pub fn free(&mut self, block: u64) {
        if block < self.total_blocks && self.is_used(block) {
            self.data[(block / 8) as usize] &= !(1 << (block % 8));
            self.free_blocks += 1;
        }
    }

    fn find_free(&self, start: u64, end: u64) -> Option<u64> {
        (start..end.min(self.total_blocks)).find(|&b| !self.is_used(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free() {
        let mut bm = BlockBitmap::new(16);
        assert_eq!(bm.free_blocks(), 16);

        let a = bm.allocate().unwrap();
        let b = bm.allocate().unwrap();
        assert_ne!(a, b);
        assert!(bm.is_used(a));
        assert_eq!(bm.free_blocks(), 14);

        bm.free(a);
        assert!(!bm.is_used(a));
        assert_eq!(bm.free_blocks(), 15);
    }

    #[test]
    fn test_exhaustion() {
        let mut bm = BlockBitmap::new(3);
        assert!(bm.allocate().is_some());
        assert!(bm.allocate().is_some());
        assert!(bm.allocate().is_some());
        assert!(bm.allocate().is_none());
        bm.free(1);
        assert_eq!(bm.allocate(), Some(1));
    }

    #[test]
    fn test_mark_used_rebuild() {
        let mut bm = BlockBitmap::new(8);
        bm.mark_used(5).unwrap();
        bm.mark_used(5).unwrap(); // idempotent
        assert_eq!(bm.free_blocks(), 7);
        assert!(bm.mark_used(8).is_err());

        // Allocation skips the rebuilt block.
        for _ in 0..7 {
            let b = bm.allocate().unwrap();
            assert_ne!(b, 5);
        }
        assert!(bm.allocate().is_none());
    }

    #[test]
    fn test_free_out_of_range_ignored() {
        let mut bm = BlockBitmap::new(4);
        bm.free(100);
        assert_eq!(bm.free_blocks(), 4);
    }
}
