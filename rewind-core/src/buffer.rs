use std::{borrow::Cow, ops::Range};

use crate::ranges::ByteRanges;

/// Fixed-logical-size byte buffer backed by lazily allocated blocks.  Block
/// `k` covers logical bytes `[k * block_size, (k + 1) * block_size)`, the
/// last block may be shorter.  Residency is bounded by `max_blocks`; when a
/// write needs a block past the bound, the least recently touched block is
/// dropped together with its `filled` ranges.
pub struct BlockBuffer {
    size: u64,
    block_size: u64,
    max_blocks: Option<usize>,
    blocks: Vec<Option<Box<[u8]>>>,
    // Resident block indices, least recently touched first.
    lru: Vec<usize>,
    filled: ByteRanges,
}

impl BlockBuffer {
    /// A single slab covering the whole logical size.  Nothing is ever
    /// evicted.
    pub fn contiguous(size: u64) -> BlockBuffer {
        BlockBuffer {
            size,
            block_size: size.max(1),
            max_blocks: None,
            blocks: vec![None],
            lru: Vec::new(),
            filled: ByteRanges::new(),
        }
    }

    pub fn blocked(size: u64, block_size: u64, max_blocks: usize) -> BlockBuffer {
        assert!(block_size > 0, "block size must be positive");
        assert!(max_blocks > 0, "need at least one resident block");
        let count = (size.div_ceil(block_size)).max(1) as usize;
        BlockBuffer {
            size,
            block_size,
            max_blocks: Some(max_blocks),
            blocks: (0..count).map(|_| None).collect(),
            lru: Vec::new(),
            filled: ByteRanges::new(),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn resident_blocks(&self) -> usize {
        self.lru.len()
    }

    pub fn filled(&self) -> &ByteRanges {
        &self.filled
    }

    pub fn has(&self, range: &Range<u64>) -> bool {
        self.filled.covers(range)
    }

    /// Copies `src` into the logical range starting at `offset`, splitting
    /// across block boundaries and allocating (possibly evicting) along the
    /// way.
    pub fn write(&mut self, src: &[u8], offset: u64) {
        debug_assert!(offset + src.len() as u64 <= self.size);
        let mut pos = offset;
        let mut rest = src;
        while !rest.is_empty() {
            let idx = (pos / self.block_size) as usize;
            let within = (pos % self.block_size) as usize;
            let n = rest
                .len()
                .min((self.block_len(idx) - within as u64) as usize);
            self.touch(idx);
            let block = self.blocks[idx].as_mut().expect("block is resident");
            block[within..within + n].copy_from_slice(&rest[..n]);
            // Marked per block: a later chunk of this same write may evict
            // an earlier one, and eviction must win.
            self.filled.insert(pos..pos + n as u64);
            pos += n as u64;
            rest = &rest[n..];
        }
    }

    /// Bytes of `range`.  Precondition: `has(range)`.  Borrows directly from
    /// the backing block when the range does not cross a boundary.
    pub fn slice(&self, range: &Range<u64>) -> Cow<'_, [u8]> {
        debug_assert!(self.has(range));
        let first = (range.start / self.block_size) as usize;
        let last = ((range.end - 1) / self.block_size) as usize;
        if first == last {
            let within = (range.start % self.block_size) as usize;
            let len = (range.end - range.start) as usize;
            let block = self.blocks[first].as_deref().expect("filled block is resident");
            return Cow::Borrowed(&block[within..within + len]);
        }
        let mut out = Vec::with_capacity((range.end - range.start) as usize);
        let mut pos = range.start;
        while pos < range.end {
            let idx = (pos / self.block_size) as usize;
            let within = (pos % self.block_size) as usize;
            let n = ((self.block_len(idx) - within as u64).min(range.end - pos)) as usize;
            let block = self.blocks[idx].as_deref().expect("filled block is resident");
            out.extend_from_slice(&block[within..within + n]);
            pos += n as u64;
        }
        Cow::Owned(out)
    }

    fn block_len(&self, idx: usize) -> u64 {
        let start = idx as u64 * self.block_size;
        self.block_size.min(self.size - start).max(1)
    }

    /// Makes block `idx` resident and moves it to the most recently used
    /// position.
    fn touch(&mut self, idx: usize) {
        if self.blocks[idx].is_some() {
            if let Some(at) = self.lru.iter().position(|&i| i == idx) {
                self.lru.remove(at);
                self.lru.push(idx);
            }
            return;
        }
        if let Some(max) = self.max_blocks {
            if self.lru.len() >= max {
                let victim = self.lru.remove(0);
                self.evict(victim);
            }
        }
        self.blocks[idx] = Some(vec![0u8; self.block_len(idx) as usize].into_boxed_slice());
        self.lru.push(idx);
    }

    fn evict(&mut self, idx: usize) {
        log::trace!("evicting block {}", idx);
        self.blocks[idx] = None;
        let start = idx as u64 * self.block_size;
        self.filled.remove(start..(start + self.block_size).min(self.size));
    }
}
