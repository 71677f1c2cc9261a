//! Region manager: a single anonymous private mapping backing every chunk's
//! payload bytes.
//!
//! The full capacity is reserved up front but pages are only touched once
//! their large chunk is initialized, so resident memory grows with use
//! rather than with the configured maximum. Growth happens in fixed
//! `STORAGE_INCREMENT_DELTA` steps by advancing the initialized frontier;
//! the mapping itself is never resized and never returned to the operating
//! system.

use std::io;
use std::ops::Range;

use memmap2::MmapMut;

use crate::layout::{ChunkPtr, LARGE_CHUNK_SZ, SMALL_CHUNK_SZ, STORAGE_INCREMENT_DELTA};

pub(crate) struct Region {
    /// The backing mapping. Reserved with `LARGE_CHUNK_SZ - 1` extra bytes
    /// so the first block can be aligned up; all slicing goes through
    /// `base`.
    mmap: MmapMut,
    /// Offset of the first aligned block within the mapping.
    base: usize,
    /// Total capacity in large chunks.
    total_chunks: usize,
    /// Index of the first uninitialized large chunk; everything below this
    /// has been handed to the free lists at some point.
    uninitialized_start: usize,
    /// Bytes beyond the initialized frontier.
    unused_memory: usize,
}

impl Region {
    /// Reserve a region of `maxbytes`. `maxbytes` must be a positive
    /// multiple of both `LARGE_CHUNK_SZ` and `STORAGE_INCREMENT_DELTA`;
    /// violating that is a configuration bug and panics.
    pub fn new(maxbytes: usize) -> io::Result<Self> {
        assert!(maxbytes > 0, "region size must be non-zero");
        assert_eq!(
            maxbytes % LARGE_CHUNK_SZ,
            0,
            "region size must be a multiple of the large chunk size"
        );
        assert_eq!(
            maxbytes % STORAGE_INCREMENT_DELTA,
            0,
            "region size must be a multiple of the growth increment"
        );

        let mmap = MmapMut::map_anon(maxbytes + LARGE_CHUNK_SZ - 1)?;
        let addr = mmap.as_ptr() as usize;
        let base = addr.next_multiple_of(LARGE_CHUNK_SZ) - addr;

        Ok(Self {
            mmap,
            base,
            total_chunks: maxbytes / LARGE_CHUNK_SZ,
            uninitialized_start: 0,
            unused_memory: maxbytes,
        })
    }

    /// Advance the initialized frontier by one increment. Returns the range
    /// of newly initialized large chunk indexes, or `None` if fewer than
    /// `STORAGE_INCREMENT_DELTA` bytes remain.
    pub fn grow(&mut self) -> Option<Range<usize>> {
        if STORAGE_INCREMENT_DELTA > self.unused_memory {
            return None;
        }
        let start = self.uninitialized_start;
        let count = STORAGE_INCREMENT_DELTA / LARGE_CHUNK_SZ;
        self.uninitialized_start += count;
        self.unused_memory -= STORAGE_INCREMENT_DELTA;
        log::trace!(
            "region grow: chunks {}..{} initialized, {} bytes unused",
            start,
            self.uninitialized_start,
            self.unused_memory
        );
        Some(start..self.uninitialized_start)
    }

    pub fn unused_memory(&self) -> usize {
        self.unused_memory
    }

    pub fn initialized_chunks(&self) -> usize {
        self.uninitialized_start
    }

    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    /// Borrow `range` within large chunk `index`'s block.
    pub fn block(&self, index: usize, range: Range<usize>) -> &[u8] {
        debug_assert!(index < self.uninitialized_start, "read of uninitialized chunk");
        debug_assert!(range.end <= LARGE_CHUNK_SZ);
        let start = self.base + index * LARGE_CHUNK_SZ;
        &self.mmap[start + range.start..start + range.end]
    }

    /// Mutably borrow `range` within large chunk `index`'s block.
    pub fn block_mut(&mut self, index: usize, range: Range<usize>) -> &mut [u8] {
        debug_assert!(index < self.uninitialized_start, "write to uninitialized chunk");
        debug_assert!(range.end <= LARGE_CHUNK_SZ);
        let start = self.base + index * LARGE_CHUNK_SZ;
        &mut self.mmap[start + range.start..start + range.end]
    }

    /// Copy a whole small sub-block from `src` to `dst`, used when the
    /// coalescer migrates a live small chunk to a replacement.
    pub fn move_small_chunk(&mut self, src: ChunkPtr, dst: ChunkPtr) {
        debug_assert!(src != dst);
        let src_start = self.base + src.parent_index() * LARGE_CHUNK_SZ + src.slot() * SMALL_CHUNK_SZ;
        let dst_start = self.base + dst.parent_index() * LARGE_CHUNK_SZ + dst.slot() * SMALL_CHUNK_SZ;
        self.mmap
            .copy_within(src_start..src_start + SMALL_CHUNK_SZ, dst_start);
    }
}
