//! Storage geometry: chunk sizes, data-area sizes, tier selection, and the
//! compact chunk addressing scheme.
//!
//! The region is divided into fixed-size large chunks. A large chunk may be
//! broken into `SMALL_CHUNKS_PER_LARGE_CHUNK` small chunks. Chunk pointers
//! address at small-chunk granularity: large chunk `k` is
//! `k * SMALL_CHUNKS_PER_LARGE_CHUNK`, and small chunk `j` of parent `k` is
//! that plus `j`. Whether a pointer names a large chunk or a small child is
//! decided by the parent's state (only broken parents have children), which
//! is why a large chunk and its first small child share an address.

use std::ops::Range;

/// Size of a large chunk in bytes.
pub const LARGE_CHUNK_SZ: usize = 1024;

/// Size of a small chunk in bytes.
pub const SMALL_CHUNK_SZ: usize = 128;

/// Number of small chunks carved out of one broken large chunk.
pub const SMALL_CHUNKS_PER_LARGE_CHUNK: usize = LARGE_CHUNK_SZ / SMALL_CHUNK_SZ;

/// Lazy growth quantum: how many bytes of the region are initialized at a
/// time. Must be a multiple of `LARGE_CHUNK_SZ`.
pub const STORAGE_INCREMENT_DELTA: usize = 8 * LARGE_CHUNK_SZ;

/// Maximum key length in bytes.
pub const KEY_MAX_LENGTH: usize = 250;

/// Maximum value length in bytes.
pub const MAX_ITEM_SIZE: usize = 1024 * 1024;

/// Bytes reserved at the front of a title chunk for the item header.
pub const TITLE_HEADER_SZ: usize = 64;

/// Bytes reserved at the front of a body chunk for the chain links.
pub const BODY_HEADER_SZ: usize = 8;

/// Payload capacity of a large title chunk.
pub const LARGE_TITLE_DATA_SZ: usize = LARGE_CHUNK_SZ - TITLE_HEADER_SZ;

/// Payload capacity of a large body chunk.
pub const LARGE_BODY_DATA_SZ: usize = LARGE_CHUNK_SZ - BODY_HEADER_SZ;

/// Payload capacity of a small title chunk.
pub const SMALL_TITLE_DATA_SZ: usize = SMALL_CHUNK_SZ - TITLE_HEADER_SZ;

/// Payload capacity of a small body chunk.
pub const SMALL_BODY_DATA_SZ: usize = SMALL_CHUNK_SZ - BODY_HEADER_SZ;

/// How many items the eviction driver examines from the LRU tail before
/// giving up on finding an unreferenced victim.
pub const LRU_SEARCH_DEPTH: usize = 50;

/// Minimum age (seconds) before a touched item is repositioned at the LRU
/// head again.
pub const ITEM_UPDATE_INTERVAL: u32 = 60;

/// Maximum size of a cachedump response buffer.
pub const CACHEDUMP_LIMIT: usize = 2 * 1024 * 1024;

/// Size of the optional last-access timestamp stamped into item tail slack.
pub const STAMP_TIMESTAMP_SZ: usize = 4;

/// Size of the optional IPv4 address stamped into item tail slack.
pub const STAMP_IP_SZ: usize = 4;

/// The two chunk tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkTier {
    Small,
    Large,
}

/// Payload capacity of a title chunk in the given tier.
pub const fn title_data_sz(tier: ChunkTier) -> usize {
    match tier {
        ChunkTier::Small => SMALL_TITLE_DATA_SZ,
        ChunkTier::Large => LARGE_TITLE_DATA_SZ,
    }
}

/// Payload capacity of a body chunk in the given tier.
pub const fn body_data_sz(tier: ChunkTier) -> usize {
    match tier {
        ChunkTier::Small => SMALL_BODY_DATA_SZ,
        ChunkTier::Large => LARGE_BODY_DATA_SZ,
    }
}

/// Total payload an item of the small tier can hold: one small title chunk
/// plus enough small bodies to fill out a single broken large chunk.
pub const fn small_tier_max() -> usize {
    SMALL_TITLE_DATA_SZ + (SMALL_CHUNKS_PER_LARGE_CHUNK - 1) * SMALL_BODY_DATA_SZ
}

/// Tier selection. An item is stored in small chunks iff its key and value
/// together fit the capacity of one broken large chunk's worth of small
/// chunks, and do not exceed what a single large title chunk could hold.
/// Everything else goes to the large tier.
pub fn is_large_chunk(nkey: usize, nbytes: usize) -> bool {
    let total = nkey + nbytes;
    if total > small_tier_max() {
        return true;
    }
    if total > LARGE_TITLE_DATA_SZ {
        return true;
    }
    false
}

/// Number of chunks needed to store `nkey + nbytes` payload bytes in the
/// given tier: one title chunk plus however many bodies the spill requires.
pub fn chunks_needed(nkey: usize, nbytes: usize, tier: ChunkTier) -> usize {
    let total = nkey + nbytes;
    let title = title_data_sz(tier);
    if total <= title {
        1
    } else {
        1 + (total - title).div_ceil(body_data_sz(tier))
    }
}

/// Compact identifier of a chunk; see the module docs for the addressing
/// scheme. "No chunk" is expressed as `Option<ChunkPtr>`, never a sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkPtr(u32);

impl ChunkPtr {
    /// Pointer to large chunk `index`.
    pub fn of_large(index: usize) -> Self {
        Self((index * SMALL_CHUNKS_PER_LARGE_CHUNK) as u32)
    }

    /// Pointer to small chunk `slot` of broken parent `parent`.
    pub fn of_small(parent: usize, slot: usize) -> Self {
        debug_assert!(slot < SMALL_CHUNKS_PER_LARGE_CHUNK);
        Self((parent * SMALL_CHUNKS_PER_LARGE_CHUNK + slot) as u32)
    }

    /// Index of the large chunk this pointer lives in.
    pub fn parent_index(self) -> usize {
        self.0 as usize / SMALL_CHUNKS_PER_LARGE_CHUNK
    }

    /// Small-chunk slot within the parent (0 for a large chunk).
    pub fn slot(self) -> usize {
        self.0 as usize % SMALL_CHUNKS_PER_LARGE_CHUNK
    }

    /// Whether this pointer could address a large chunk.
    pub fn is_large_aligned(self) -> bool {
        self.slot() == 0
    }

    /// Raw numeric value, for diagnostics.
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Handle to an item: the chunk pointer of its title chunk. Handles are
/// invalidated by `unlink`+free and by coalescing migration; after a
/// migration the index resolves the key to the new handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemHandle(pub(crate) ChunkPtr);

impl ItemHandle {
    /// The title chunk this handle refers to.
    pub fn title_ptr(self) -> ChunkPtr {
        self.0
    }

    /// Raw numeric value, for diagnostics and physical-identity assertions
    /// in tests.
    pub fn raw(self) -> u32 {
        self.0.raw()
    }
}

/// Resolve the data area of a chunk to `(large_index, byte_range)` within
/// that large chunk's block of the region.
pub(crate) fn data_range(p: ChunkPtr, large: bool, title: bool) -> (usize, Range<usize>) {
    let hdr = if title { TITLE_HEADER_SZ } else { BODY_HEADER_SZ };
    if large {
        debug_assert!(p.is_large_aligned());
        (p.parent_index(), hdr..LARGE_CHUNK_SZ)
    } else {
        let base = p.slot() * SMALL_CHUNK_SZ;
        (p.parent_index(), base + hdr..base + SMALL_CHUNK_SZ)
    }
}
