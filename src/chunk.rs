//! Chunk state model.
//!
//! Chunk metadata lives out-of-band in a RAM-side arena indexed by large
//! chunk number; the mapped region holds only payload bytes. The state of
//! each chunk is a native sum type rather than a flag word: every state
//! transition replaces the variant and its payload together, so a chunk can
//! never carry the links of one state and the tag of another.

use crate::layout::{ChunkPtr, ItemHandle, SMALL_CHUNKS_PER_LARGE_CHUNK};

bitflags::bitflags! {
    /// Per-item flags stored in the title header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ItemFlags: u8 {
        /// Header is populated; set for the item's whole lifetime.
        const VALID = 1 << 0;
        /// Item is present in the LRU and the external index.
        const LINKED = 1 << 1;
        /// Item is delete-locked; `exptime` holds the lock expiry.
        const DELETED = 1 << 2;
        /// Tail slack carries a 4-byte last-access timestamp.
        const HAS_TIMESTAMP = 1 << 3;
        /// Tail slack carries a 4-byte IPv4 client address.
        const HAS_IP_ADDRESS = 1 << 4;
    }
}

/// Item header held in a title chunk.
///
/// `next`/`prev` are the LRU neighbours (chunk pointers of their title
/// chunks), `next_chunk` starts the intra-item chain, and `h_next` is
/// reserved for the external index's separate chaining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleHeader {
    pub nkey: u8,
    pub nbytes: u32,
    /// Opaque client flags, stored verbatim.
    pub flags: u32,
    /// Expiry (relative seconds); 0 means never. While `DELETED` is set this
    /// field holds the delete-lock expiry instead.
    pub exptime: u32,
    /// Last touch time (relative seconds).
    pub time: u32,
    /// Number of outstanding external holders.
    pub refcount: u16,
    pub it_flags: ItemFlags,
    pub next: Option<ChunkPtr>,
    pub prev: Option<ChunkPtr>,
    pub next_chunk: Option<ChunkPtr>,
    pub h_next: Option<ItemHandle>,
}

impl TitleHeader {
    /// Fresh header for a newly allocated item. The caller holds the single
    /// reference.
    pub fn new(nkey: u8, nbytes: u32, flags: u32, exptime: u32) -> Self {
        Self {
            nkey,
            nbytes,
            flags,
            exptime,
            time: 0,
            refcount: 1,
            it_flags: ItemFlags::VALID,
            next: None,
            prev: None,
            next_chunk: None,
            h_next: None,
        }
    }
}

/// The slot whose pointer targets a node of the small free list: either the
/// list head variable itself, or the `next` link of another free chunk.
/// Writing through this slot gives O(1) unlink from anywhere in the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrevSlot {
    /// The list head points at this node.
    Head,
    /// The named free chunk's `next` link points at this node.
    Node(ChunkPtr),
}

/// State of a small chunk within a broken parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmallChunk {
    /// Initialized but neither free-listed nor in use; the transient state
    /// between a free-list pop and the chunk's assignment (or the reverse).
    Detached,
    /// On the small free list.
    Free {
        next: Option<ChunkPtr>,
        prev_next: PrevSlot,
    },
    /// Withheld from the allocator while its parent is being coalesced.
    CoalescePending,
    /// First chunk of a small-tier item.
    Title(TitleHeader),
    /// Continuation chunk of a small-tier item.
    Body {
        prev_chunk: ChunkPtr,
        next_chunk: Option<ChunkPtr>,
    },
}

impl SmallChunk {
    pub fn is_free(&self) -> bool {
        matches!(self, SmallChunk::Free { .. })
    }

    pub fn is_used(&self) -> bool {
        matches!(self, SmallChunk::Title(_) | SmallChunk::Body { .. })
    }
}

/// A broken large chunk: its small children plus the count of used ones.
///
/// `allocated` counts `Title`/`Body` children only; free, detached and
/// coalesce-pending children are excluded.
#[derive(Debug, PartialEq, Eq)]
pub struct BrokenRecord {
    pub small: [SmallChunk; SMALL_CHUNKS_PER_LARGE_CHUNK],
    pub allocated: u8,
}

impl BrokenRecord {
    pub fn new() -> Self {
        Self {
            small: std::array::from_fn(|_| SmallChunk::Detached),
            allocated: SMALL_CHUNKS_PER_LARGE_CHUNK as u8,
        }
    }
}

/// State of a large chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum LargeChunk {
    /// Beyond the initialized frontier; its region pages have never been
    /// touched.
    Uninitialized,
    /// Initialized but neither free-listed nor in use.
    Detached,
    /// On the large free list.
    Free { next: Option<ChunkPtr> },
    /// First chunk of a large-tier item.
    Title(TitleHeader),
    /// Continuation chunk of a large-tier item. Large bodies carry no back
    /// link; their predecessor is found by walking from the title.
    Body { next_chunk: Option<ChunkPtr> },
    /// Subdivided into small chunks.
    Broken(Box<BrokenRecord>),
}

/// Resolve a title header by chunk pointer, through a broken parent for
/// small-tier titles.
pub(crate) fn title_of(chunks: &[LargeChunk], p: ChunkPtr) -> &TitleHeader {
    match &chunks[p.parent_index()] {
        LargeChunk::Broken(rec) => match &rec.small[p.slot()] {
            SmallChunk::Title(hdr) => hdr,
            other => panic!("chunk {:?} is not a small title: {:?}", p, other),
        },
        LargeChunk::Title(hdr) => {
            debug_assert!(p.is_large_aligned());
            hdr
        }
        other => panic!("chunk {:?} is not a title: {:?}", p, other),
    }
}

pub(crate) fn title_of_mut(chunks: &mut [LargeChunk], p: ChunkPtr) -> &mut TitleHeader {
    match &mut chunks[p.parent_index()] {
        LargeChunk::Broken(rec) => match &mut rec.small[p.slot()] {
            SmallChunk::Title(hdr) => hdr,
            other => panic!("chunk {:?} is not a small title: {:?}", p, other),
        },
        LargeChunk::Title(hdr) => {
            debug_assert!(p.is_large_aligned());
            hdr
        }
        other => panic!("chunk {:?} is not a title: {:?}", p, other),
    }
}

/// Whether the pointer addresses a large chunk (as opposed to a small child
/// of a broken parent).
pub(crate) fn ptr_is_large(chunks: &[LargeChunk], p: ChunkPtr) -> bool {
    !matches!(&chunks[p.parent_index()], LargeChunk::Broken(_))
}

/// Follow the intra-item chain one step from `p`. `first` marks the title
/// chunk, whose link lives in the header rather than a body record.
pub(crate) fn next_chunk_of(chunks: &[LargeChunk], p: ChunkPtr, first: bool) -> Option<ChunkPtr> {
    if first {
        return title_of(chunks, p).next_chunk;
    }
    match &chunks[p.parent_index()] {
        LargeChunk::Broken(rec) => match &rec.small[p.slot()] {
            SmallChunk::Body { next_chunk, .. } => *next_chunk,
            other => panic!("chunk {:?} is not a small body: {:?}", p, other),
        },
        LargeChunk::Body { next_chunk } => *next_chunk,
        other => panic!("chunk {:?} is not a body: {:?}", p, other),
    }
}
