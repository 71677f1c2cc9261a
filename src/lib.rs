//! # flatstore
//!
//! A flat storage engine: one contiguous mmapped region, sized at startup,
//! that serves simultaneously as the allocator and the index-free storage
//! for a key/value item cache.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │        Lifecycle (link/unlink/get/deref)      │
//! ├──────────────────────┬────────────────────────┤
//! │   LRU (recency list) │  AssocIndex (external) │
//! ├──────────────────────┴────────────────────────┤
//! │   Allocator (tier select, replenish, chain)   │
//! ├───────────────┬───────────────┬───────────────┤
//! │  Free lists   │ Break/unbreak │   Coalescer   │
//! ├───────────────┴───────────────┴───────────────┤
//! │      Region (mmap, lazy increment growth)     │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! The region is divided into fixed-size large chunks; a large chunk can be
//! broken into small chunks for small items and later reassembled. Items
//! are chains of chunks of one tier: a title chunk holding the header and
//! the head of the payload, followed by body chunks. Under memory pressure
//! the engine evicts from the tail of the LRU, and a coalescing migrator
//! moves live small items off fragmented parents so that whole large
//! chunks remain obtainable for the lifetime of the process.
//!
//! The engine is strictly single-writer: every operation expects the
//! caller's cache lock to be held. The only state safe to read without the
//! lock is [`StorageMetrics`].
//!
//! ## Example
//!
//! ```ignore
//! use flatstore::{FlatStorage, HashIndex};
//! use std::net::Ipv4Addr;
//!
//! let mut storage = FlatStorage::builder()
//!     .maxbytes(64 * 1024 * 1024)
//!     .build()?;
//! let mut index = HashIndex::new(16);
//!
//! let it = storage
//!     .alloc(&mut index, b"key", 0, 0, 5, Ipv4Addr::UNSPECIFIED)
//!     .expect("storage full");
//! storage.memcpy_to(it, 0, b"value", false);
//! storage.link(&mut index, it, b"key");
//! storage.deref(it);
//!
//! let hit = storage.get(&mut index, b"key").expect("miss");
//! let mut value = [0u8; 5];
//! storage.memcpy_from(&mut value, hit, 0, false);
//! storage.deref(hit);
//! ```

mod assoc;
mod chunk;
mod item;
mod layout;
mod lifecycle;
mod metrics;
mod region;
mod stats;
mod storage;

pub use assoc::{AssocIndex, HashIndex};
pub use chunk::ItemFlags;
pub use layout::{
    body_data_sz, chunks_needed, is_large_chunk, small_tier_max, title_data_sz, ChunkPtr,
    ChunkTier, ItemHandle, CACHEDUMP_LIMIT,
    ITEM_UPDATE_INTERVAL, KEY_MAX_LENGTH, LARGE_BODY_DATA_SZ, LARGE_CHUNK_SZ, LARGE_TITLE_DATA_SZ,
    LRU_SEARCH_DEPTH, MAX_ITEM_SIZE, SMALL_BODY_DATA_SZ, SMALL_CHUNKS_PER_LARGE_CHUNK,
    SMALL_CHUNK_SZ, SMALL_TITLE_DATA_SZ, STORAGE_INCREMENT_DELTA,
};
pub use lifecycle::UnlinkCause;
pub use metrics::{Counter, Gauge, StorageMetrics};
pub use stats::{DetailStats, PrefixCounters};
pub use storage::{FlatStorage, FlatStorageBuilder, Settings};
