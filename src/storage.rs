//! The storage engine core: free lists, chunk break/unbreak, the allocator
//! replenishment strategies, the coalescing migrator, and the eviction
//! driver.
//!
//! All state transitions here run under the caller's cache lock; there is no
//! internal parallelism and no suspension point. Allocator state-machine
//! preconditions and free-list consistency are checked unconditionally;
//! the wider invariant set is checked in debug builds and by
//! [`FlatStorage::check_consistency`].

use std::io;
use std::net::Ipv4Addr;

use clocksource::coarse::UnixInstant;

use crate::assoc::AssocIndex;
use crate::chunk::{self, BrokenRecord, LargeChunk, PrevSlot, SmallChunk, TitleHeader};
use crate::layout::{
    chunks_needed, is_large_chunk, ChunkPtr, ChunkTier, ItemHandle, LARGE_CHUNK_SZ,
    LRU_SEARCH_DEPTH, SMALL_CHUNKS_PER_LARGE_CHUNK, STORAGE_INCREMENT_DELTA,
};
use crate::lifecycle::UnlinkCause;
use crate::metrics::StorageMetrics;
use crate::region::Region;
use crate::stats::DetailStats;

/// Runtime-tunable scalars, owned by the engine and mutated by the caller
/// under the cache lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct Settings {
    /// Items last touched at or before this time are flushed (0 = disabled).
    pub oldest_live: u32,
    /// Record per-prefix removal detail.
    pub detail_enabled: bool,
}

/// Allocator-internal accounting, mutated only under the cache lock and
/// published through [`FlatStorage::allocator_stats`].
#[derive(Debug, Default)]
pub(crate) struct AllocatorStats {
    pub large_title_chunks: u64,
    pub large_body_chunks: u64,
    pub large_broken_chunks: u64,
    pub small_title_chunks: u64,
    pub small_body_chunks: u64,
    /// `broken_chunk_histogram[k]` = broken parents with exactly `k` used
    /// small children.
    pub broken_chunk_histogram: [u64; SMALL_CHUNKS_PER_LARGE_CHUNK + 1],
    pub break_events: u64,
    pub unbreak_events: u64,
    pub migrates: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CoalesceProgress {
    /// No unreferenced broken chunk could be reclaimed.
    NoProgress,
    /// At least one whole large chunk was formed.
    LargeChunkFormed,
}

/// The flat storage engine: a fixed-capacity region serving as both the
/// allocator and the storage for a key/value item cache.
///
/// The external key→item index is not owned by the engine; operations that
/// consult or repair it take an [`AssocIndex`] explicitly. Single-writer
/// serialisation is the caller's responsibility.
pub struct FlatStorage {
    pub(crate) region: Region,
    /// Out-of-band chunk metadata, one entry per large chunk.
    pub(crate) chunks: Vec<LargeChunk>,

    pub(crate) large_free_list: Option<ChunkPtr>,
    pub(crate) large_free_list_sz: usize,
    pub(crate) small_free_list: Option<ChunkPtr>,
    pub(crate) small_free_list_sz: usize,

    /// Most recently touched item.
    pub(crate) lru_head: Option<ItemHandle>,
    /// Next eviction candidate.
    pub(crate) lru_tail: Option<ItemHandle>,

    /// Seconds since `started`.
    pub(crate) current_time: u32,
    /// Unix time at engine construction.
    pub(crate) started: u32,

    pub(crate) settings: Settings,
    pub(crate) stats: AllocatorStats,
    pub(crate) metrics: StorageMetrics,
    pub(crate) detail: DetailStats,
}

pub struct FlatStorageBuilder {
    maxbytes: usize,
}

impl Default for FlatStorageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FlatStorageBuilder {
    pub fn new() -> Self {
        Self {
            maxbytes: 64 * 1024 * 1024,
        }
    }

    /// Set the total region size in bytes (default: 64MB).
    ///
    /// Must be a positive multiple of both `LARGE_CHUNK_SZ` and
    /// `STORAGE_INCREMENT_DELTA`; violation panics.
    pub fn maxbytes(mut self, bytes: usize) -> Self {
        self.maxbytes = bytes;
        self
    }

    pub fn build(self) -> io::Result<FlatStorage> {
        let region = Region::new(self.maxbytes)?;
        let total = region.total_chunks();
        let started = UnixInstant::now()
            .duration_since(UnixInstant::EPOCH)
            .as_secs();

        let mut storage = FlatStorage {
            region,
            chunks: (0..total).map(|_| LargeChunk::Uninitialized).collect(),
            large_free_list: None,
            large_free_list_sz: 0,
            small_free_list: None,
            small_free_list_sz: 0,
            lru_head: None,
            lru_tail: None,
            current_time: 0,
            started,
            settings: Settings::default(),
            stats: AllocatorStats::default(),
            metrics: StorageMetrics::new(),
            detail: DetailStats::new(),
        };

        let grew = storage.grow_storage();
        assert!(
            grew && storage.large_free_list_sz != 0,
            "initial growth must populate the large free list"
        );
        log::info!(
            "flat storage initialized: {} bytes in {} large chunks",
            self.maxbytes,
            total
        );
        Ok(storage)
    }
}

impl FlatStorage {
    pub fn builder() -> FlatStorageBuilder {
        FlatStorageBuilder::new()
    }

    /// Refresh `current_time` from the coarse wall clock.
    pub fn tick(&mut self) {
        let now = UnixInstant::now()
            .duration_since(UnixInstant::EPOCH)
            .as_secs();
        self.current_time = now.saturating_sub(self.started);
    }

    /// Seconds since the engine started.
    pub fn current_time(&self) -> u32 {
        self.current_time
    }

    /// Override the relative clock; tests drive time explicitly.
    pub fn set_current_time(&mut self, time: u32) {
        self.current_time = time;
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn metrics(&self) -> &StorageMetrics {
        &self.metrics
    }

    pub fn detail_stats(&self) -> &DetailStats {
        &self.detail
    }

    pub fn large_free_chunks(&self) -> usize {
        self.large_free_list_sz
    }

    pub fn small_free_chunks(&self) -> usize {
        self.small_free_list_sz
    }

    pub fn unused_memory(&self) -> usize {
        self.region.unused_memory()
    }

    // ------------------------------------------------------------------
    // chunk accessors
    // ------------------------------------------------------------------

    pub(crate) fn title(&self, it: ItemHandle) -> &TitleHeader {
        chunk::title_of(&self.chunks, it.0)
    }

    pub(crate) fn title_mut(&mut self, it: ItemHandle) -> &mut TitleHeader {
        chunk::title_of_mut(&mut self.chunks, it.0)
    }

    pub(crate) fn title_ptr(&self, p: ChunkPtr) -> &TitleHeader {
        chunk::title_of(&self.chunks, p)
    }

    pub(crate) fn title_ptr_mut(&mut self, p: ChunkPtr) -> &mut TitleHeader {
        chunk::title_of_mut(&mut self.chunks, p)
    }

    pub(crate) fn is_item_large(&self, it: ItemHandle) -> bool {
        chunk::ptr_is_large(&self.chunks, it.0)
    }

    pub(crate) fn item_tier(&self, it: ItemHandle) -> ChunkTier {
        if self.is_item_large(it) {
            ChunkTier::Large
        } else {
            ChunkTier::Small
        }
    }

    fn broken(&self, parent: usize) -> &BrokenRecord {
        match &self.chunks[parent] {
            LargeChunk::Broken(rec) => rec,
            other => panic!("chunk {parent} is not broken: {other:?}"),
        }
    }

    fn broken_mut(&mut self, parent: usize) -> &mut BrokenRecord {
        match &mut self.chunks[parent] {
            LargeChunk::Broken(rec) => rec,
            other => panic!("chunk {parent} is not broken: {other:?}"),
        }
    }

    pub(crate) fn small(&self, p: ChunkPtr) -> &SmallChunk {
        &self.broken(p.parent_index()).small[p.slot()]
    }

    pub(crate) fn small_mut(&mut self, p: ChunkPtr) -> &mut SmallChunk {
        &mut self.broken_mut(p.parent_index()).small[p.slot()]
    }

    /// Set the outgoing chain link of `p`, which is the title when `first`.
    pub(crate) fn set_next_chunk(&mut self, p: ChunkPtr, first: bool, v: Option<ChunkPtr>) {
        if first {
            self.title_ptr_mut(p).next_chunk = v;
            return;
        }
        match &mut self.chunks[p.parent_index()] {
            LargeChunk::Broken(rec) => match &mut rec.small[p.slot()] {
                SmallChunk::Body { next_chunk, .. } => *next_chunk = v,
                other => panic!("chunk {p:?} is not a small body: {other:?}"),
            },
            LargeChunk::Body { next_chunk } => *next_chunk = v,
            other => panic!("chunk {p:?} is not a body: {other:?}"),
        }
    }

    /// Set the outgoing chain link of small chunk `p` (title or body).
    fn set_small_next_chunk(&mut self, p: ChunkPtr, v: Option<ChunkPtr>) {
        match self.small_mut(p) {
            SmallChunk::Title(hdr) => hdr.next_chunk = v,
            SmallChunk::Body { next_chunk, .. } => *next_chunk = v,
            other => panic!("chunk {p:?} is not used: {other:?}"),
        }
    }

    /// Set the back link of small body chunk `p`.
    fn set_small_prev_chunk(&mut self, p: ChunkPtr, v: ChunkPtr) {
        match self.small_mut(p) {
            SmallChunk::Body { prev_chunk, .. } => *prev_chunk = v,
            other => panic!("chunk {p:?} is not a small body: {other:?}"),
        }
    }

    // ------------------------------------------------------------------
    // region growth
    // ------------------------------------------------------------------

    /// Initialize one more increment of the region, pushing the new large
    /// chunks onto the free list. Returns false once the region is fully
    /// initialized.
    pub(crate) fn grow_storage(&mut self) -> bool {
        let Some(range) = self.region.grow() else {
            return false;
        };
        self.metrics
            .storage_allocated
            .add(STORAGE_INCREMENT_DELTA as u64);
        for idx in range {
            debug_assert!(matches!(self.chunks[idx], LargeChunk::Uninitialized));
            self.chunks[idx] = LargeChunk::Detached;
            self.free_list_push(ChunkPtr::of_large(idx), ChunkTier::Large, false);
        }
        true
    }

    // ------------------------------------------------------------------
    // free lists
    // ------------------------------------------------------------------

    /// Push a detached chunk onto its tier's free list. For small chunks
    /// the parent's used count is maintained, and `try_merge` attempts a
    /// non-mandatory unbreak of the parent afterwards.
    pub(crate) fn free_list_push(&mut self, p: ChunkPtr, tier: ChunkTier, try_merge: bool) {
        debug_assert!(
            !(try_merge && tier == ChunkTier::Large),
            "large chunks cannot merge"
        );
        match tier {
            ChunkTier::Small => {
                let parent = p.parent_index();
                assert!(
                    matches!(self.small(p), SmallChunk::Detached),
                    "free-list push of a small chunk that is not detached"
                );

                let was = {
                    let rec = self.broken_mut(parent);
                    assert!(rec.allocated > 0, "used-count underflow on push");
                    rec.allocated -= 1;
                    rec.allocated as usize + 1
                };
                self.stats.broken_chunk_histogram[was] -= 1;
                self.stats.broken_chunk_histogram[was - 1] += 1;

                let old_head = self.small_free_list;
                if let Some(h) = old_head {
                    match self.small_mut(h) {
                        SmallChunk::Free { prev_next, .. } => *prev_next = PrevSlot::Node(p),
                        other => panic!("free list head is not free: {other:?}"),
                    }
                }
                *self.small_mut(p) = SmallChunk::Free {
                    next: old_head,
                    prev_next: PrevSlot::Head,
                };
                self.small_free_list = Some(p);
                self.small_free_list_sz += 1;

                if try_merge {
                    self.unbreak_large_chunk(parent, false);
                }
            }
            ChunkTier::Large => {
                debug_assert!(p.is_large_aligned());
                let idx = p.parent_index();
                assert!(
                    matches!(self.chunks[idx], LargeChunk::Detached),
                    "free-list push of a large chunk that is not detached"
                );
                self.chunks[idx] = LargeChunk::Free {
                    next: self.large_free_list,
                };
                self.large_free_list = Some(p);
                self.large_free_list_sz += 1;
            }
        }
    }

    /// Pop the head of a free list; the returned chunk is detached.
    pub(crate) fn free_list_pop(&mut self, tier: ChunkTier) -> Option<ChunkPtr> {
        match tier {
            ChunkTier::Small => {
                let head = self.small_free_list?;
                let parent = head.parent_index();

                let now = {
                    let rec = self.broken_mut(parent);
                    rec.allocated += 1;
                    assert!(
                        rec.allocated as usize <= SMALL_CHUNKS_PER_LARGE_CHUNK,
                        "used-count overflow on pop"
                    );
                    rec.allocated as usize
                };
                self.stats.broken_chunk_histogram[now - 1] -= 1;
                self.stats.broken_chunk_histogram[now] += 1;

                let next = match self.small(head) {
                    SmallChunk::Free { next, prev_next } => {
                        assert_eq!(*prev_next, PrevSlot::Head, "free list head link corrupt");
                        *next
                    }
                    other => panic!("free list head is not free: {other:?}"),
                };
                self.small_free_list = next;
                if let Some(n) = next {
                    match self.small_mut(n) {
                        SmallChunk::Free { prev_next, .. } => *prev_next = PrevSlot::Head,
                        other => panic!("free list node is not free: {other:?}"),
                    }
                }
                self.small_free_list_sz -= 1;
                *self.small_mut(head) = SmallChunk::Detached;
                Some(head)
            }
            ChunkTier::Large => {
                let head = self.large_free_list?;
                let idx = head.parent_index();
                let next = match &self.chunks[idx] {
                    LargeChunk::Free { next } => *next,
                    other => panic!("free list head is not free: {other:?}"),
                };
                self.large_free_list = next;
                self.large_free_list_sz -= 1;
                self.chunks[idx] = LargeChunk::Detached;
                Some(head)
            }
        }
    }

    /// Remove a small chunk from anywhere in the free list in O(1) by
    /// writing through its `prev_next` slot. The chunk is left detached;
    /// the parent's used count is untouched.
    fn small_free_unlink(&mut self, p: ChunkPtr) {
        let (next, prev_next) = match self.small(p) {
            SmallChunk::Free { next, prev_next } => (*next, *prev_next),
            other => panic!("unlink of a small chunk that is not free: {other:?}"),
        };
        match prev_next {
            PrevSlot::Head => {
                assert_eq!(self.small_free_list, Some(p), "prev slot does not point back");
                self.small_free_list = next;
            }
            PrevSlot::Node(q) => match self.small_mut(q) {
                SmallChunk::Free { next: q_next, .. } => {
                    assert_eq!(*q_next, Some(p), "prev slot does not point back");
                    *q_next = next;
                }
                other => panic!("prev slot chunk is not free: {other:?}"),
            },
        }
        if let Some(n) = next {
            match self.small_mut(n) {
                SmallChunk::Free { prev_next: n_prev, .. } => *n_prev = prev_next,
                other => panic!("free list node is not free: {other:?}"),
            }
        }
        self.small_free_list_sz -= 1;
        *self.small_mut(p) = SmallChunk::Detached;
    }

    // ------------------------------------------------------------------
    // break / unbreak
    // ------------------------------------------------------------------

    /// Subdivide a detached large chunk into small chunks, pushing all of
    /// them onto the small free list. Children are pushed in reverse slot
    /// order so the head-most entries carry the lowest slots.
    pub(crate) fn break_large_chunk(&mut self, p: ChunkPtr) {
        let idx = p.parent_index();
        assert!(
            matches!(self.chunks[idx], LargeChunk::Detached),
            "break of a large chunk that is not detached"
        );
        // The fresh record seeds `allocated` at the child count so the
        // per-child pushes below can decrement; register the matching
        // histogram entry first.
        self.chunks[idx] = LargeChunk::Broken(Box::new(BrokenRecord::new()));
        self.stats.broken_chunk_histogram[SMALL_CHUNKS_PER_LARGE_CHUNK] += 1;

        for slot in (0..SMALL_CHUNKS_PER_LARGE_CHUNK).rev() {
            self.free_list_push(ChunkPtr::of_small(idx, slot), ChunkTier::Small, false);
        }
        debug_assert_eq!(self.broken(idx).allocated, 0);

        self.stats.large_broken_chunks += 1;
        self.stats.break_events += 1;
        log::trace!("broke large chunk {idx}");
    }

    /// Reassemble a broken large chunk and return it to the large free
    /// list. The non-mandatory form is a no-op while any child is still
    /// used; the mandatory form (coalescer) requires the used count to be
    /// zero and accepts coalesce-pending children.
    pub(crate) fn unbreak_large_chunk(&mut self, parent: usize, mandatory: bool) {
        let allocated = self.broken(parent).allocated;
        if !mandatory {
            if allocated != 0 {
                return;
            }
            for child in &self.broken(parent).small {
                debug_assert!(!child.is_used(), "unbreak with used child: {child:?}");
            }
        } else {
            assert_eq!(allocated, 0, "mandatory unbreak with used children");
        }

        for slot in 0..SMALL_CHUNKS_PER_LARGE_CHUNK {
            let p = ChunkPtr::of_small(parent, slot);
            match self.small(p) {
                SmallChunk::Free { .. } => self.small_free_unlink(p),
                // Pending children are simply released with the record.
                SmallChunk::CoalescePending => {}
                other => panic!("unbreak with live child {p:?}: {other:?}"),
            }
        }

        self.chunks[parent] = LargeChunk::Detached;
        self.free_list_push(ChunkPtr::of_large(parent), ChunkTier::Large, false);

        self.stats.large_broken_chunks -= 1;
        self.stats.broken_chunk_histogram[0] -= 1;
        self.stats.unbreak_events += 1;
        log::trace!("unbroke large chunk {parent}");
    }

    // ------------------------------------------------------------------
    // coalescer
    // ------------------------------------------------------------------

    /// Whether any small child of `p`'s item is externally referenced.
    /// Free and coalesce-pending chunks count as unreferenced; used chunks
    /// resolve to their title's refcount.
    fn small_chunk_referenced(&self, p: ChunkPtr) -> bool {
        match self.small(p) {
            SmallChunk::Free { .. } | SmallChunk::CoalescePending => false,
            SmallChunk::Title(hdr) => hdr.refcount != 0,
            SmallChunk::Body { .. } => {
                let mut cur = p;
                loop {
                    match self.small(cur) {
                        SmallChunk::Title(hdr) => return hdr.refcount != 0,
                        SmallChunk::Body { prev_chunk, .. } => cur = *prev_chunk,
                        other => panic!("item chain broken at {cur:?}: {other:?}"),
                    }
                }
            }
            SmallChunk::Detached => panic!("detached child {p:?} during referenced scan"),
        }
    }

    fn broken_chunk_referenced(&self, parent: usize) -> bool {
        (0..SMALL_CHUNKS_PER_LARGE_CHUNK)
            .any(|slot| self.small_chunk_referenced(ChunkPtr::of_small(parent, slot)))
    }

    /// Scan the small free list for the first broken parent with no
    /// referenced child. `search_depth == 0` means unbounded.
    fn find_unreferenced_broken(&self, search_depth: usize) -> Option<usize> {
        let mut cur = self.small_free_list;
        let mut count = 0;
        while let Some(p) = cur {
            if search_depth != 0 && count >= search_depth {
                break;
            }
            let parent = p.parent_index();
            if !self.broken_chunk_referenced(parent) {
                return Some(parent);
            }
            cur = match self.small(p) {
                SmallChunk::Free { next, .. } => *next,
                other => panic!("free list node is not free: {other:?}"),
            };
            count += 1;
        }
        None
    }

    /// Consolidate small-chunk fragmentation into whole large chunks by
    /// migrating the live items off unreferenced broken parents.
    ///
    /// The parent's own free children are first withheld from the free list
    /// (marked coalesce-pending) so they cannot be handed out as
    /// replacements for the very chunks being vacated. Each used child is
    /// then byte-copied to a replacement popped from the free list, and
    /// every back-reference is repaired: LRU neighbours, the intra-item
    /// chain, and the external index binding for titles.
    pub(crate) fn coalesce<A: AssocIndex>(&mut self, index: &mut A) -> CoalesceProgress {
        let mut progress = CoalesceProgress::NoProgress;

        while self.small_free_list_sz >= SMALL_CHUNKS_PER_LARGE_CHUNK {
            let Some(parent) = self.find_unreferenced_broken(0) else {
                // Nothing migratable; stop rather than spin.
                return progress;
            };

            let allocated = self.broken(parent).allocated as usize;
            // The parent leaves the histogram for the duration of the
            // migration; it re-enters at occupancy zero below.
            self.stats.broken_chunk_histogram[allocated] -= 1;
            self.stats.migrates += allocated as u64;

            if allocated != 0 {
                for slot in 0..SMALL_CHUNKS_PER_LARGE_CHUNK {
                    let p = ChunkPtr::of_small(parent, slot);
                    if self.small(p).is_free() {
                        self.small_free_unlink(p);
                        *self.small_mut(p) = SmallChunk::CoalescePending;
                    }
                }

                for slot in 0..SMALL_CHUNKS_PER_LARGE_CHUNK {
                    let old = ChunkPtr::of_small(parent, slot);
                    match self.small(old).clone() {
                        SmallChunk::Title(hdr) => {
                            let repl = self
                                .free_list_pop(ChunkTier::Small)
                                .expect("free list holds a replacement chunk");
                            self.region.move_small_chunk(old, repl);
                            *self.small_mut(repl) = SmallChunk::Title(hdr.clone());

                            match hdr.next {
                                Some(n) => {
                                    debug_assert_eq!(self.title_ptr(n).prev, Some(old));
                                    self.title_ptr_mut(n).prev = Some(repl);
                                }
                                None => {
                                    debug_assert_eq!(self.lru_tail, Some(ItemHandle(old)));
                                    self.lru_tail = Some(ItemHandle(repl));
                                }
                            }
                            match hdr.prev {
                                Some(pv) => {
                                    debug_assert_eq!(self.title_ptr(pv).next, Some(old));
                                    self.title_ptr_mut(pv).next = Some(repl);
                                }
                                None => {
                                    debug_assert_eq!(self.lru_head, Some(ItemHandle(old)));
                                    self.lru_head = Some(ItemHandle(repl));
                                }
                            }
                            if let Some(nc) = hdr.next_chunk {
                                self.set_small_prev_chunk(nc, repl);
                            }
                            index.update(self, ItemHandle(old), ItemHandle(repl));

                            *self.small_mut(old) = SmallChunk::CoalescePending;
                            self.broken_mut(parent).allocated -= 1;
                        }
                        SmallChunk::Body {
                            prev_chunk,
                            next_chunk,
                        } => {
                            let repl = self
                                .free_list_pop(ChunkTier::Small)
                                .expect("free list holds a replacement chunk");
                            self.region.move_small_chunk(old, repl);
                            *self.small_mut(repl) = SmallChunk::Body {
                                prev_chunk,
                                next_chunk,
                            };

                            self.set_small_next_chunk(prev_chunk, Some(repl));
                            if let Some(nc) = next_chunk {
                                self.set_small_prev_chunk(nc, repl);
                            }

                            *self.small_mut(old) = SmallChunk::CoalescePending;
                            self.broken_mut(parent).allocated -= 1;
                        }
                        SmallChunk::CoalescePending => {}
                        other => panic!("unexpected child during coalesce: {other:?}"),
                    }
                }
            }

            self.stats.broken_chunk_histogram[0] += 1;
            self.unbreak_large_chunk(parent, true);
            progress = CoalesceProgress::LargeChunkFormed;
            log::debug!("coalesce reclaimed large chunk {parent} ({allocated} migrations)");
        }

        progress
    }

    // ------------------------------------------------------------------
    // eviction driver
    // ------------------------------------------------------------------

    /// The oldest LRU item with no outstanding reference, looking at most
    /// `LRU_SEARCH_DEPTH` items from the tail.
    pub(crate) fn get_lru_item(&self) -> Option<ItemHandle> {
        let mut cur = self.lru_tail;
        for _ in 0..LRU_SEARCH_DEPTH {
            let it = cur?;
            if self.title(it).refcount == 0 {
                return Some(it);
            }
            cur = self.title(it).prev.map(ItemHandle);
        }
        None
    }

    /// Unlink LRU-tail items until the free lists can satisfy `needed`
    /// chunks of `tier`. Returns false when no evictable item remains
    /// within the search depth.
    pub(crate) fn lru_evict<A: AssocIndex>(
        &mut self,
        index: &mut A,
        tier: ChunkTier,
        needed: usize,
    ) -> bool {
        loop {
            let Some(victim) = self.get_lru_item() else {
                return false;
            };
            self.unlink(index, victim, UnlinkCause::MaybeEvict, None);

            match tier {
                ChunkTier::Small => {
                    // Numerical capacity is enough: the allocator breaks
                    // large chunks on its own.
                    if self.large_free_list_sz * SMALL_CHUNKS_PER_LARGE_CHUNK
                        + self.small_free_list_sz
                        >= needed
                    {
                        return true;
                    }
                }
                ChunkTier::Large => {
                    if self.large_free_list_sz >= needed {
                        return true;
                    }
                    if self.large_free_list_sz * SMALL_CHUNKS_PER_LARGE_CHUNK
                        + self.small_free_list_sz
                        >= needed * SMALL_CHUNKS_PER_LARGE_CHUNK
                    {
                        if self.coalesce(index) == CoalesceProgress::NoProgress {
                            continue;
                        }
                        if self.large_free_list_sz >= needed {
                            return true;
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // allocation
    // ------------------------------------------------------------------

    /// Allocate an item able to hold a key of `key.len()` bytes and a value
    /// of `nbytes`. The key is written; the value area is uninitialized and
    /// is filled by the caller via [`FlatStorage::memcpy_to`]. Remaining
    /// tail slack is stamped with the current time and, if space allows,
    /// the client address.
    ///
    /// The caller holds the single reference of the returned item; the item
    /// is not visible to anyone else until [`FlatStorage::link`].
    ///
    /// Returns `None` on oversize input or when every replenishment
    /// strategy is exhausted.
    pub fn alloc<A: AssocIndex>(
        &mut self,
        index: &mut A,
        key: &[u8],
        flags: u32,
        exptime: u32,
        nbytes: usize,
        addr: Ipv4Addr,
    ) -> Option<ItemHandle> {
        let nkey = key.len();
        if !self.size_ok(nkey, flags, nbytes) {
            return None;
        }

        let tier = if is_large_chunk(nkey, nbytes) {
            ChunkTier::Large
        } else {
            ChunkTier::Small
        };
        let needed = chunks_needed(nkey, nbytes, tier);

        match tier {
            ChunkTier::Large => {
                // Strategy order: grow, coalesce (when numerically
                // possible), evict. Each pass must move a free-list size.
                let mut prev_free = self.large_free_list_sz.wrapping_sub(1);
                while self.large_free_list_sz < needed {
                    debug_assert_ne!(
                        prev_free, self.large_free_list_sz,
                        "replenishment made no progress"
                    );
                    prev_free = self.large_free_list_sz;

                    if self.grow_storage() {
                        continue;
                    }
                    if self.large_free_list_sz * SMALL_CHUNKS_PER_LARGE_CHUNK
                        + self.small_free_list_sz
                        >= needed * SMALL_CHUNKS_PER_LARGE_CHUNK
                    {
                        self.coalesce(index);
                    }
                    if prev_free != self.large_free_list_sz {
                        continue;
                    }
                    if self.lru_evict(index, ChunkTier::Large, needed) {
                        continue;
                    }

                    log::warn!("alloc failed: {needed} large chunks unobtainable");
                    self.metrics.allocation_failures.increment();
                    return None;
                }
            }
            ChunkTier::Small => {
                // Strategy order: break a large chunk, grow, evict.
                let mut prev_small = self.small_free_list_sz.wrapping_sub(1);
                let mut prev_large = self.large_free_list_sz;
                while self.small_free_list_sz < needed {
                    debug_assert!(
                        prev_small != self.small_free_list_sz
                            || prev_large != self.large_free_list_sz,
                        "replenishment made no progress"
                    );
                    prev_small = self.small_free_list_sz;
                    prev_large = self.large_free_list_sz;

                    if self.large_free_list_sz > 0 {
                        let lc = self
                            .free_list_pop(ChunkTier::Large)
                            .expect("large free list is non-empty");
                        self.break_large_chunk(lc);
                        continue;
                    }
                    if self.grow_storage() {
                        continue;
                    }
                    if self.lru_evict(index, ChunkTier::Small, needed) {
                        continue;
                    }

                    log::warn!("alloc failed: {needed} small chunks unobtainable");
                    self.metrics.allocation_failures.increment();
                    return None;
                }
            }
        }

        // Chain the chunks: title first, then bodies.
        let title_ptr = self
            .free_list_pop(tier)
            .expect("free list was just replenished");
        let hdr = TitleHeader::new(nkey as u8, nbytes as u32, flags, exptime);
        match tier {
            ChunkTier::Large => {
                self.chunks[title_ptr.parent_index()] = LargeChunk::Title(hdr);
                self.stats.large_title_chunks += 1;
                self.stats.large_body_chunks += (needed - 1) as u64;
            }
            ChunkTier::Small => {
                *self.small_mut(title_ptr) = SmallChunk::Title(hdr);
                self.stats.small_title_chunks += 1;
                self.stats.small_body_chunks += (needed - 1) as u64;
            }
        }

        let mut prev = title_ptr;
        for i in 1..needed {
            let body = self
                .free_list_pop(tier)
                .expect("free list was just replenished");
            match tier {
                ChunkTier::Large => {
                    self.chunks[body.parent_index()] = LargeChunk::Body { next_chunk: None }
                }
                ChunkTier::Small => {
                    *self.small_mut(body) = SmallChunk::Body {
                        prev_chunk: prev,
                        next_chunk: None,
                    }
                }
            }
            self.set_next_chunk(prev, i == 1, Some(body));
            prev = body;
        }

        let it = ItemHandle(title_ptr);
        self.write_key(it, key);
        self.try_item_stamp(it, addr);
        Some(it)
    }

    /// Return every chunk of an item to the free lists. The item must hold
    /// no reference and be fully unlinked.
    pub(crate) fn item_free(&mut self, it: ItemHandle) {
        {
            let hdr = self.title(it);
            debug_assert_eq!(
                hdr.it_flags & !(chunk::ItemFlags::HAS_TIMESTAMP | chunk::ItemFlags::HAS_IP_ADDRESS),
                chunk::ItemFlags::VALID
            );
            assert_eq!(hdr.refcount, 0, "free of a referenced item");
            debug_assert!(hdr.next.is_none() && hdr.prev.is_none());
            debug_assert!(hdr.h_next.is_none());
        }
        #[cfg(debug_assertions)]
        let expected = self.chunks_in_item(it);

        let tier = self.item_tier(it);
        let try_merge = tier == ChunkTier::Small;

        let mut freed_bodies = 0u64;
        let mut next = self.title(it).next_chunk;
        while let Some(body) = next {
            next = chunk::next_chunk_of(&self.chunks, body, false);
            match tier {
                ChunkTier::Large => {
                    debug_assert!(matches!(
                        self.chunks[body.parent_index()],
                        LargeChunk::Body { .. }
                    ));
                    self.chunks[body.parent_index()] = LargeChunk::Detached;
                }
                ChunkTier::Small => {
                    debug_assert!(matches!(self.small(body), SmallChunk::Body { .. }));
                    *self.small_mut(body) = SmallChunk::Detached;
                }
            }
            self.free_list_push(body, tier, try_merge);
            freed_bodies += 1;
        }

        let title_ptr = it.0;
        match tier {
            ChunkTier::Large => {
                self.stats.large_body_chunks -= freed_bodies;
                self.stats.large_title_chunks -= 1;
                self.chunks[title_ptr.parent_index()] = LargeChunk::Detached;
            }
            ChunkTier::Small => {
                self.stats.small_body_chunks -= freed_bodies;
                self.stats.small_title_chunks -= 1;
                *self.small_mut(title_ptr) = SmallChunk::Detached;
            }
        }
        self.free_list_push(title_ptr, tier, try_merge);

        #[cfg(debug_assertions)]
        debug_assert_eq!(freed_bodies as usize + 1, expected);
    }

    // ------------------------------------------------------------------
    // consistency checking
    // ------------------------------------------------------------------

    /// Validate the full invariant set: chunk conservation, histogram vs
    /// census, free-list threading, LRU linkage, and per-item chains.
    /// Intended for tests and debugging; panics on the first violation.
    pub fn check_consistency(&self) {
        let initialized = self.region.initialized_chunks();
        assert_eq!(
            self.region.unused_memory(),
            (self.region.total_chunks() - initialized) * LARGE_CHUNK_SZ
        );

        let mut free_large = 0usize;
        let mut broken = 0usize;
        let mut large_titles = 0u64;
        let mut large_bodies = 0u64;
        let mut small_titles = 0u64;
        let mut small_bodies = 0u64;
        let mut free_small = 0usize;
        let mut census = [0u64; SMALL_CHUNKS_PER_LARGE_CHUNK + 1];

        for idx in 0..self.chunks.len() {
            if idx >= initialized {
                assert!(
                    matches!(self.chunks[idx], LargeChunk::Uninitialized),
                    "chunk {idx} beyond the initialized frontier has state"
                );
                continue;
            }
            match &self.chunks[idx] {
                LargeChunk::Uninitialized => panic!("initialized chunk {idx} marked uninitialized"),
                LargeChunk::Detached => panic!("chunk {idx} left detached between operations"),
                LargeChunk::Free { .. } => free_large += 1,
                LargeChunk::Title(_) => large_titles += 1,
                LargeChunk::Body { .. } => large_bodies += 1,
                LargeChunk::Broken(rec) => {
                    broken += 1;
                    let mut used = 0usize;
                    for (slot, child) in rec.small.iter().enumerate() {
                        match child {
                            SmallChunk::Title(_) => {
                                used += 1;
                                small_titles += 1;
                            }
                            SmallChunk::Body { .. } => {
                                used += 1;
                                small_bodies += 1;
                            }
                            SmallChunk::Free { .. } => free_small += 1,
                            SmallChunk::CoalescePending => {
                                panic!("coalesce-pending child {idx}/{slot} between operations")
                            }
                            SmallChunk::Detached => {
                                panic!("detached child {idx}/{slot} between operations")
                            }
                        }
                    }
                    assert_eq!(rec.allocated as usize, used, "used count of parent {idx}");
                    census[used] += 1;
                }
            }
        }

        assert_eq!(self.stats.large_broken_chunks, broken as u64);
        assert_eq!(self.stats.large_title_chunks, large_titles);
        assert_eq!(self.stats.large_body_chunks, large_bodies);
        assert_eq!(self.stats.small_title_chunks, small_titles);
        assert_eq!(self.stats.small_body_chunks, small_bodies);
        for k in 0..=SMALL_CHUNKS_PER_LARGE_CHUNK {
            assert_eq!(
                self.stats.broken_chunk_histogram[k], census[k],
                "histogram disagrees with census at occupancy {k}"
            );
        }

        // Large free list: every node free, counter matches, cycle-free.
        let mut count = 0usize;
        let mut cur = self.large_free_list;
        while let Some(p) = cur {
            assert!(p.is_large_aligned());
            cur = match &self.chunks[p.parent_index()] {
                LargeChunk::Free { next } => *next,
                other => panic!("large free list node {p:?} not free: {other:?}"),
            };
            count += 1;
            assert!(count <= free_large, "large free list cycle");
        }
        assert_eq!(count, self.large_free_list_sz);
        assert_eq!(count, free_large);

        // Small free list: threading invariant *(n.prev_next) == n.
        let mut count = 0usize;
        let mut expected = PrevSlot::Head;
        let mut cur = self.small_free_list;
        while let Some(p) = cur {
            match self.small(p) {
                SmallChunk::Free { next, prev_next } => {
                    assert_eq!(*prev_next, expected, "prev slot of {p:?} does not point back");
                    expected = PrevSlot::Node(p);
                    cur = *next;
                }
                other => panic!("small free list node {p:?} not free: {other:?}"),
            }
            count += 1;
            assert!(count <= free_small, "small free list cycle");
        }
        assert_eq!(count, self.small_free_list_sz);
        assert_eq!(count, free_small);

        // LRU linkage and per-item chains.
        assert_eq!(self.lru_head.is_none(), self.lru_tail.is_none());
        let mut prev_ptr: Option<ChunkPtr> = None;
        let mut cur = self.lru_head;
        let mut members = 0usize;
        while let Some(it) = cur {
            let hdr = self.title(it);
            assert_eq!(hdr.prev, prev_ptr, "LRU back link of {it:?}");
            assert!(hdr.it_flags.contains(chunk::ItemFlags::LINKED));
            self.check_item_chain(it);
            if hdr.next.is_none() {
                assert_eq!(self.lru_tail, Some(it));
            }
            prev_ptr = Some(it.0);
            cur = hdr.next.map(ItemHandle);
            members += 1;
            assert!(
                members as u64 <= large_titles + small_titles,
                "LRU cycle"
            );
        }
    }

    fn check_item_chain(&self, it: ItemHandle) {
        let hdr = self.title(it);
        let tier = self.item_tier(it);
        let expected = chunks_needed(hdr.nkey as usize, hdr.nbytes as usize, tier);

        let mut len = 1usize;
        let mut prev = it.0;
        let mut cur = hdr.next_chunk;
        while let Some(p) = cur {
            match tier {
                ChunkTier::Large => {
                    assert!(matches!(self.chunks[p.parent_index()], LargeChunk::Body { .. }));
                }
                ChunkTier::Small => match self.small(p) {
                    SmallChunk::Body { prev_chunk, .. } => {
                        assert_eq!(*prev_chunk, prev, "back link of body {p:?}");
                    }
                    other => panic!("chain chunk {p:?} not a small body: {other:?}"),
                },
            }
            prev = p;
            cur = chunk::next_chunk_of(&self.chunks, p, false);
            len += 1;
            assert!(len <= expected, "item chain longer than expected");
        }
        assert_eq!(len, expected, "item chain length");
    }
}
