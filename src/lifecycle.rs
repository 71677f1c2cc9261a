//! Item lifecycle: LRU maintenance and the link/unlink/get/deref family.
//!
//! Linked items appear exactly once in the LRU and once in the external
//! index; unlinked items appear in neither. An item is physically freed
//! only once it is unlinked and its refcount reaches zero, so a handle
//! returned by `get` stays valid until the matching `deref` regardless of
//! intervening unlinks.

use crate::assoc::AssocIndex;
use crate::chunk::ItemFlags;
use crate::layout::{ItemHandle, ITEM_UPDATE_INTERVAL};
use crate::storage::FlatStorage;

/// Why an item is being unlinked. `MaybeEvict` is resolved to `Evict` or
/// `Expired` from the item's expiry at unlink time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlinkCause {
    /// Explicit removal (delete, replace).
    Normal,
    /// Reclaim by the eviction driver; resolved against `exptime`.
    MaybeEvict,
    /// Reclaim of a live item under memory pressure.
    Evict,
    /// Removal of an item past its expiry.
    Expired,
}

impl FlatStorage {
    // ------------------------------------------------------------------
    // LRU list
    // ------------------------------------------------------------------

    fn link_q(&mut self, it: ItemHandle) {
        debug_assert!(self.title(it).next.is_none());
        debug_assert!(self.title(it).prev.is_none());
        debug_assert_eq!(self.lru_head.is_none(), self.lru_tail.is_none());

        if let Some(head) = self.lru_head {
            self.title_mut(it).next = Some(head.0);
            self.title_mut(head).prev = Some(it.0);
        }
        self.lru_head = Some(it);
        if self.lru_tail.is_none() {
            self.lru_tail = Some(it);
        }
    }

    fn unlink_q(&mut self, it: ItemHandle) {
        let next = self.title(it).next;
        let prev = self.title(it).prev;

        if self.lru_head == Some(it) {
            debug_assert!(prev.is_none());
            self.lru_head = next.map(ItemHandle);
        }
        if self.lru_tail == Some(it) {
            debug_assert!(next.is_none());
            self.lru_tail = prev.map(ItemHandle);
        }

        if let Some(n) = next {
            self.title_ptr_mut(n).prev = prev;
        }
        if let Some(p) = prev {
            self.title_ptr_mut(p).next = next;
        }
        self.title_mut(it).next = None;
        self.title_mut(it).prev = None;
    }

    /// Refresh the item's touch time and reposition it at the LRU head,
    /// rate-limited so hot items do not thrash the list.
    pub fn update(&mut self, it: ItemHandle) {
        let hdr = self.title(it);
        if self.current_time.saturating_sub(hdr.time) > ITEM_UPDATE_INTERVAL {
            debug_assert!(hdr.it_flags.contains(ItemFlags::VALID));
            if hdr.it_flags.contains(ItemFlags::LINKED) {
                self.unlink_q(it);
                self.title_mut(it).time = self.current_time;
                self.link_q(it);
            }
        }
    }

    // ------------------------------------------------------------------
    // link / unlink
    // ------------------------------------------------------------------

    /// Publish a freshly allocated item: insert it into the index and at
    /// the LRU head.
    pub fn link<A: AssocIndex>(&mut self, index: &mut A, it: ItemHandle, key: &[u8]) {
        {
            let hdr = self.title(it);
            assert!(hdr.it_flags.contains(ItemFlags::VALID));
            assert!(!hdr.it_flags.contains(ItemFlags::LINKED), "double link");
        }
        let now = self.current_time;
        {
            let hdr = self.title_mut(it);
            hdr.it_flags.insert(ItemFlags::LINKED);
            hdr.time = now;
        }
        index.insert(self, it, key);

        let total = (self.title(it).nkey as i64) + (self.title(it).nbytes as i64);
        self.metrics.bytes_live.add(total);
        self.metrics.items_live.increment();
        self.metrics.items_total.increment();

        self.link_q(it);
    }

    /// Remove the item from the index and the LRU. A no-op unless linked.
    /// The item is freed immediately when no reference is outstanding,
    /// otherwise freeing is deferred to the final [`FlatStorage::deref`].
    ///
    /// `key` avoids re-flattening when the caller already has it; pass
    /// `None` to have the key read from the item.
    pub fn unlink<A: AssocIndex>(
        &mut self,
        index: &mut A,
        it: ItemHandle,
        cause: UnlinkCause,
        key: Option<&[u8]>,
    ) {
        let owned;
        let key: &[u8] = match key {
            Some(k) => k,
            None => {
                owned = self.item_key(it).into_owned();
                &owned
            }
        };

        debug_assert!(self.title(it).it_flags.contains(ItemFlags::VALID));
        if !self.title(it).it_flags.contains(ItemFlags::LINKED) {
            return;
        }
        // Leaving the namespace also ends any delete lock.
        self.title_mut(it)
            .it_flags
            .remove(ItemFlags::LINKED | ItemFlags::DELETED);

        let exptime = self.title(it).exptime;
        let cause = match cause {
            UnlinkCause::MaybeEvict => {
                if exptime == 0 || exptime > self.current_time {
                    UnlinkCause::Evict
                } else {
                    UnlinkCause::Expired
                }
            }
            other => other,
        };

        let total = (self.title(it).nkey as i64) + (self.title(it).nbytes as i64);
        self.metrics.bytes_live.sub(total);
        self.metrics.items_live.decrement();
        match cause {
            UnlinkCause::Evict => {
                self.metrics.evictions.increment();
                log::debug!("evicted item ({total} bytes)");
            }
            UnlinkCause::Expired => self.metrics.expirations.increment(),
            _ => {}
        }
        if self.settings.detail_enabled {
            self.detail.record_removal(key, total as u64, cause);
        }

        index.delete(self, key);
        self.title_mut(it).h_next = None;
        self.unlink_q(it);
        if self.title(it).refcount == 0 {
            self.item_free(it);
        }
    }

    /// Atomically swap `old` for `new` under the same key.
    pub fn replace<A: AssocIndex>(
        &mut self,
        index: &mut A,
        old: ItemHandle,
        new: ItemHandle,
        key: &[u8],
    ) {
        debug_assert!(self
            .title(old)
            .it_flags
            .contains(ItemFlags::VALID | ItemFlags::LINKED));
        self.unlink(index, old, UnlinkCause::Normal, Some(key));
        debug_assert!(self.title(new).it_flags.contains(ItemFlags::VALID));
        self.link(index, new, key);
    }

    // ------------------------------------------------------------------
    // get / deref
    // ------------------------------------------------------------------

    /// Look the key up, reaping it if flushed or expired. On a hit the
    /// refcount is bumped; the caller must `deref` the handle.
    pub fn get<A: AssocIndex>(&mut self, index: &mut A, key: &[u8]) -> Option<ItemHandle> {
        self.get_notedeleted(index, key).0
    }

    /// Like [`FlatStorage::get`], additionally reporting whether the miss
    /// was caused by a still-active delete lock.
    pub fn get_notedeleted<A: AssocIndex>(
        &mut self,
        index: &mut A,
        key: &[u8],
    ) -> (Option<ItemHandle>, bool) {
        let mut delete_locked = false;
        let mut found = index.find(self, key);

        if let Some(it) = found {
            if self.title(it).it_flags.contains(ItemFlags::DELETED) && !self.delete_lock_over(it) {
                delete_locked = true;
                found = None;
            }
        }
        if let Some(it) = found {
            let oldest_live = self.settings.oldest_live;
            if oldest_live != 0
                && oldest_live <= self.current_time
                && self.title(it).time <= oldest_live
            {
                self.unlink(index, it, UnlinkCause::Expired, Some(key));
                found = None;
            }
        }
        if let Some(it) = found {
            let exptime = self.title(it).exptime;
            if exptime != 0 && exptime <= self.current_time {
                self.unlink(index, it, UnlinkCause::Expired, Some(key));
                found = None;
            }
        }

        if let Some(it) = found {
            self.title_mut(it).refcount += 1;
        }
        (found, delete_locked)
    }

    /// Index lookup with no expiry or delete-lock checks; still bumps the
    /// refcount on a hit.
    pub fn get_nocheck<A: AssocIndex>(&mut self, index: &A, key: &[u8]) -> Option<ItemHandle> {
        let found = index.find(self, key);
        if let Some(it) = found {
            self.title_mut(it).refcount += 1;
        }
        found
    }

    /// Release one reference. Frees the item once it is both unreferenced
    /// and unlinked.
    pub fn deref(&mut self, it: ItemHandle) {
        debug_assert!(self.title(it).it_flags.contains(ItemFlags::VALID));
        {
            let hdr = self.title_mut(it);
            // The unlink may have preceded the release, so the count can
            // already be zero here.
            if hdr.refcount != 0 {
                hdr.refcount -= 1;
            }
        }
        let hdr = self.title(it);
        debug_assert!(!hdr.it_flags.contains(ItemFlags::DELETED) || hdr.refcount != 0);
        if hdr.refcount == 0 && !hdr.it_flags.contains(ItemFlags::LINKED) {
            self.item_free(it);
        }
    }

    // ------------------------------------------------------------------
    // delete lock
    // ------------------------------------------------------------------

    /// Mark the item delete-locked until `locked_until`. The caller must
    /// hold a reference for the duration of the lock; `exptime` is
    /// repurposed as the lock expiry, so once the lock lapses the normal
    /// expiry path reaps the item.
    pub fn mark_deleted(&mut self, it: ItemHandle, locked_until: u32) {
        let hdr = self.title_mut(it);
        debug_assert!(hdr.it_flags.contains(ItemFlags::VALID));
        debug_assert!(hdr.refcount > 0, "delete lock without a held reference");
        hdr.it_flags.insert(ItemFlags::DELETED);
        hdr.exptime = locked_until;
    }

    /// Whether a delete-locked item's lock has lapsed.
    pub fn delete_lock_over(&self, it: ItemHandle) -> bool {
        debug_assert!(self.title(it).it_flags.contains(ItemFlags::DELETED));
        self.current_time >= self.title(it).exptime
    }

    // ------------------------------------------------------------------
    // flush
    // ------------------------------------------------------------------

    /// Unlink every item whose touch time is at or past
    /// `settings.oldest_live`. The LRU is ordered by touch time descending
    /// from the head (insertion is always at the head and `update` only
    /// moves items head-ward), so the scan stops at the first older item.
    pub fn flush_expired<A: AssocIndex>(&mut self, index: &mut A) {
        if self.settings.oldest_live == 0 {
            return;
        }
        let mut cur = self.lru_head;
        while let Some(it) = cur {
            if self.title(it).time < self.settings.oldest_live {
                break;
            }
            cur = self.title(it).next.map(ItemHandle);
            debug_assert!(self
                .title(it)
                .it_flags
                .contains(ItemFlags::VALID | ItemFlags::LINKED));
            self.unlink(index, it, UnlinkCause::Expired, None);
        }
    }

    // ------------------------------------------------------------------
    // index plumbing
    // ------------------------------------------------------------------

    /// The item's index chain link. Owned by the external index.
    pub fn index_link(&self, it: ItemHandle) -> Option<ItemHandle> {
        self.title(it).h_next
    }

    /// Set the item's index chain link. Owned by the external index.
    pub fn set_index_link(&mut self, it: ItemHandle, link: Option<ItemHandle>) {
        self.title_mut(it).h_next = link;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assoc::HashIndex;
    use crate::layout::STORAGE_INCREMENT_DELTA;
    use std::net::Ipv4Addr;

    fn test_storage() -> (FlatStorage, HashIndex) {
        let storage = FlatStorage::builder()
            .maxbytes(4 * STORAGE_INCREMENT_DELTA)
            .build()
            .expect("failed to create storage");
        (storage, HashIndex::new(8))
    }

    fn set(
        storage: &mut FlatStorage,
        index: &mut HashIndex,
        key: &[u8],
        value: &[u8],
        exptime: u32,
    ) -> ItemHandle {
        let it = storage
            .alloc(index, key, 0, exptime, value.len(), Ipv4Addr::UNSPECIFIED)
            .expect("alloc should succeed");
        storage.memcpy_to(it, 0, value, false);
        storage.link(index, it, key);
        storage.deref(it);
        it
    }

    #[test]
    fn test_link_makes_item_resolvable() {
        let (mut storage, mut index) = test_storage();
        set(&mut storage, &mut index, b"a", b"1", 0);

        let it = storage.get(&mut index, b"a").expect("get should hit");
        assert!(storage.item_flags(it).contains(ItemFlags::LINKED));
        assert_eq!(storage.item_refcount(it), 1);
        storage.deref(it);

        assert!(storage.get(&mut index, b"missing").is_none());
        assert_eq!(storage.metrics().items_live.value(), 1);
    }

    #[test]
    fn test_lru_head_follows_recency() {
        let (mut storage, mut index) = test_storage();
        let a = set(&mut storage, &mut index, b"a", b"1", 0);
        let b = set(&mut storage, &mut index, b"b", b"1", 0);

        // Most recent link is at the head, oldest at the tail.
        assert_eq!(storage.lru_head, Some(b));
        assert_eq!(storage.lru_tail, Some(a));

        // A stale touch repositions the item at the head.
        storage.set_current_time(ITEM_UPDATE_INTERVAL + 10);
        let got = storage.get(&mut index, b"a").expect("hit");
        storage.update(got);
        storage.deref(got);
        assert_eq!(storage.lru_head, Some(a));
        assert_eq!(storage.lru_tail, Some(b));
        storage.check_consistency();
    }

    #[test]
    fn test_update_is_rate_limited() {
        let (mut storage, mut index) = test_storage();
        let a = set(&mut storage, &mut index, b"a", b"1", 0);
        let b = set(&mut storage, &mut index, b"b", b"1", 0);

        // Fresh items are not repositioned.
        storage.set_current_time(ITEM_UPDATE_INTERVAL / 2);
        storage.update(a);
        assert_eq!(storage.lru_head, Some(b));
        storage.check_consistency();
    }

    #[test]
    fn test_get_expired_item_unlinks_it() {
        let (mut storage, mut index) = test_storage();
        set(&mut storage, &mut index, b"a", b"1", 10);

        storage.set_current_time(5);
        let it = storage.get(&mut index, b"a").expect("not yet expired");
        storage.deref(it);

        storage.set_current_time(10);
        assert!(storage.get(&mut index, b"a").is_none());
        assert_eq!(storage.metrics().expirations.value(), 1);
        assert_eq!(storage.metrics().items_live.value(), 0);
        storage.check_consistency();
    }

    #[test]
    fn test_unlink_defers_free_while_referenced() {
        let (mut storage, mut index) = test_storage();
        set(&mut storage, &mut index, b"a", b"payload", 0);

        let it = storage.get(&mut index, b"a").expect("hit");
        storage.unlink(&mut index, it, UnlinkCause::Normal, Some(b"a"));

        // Unlinked but still readable through the held handle.
        assert!(storage.get(&mut index, b"a").is_none());
        let mut out = [0u8; 7];
        storage.memcpy_from(&mut out, it, 0, false);
        assert_eq!(&out, b"payload");

        // The final deref frees the chunks.
        let free_before = storage.small_free_chunks();
        storage.deref(it);
        assert!(storage.small_free_chunks() > free_before);
        storage.check_consistency();
    }

    #[test]
    fn test_unlink_twice_is_noop() {
        let (mut storage, mut index) = test_storage();
        let it = set(&mut storage, &mut index, b"a", b"1", 0);
        storage.unlink(&mut index, it, UnlinkCause::Normal, Some(b"a"));
        storage.check_consistency();
        assert_eq!(storage.metrics().items_live.value(), 0);
    }

    #[test]
    fn test_replace_swaps_binding() {
        let (mut storage, mut index) = test_storage();
        set(&mut storage, &mut index, b"a", b"old", 0);

        let old = storage.get(&mut index, b"a").expect("hit");
        let new = storage
            .alloc(&mut index, b"a", 0, 0, 3, Ipv4Addr::UNSPECIFIED)
            .expect("alloc");
        storage.memcpy_to(new, 0, b"new", false);
        storage.replace(&mut index, old, new, b"a");
        storage.deref(old);
        storage.deref(new);

        let got = storage.get(&mut index, b"a").expect("hit");
        let mut out = [0u8; 3];
        storage.memcpy_from(&mut out, got, 0, false);
        assert_eq!(&out, b"new");
        storage.deref(got);
        storage.check_consistency();
    }

    #[test]
    fn test_delete_lock() {
        let (mut storage, mut index) = test_storage();
        set(&mut storage, &mut index, b"a", b"1", 0);
        storage.set_current_time(100);

        let it = storage.get(&mut index, b"a").expect("hit");
        storage.mark_deleted(it, 105);

        // While locked: miss, with the lock reported.
        let (got, locked) = storage.get_notedeleted(&mut index, b"a");
        assert!(got.is_none());
        assert!(locked);

        // But a nocheck lookup still sees it.
        let raw = storage.get_nocheck(&index, b"a").expect("nocheck hit");
        storage.deref(raw);

        // Once the lock lapses the item is reaped through the expiry path;
        // the held reference defers the physical free to the final deref.
        storage.set_current_time(105);
        let (got, locked) = storage.get_notedeleted(&mut index, b"a");
        assert!(got.is_none());
        assert!(!locked);
        storage.deref(it);
        assert_eq!(storage.metrics().items_live.value(), 0);
        storage.check_consistency();
    }

    #[test]
    fn test_flush_expired() {
        let (mut storage, mut index) = test_storage();
        storage.set_current_time(10);
        set(&mut storage, &mut index, b"old1", b"1", 0);
        set(&mut storage, &mut index, b"old2", b"1", 0);
        storage.set_current_time(20);
        set(&mut storage, &mut index, b"new1", b"1", 0);
        set(&mut storage, &mut index, b"new2", b"1", 0);

        // Flush everything touched at or after t=20.
        storage.settings_mut().oldest_live = 20;
        storage.flush_expired(&mut index);

        assert!(storage.get_nocheck(&index, b"new1").is_none());
        assert!(storage.get_nocheck(&index, b"new2").is_none());
        let it = storage.get_nocheck(&index, b"old1").expect("older item survives");
        storage.deref(it);
        storage.check_consistency();
    }

    #[test]
    fn test_eviction_skips_referenced_items() {
        let (mut storage, mut index) = test_storage();
        set(&mut storage, &mut index, b"pinned", b"1", 0);
        let pinned = storage.get(&mut index, b"pinned").expect("hit");

        // Exhaust the region; the pinned item must survive every eviction.
        let mut i = 0usize;
        loop {
            let key = format!("f{i:05}");
            if storage
                .alloc(&mut index, key.as_bytes(), 0, 0, 400, Ipv4Addr::UNSPECIFIED)
                .map(|it| {
                    storage.link(&mut index, it, key.as_bytes());
                    storage.deref(it);
                })
                .is_none()
            {
                break;
            }
            i += 1;
            if i > 500 {
                break;
            }
        }

        let again = storage.get(&mut index, b"pinned").expect("pinned item survives");
        assert_eq!(again, pinned);
        storage.deref(again);
        storage.deref(pinned);
        storage.check_consistency();
    }
}
