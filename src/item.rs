//! Item payload access: the chunk walker and the operations built on it.
//!
//! An item's payload is the concatenation `key ‖ value ‖ stamp` laid out
//! across the data areas of its chunk chain: the title chunk holds the
//! first `title_data_sz` bytes and each body the next `body_data_sz`. The
//! walker turns an `(offset, length)` request into successive in-region
//! slices, which keeps every consumer (copy in, copy out, key compare, key
//! flattening, stamping) zero-copy.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::net::Ipv4Addr;

use crate::chunk::{self, ItemFlags};
use crate::layout::{
    self, body_data_sz, chunks_needed, is_large_chunk, title_data_sz, ChunkTier, ItemHandle,
    KEY_MAX_LENGTH, MAX_ITEM_SIZE, STAMP_IP_SZ, STAMP_TIMESTAMP_SZ,
};
use crate::storage::FlatStorage;

impl FlatStorage {
    /// Number of chunks backing the item.
    pub(crate) fn chunks_in_item(&self, it: ItemHandle) -> usize {
        let hdr = self.title(it);
        chunks_needed(hdr.nkey as usize, hdr.nbytes as usize, self.item_tier(it))
    }

    /// Total payload capacity of the item's chain.
    pub(crate) fn item_capacity(&self, it: ItemHandle) -> usize {
        let tier = self.item_tier(it);
        title_data_sz(tier) + (self.chunks_in_item(it) - 1) * body_data_sz(tier)
    }

    /// Unused bytes at the end of the chain, available for stamping.
    pub fn item_slackspace(&self, it: ItemHandle) -> usize {
        let hdr = self.title(it);
        self.item_capacity(it) - hdr.nkey as usize - hdr.nbytes as usize
    }

    /// Whether an item of this shape fits the cache at all.
    pub fn size_ok(&self, nkey: usize, _flags: u32, nbytes: usize) -> bool {
        nkey <= KEY_MAX_LENGTH && nbytes <= MAX_ITEM_SIZE
    }

    /// Whether replacing the item's key/value with the new shape requires a
    /// fresh allocation (tier change or different chunk count).
    pub fn need_realloc(
        &self,
        it: ItemHandle,
        new_nkey: usize,
        _new_flags: u32,
        new_nbytes: usize,
    ) -> bool {
        let new_large = is_large_chunk(new_nkey, new_nbytes);
        let new_tier = if new_large {
            ChunkTier::Large
        } else {
            ChunkTier::Small
        };
        self.is_item_large(it) != new_large
            || self.chunks_in_item(it) != chunks_needed(new_nkey, new_nbytes, new_tier)
    }

    /// Walk `len` payload bytes starting at `offset` (measured from the
    /// start of the data area, key included), applying `apply` to each
    /// in-chunk slice. With `beyond` the traversal may extend into the
    /// unused tail of the last chunk; without it, access is clipped to the
    /// item's `nkey + nbytes` extent.
    pub(crate) fn item_walk<F: FnMut(&[u8])>(
        &self,
        it: ItemHandle,
        mut offset: usize,
        mut len: usize,
        beyond: bool,
        mut apply: F,
    ) {
        let chunks = &self.chunks;
        let large = chunk::ptr_is_large(chunks, it.0);
        let tier = if large { ChunkTier::Large } else { ChunkTier::Small };
        let hdr = chunk::title_of(chunks, it.0);
        let extent = hdr.nkey as usize + hdr.nbytes as usize;

        let mut cap_before = 0usize;
        let mut cur = Some(it.0);
        let mut first = true;
        while len > 0 {
            let c = cur.expect("walk ran past the end of the item chain");
            let cap = if first {
                title_data_sz(tier)
            } else {
                body_data_sz(tier)
            };
            if offset >= cap {
                offset -= cap;
            } else {
                let accessible = if beyond {
                    cap
                } else {
                    cap.min(extent.saturating_sub(cap_before))
                };
                let take = len.min(accessible.saturating_sub(offset));
                assert!(take > 0, "walk beyond the item boundary");
                let (idx, range) = layout::data_range(c, large, first);
                let data = self.region.block(idx, range);
                apply(&data[offset..offset + take]);
                len -= take;
                offset = 0;
            }
            cap_before += cap;
            cur = chunk::next_chunk_of(chunks, c, first);
            first = false;
        }
    }

    /// Mutable twin of [`FlatStorage::item_walk`].
    pub(crate) fn item_walk_mut<F: FnMut(&mut [u8])>(
        &mut self,
        it: ItemHandle,
        mut offset: usize,
        mut len: usize,
        beyond: bool,
        mut apply: F,
    ) {
        let FlatStorage { chunks, region, .. } = self;
        let large = chunk::ptr_is_large(chunks, it.0);
        let tier = if large { ChunkTier::Large } else { ChunkTier::Small };
        let hdr = chunk::title_of(chunks, it.0);
        let extent = hdr.nkey as usize + hdr.nbytes as usize;

        let mut cap_before = 0usize;
        let mut cur = Some(it.0);
        let mut first = true;
        while len > 0 {
            let c = cur.expect("walk ran past the end of the item chain");
            let cap = if first {
                title_data_sz(tier)
            } else {
                body_data_sz(tier)
            };
            if offset >= cap {
                offset -= cap;
            } else {
                let accessible = if beyond {
                    cap
                } else {
                    cap.min(extent.saturating_sub(cap_before))
                };
                let take = len.min(accessible.saturating_sub(offset));
                assert!(take > 0, "walk beyond the item boundary");
                let (idx, range) = layout::data_range(c, large, first);
                let data = region.block_mut(idx, range);
                apply(&mut data[offset..offset + take]);
                len -= take;
                offset = 0;
            }
            cap_before += cap;
            cur = chunk::next_chunk_of(chunks, c, first);
            first = false;
        }
    }

    /// Copy `src` into the item's value area at `offset` (relative to the
    /// value, i.e. past the key).
    pub fn memcpy_to(&mut self, it: ItemHandle, offset: usize, src: &[u8], beyond: bool) {
        let nkey = self.title(it).nkey as usize;
        let mut rest = src;
        self.item_walk_mut(it, nkey + offset, src.len(), beyond, |seg| {
            let n = seg.len();
            seg.copy_from_slice(&rest[..n]);
            rest = &rest[n..];
        });
    }

    /// Copy `dst.len()` bytes of the item's value area at `offset` into
    /// `dst`.
    pub fn memcpy_from(&self, dst: &mut [u8], it: ItemHandle, offset: usize, beyond: bool) {
        let nkey = self.title(it).nkey as usize;
        let mut written = 0usize;
        self.item_walk(it, nkey + offset, dst.len(), beyond, |seg| {
            dst[written..written + seg.len()].copy_from_slice(seg);
            written += seg.len();
        });
    }

    /// Lexicographic comparison of the item's key against `key`, length
    /// first (matching the index's lookup semantics).
    pub fn key_compare(&self, it: ItemHandle, key: &[u8]) -> Ordering {
        let nkey = self.title(it).nkey as usize;
        if nkey != key.len() {
            return nkey.cmp(&key.len());
        }
        let mut rest = key;
        let mut ord = Ordering::Equal;
        self.item_walk(it, 0, nkey, false, |seg| {
            if ord == Ordering::Equal {
                ord = seg.cmp(&rest[..seg.len()]);
                rest = &rest[seg.len()..];
            }
        });
        ord
    }

    /// The item's key. Borrows in place when the key is contained in the
    /// title chunk, otherwise flattens the spilled key into an owned
    /// buffer.
    pub fn item_key(&self, it: ItemHandle) -> Cow<'_, [u8]> {
        let hdr = self.title(it);
        let nkey = hdr.nkey as usize;
        let tier = self.item_tier(it);
        if nkey <= title_data_sz(tier) {
            let (idx, range) = layout::data_range(it.0, tier == ChunkTier::Large, true);
            let data = self.region.block(idx, range);
            return Cow::Borrowed(&data[..nkey]);
        }
        let mut buf = Vec::with_capacity(nkey);
        self.item_walk(it, 0, nkey, false, |seg| buf.extend_from_slice(seg));
        Cow::Owned(buf)
    }

    /// Stamp the item's tail slack with the current time and, if room
    /// remains, the client address. The timestamp has priority; both are
    /// optional and flagged in the header.
    pub(crate) fn try_item_stamp(&mut self, it: ItemHandle, addr: Ipv4Addr) {
        let now = self.current_time;
        self.title_mut(it)
            .it_flags
            .remove(ItemFlags::HAS_TIMESTAMP | ItemFlags::HAS_IP_ADDRESS);

        let mut slack = self.item_slackspace(it);
        let mut offset = self.title(it).nbytes as usize;

        if slack >= STAMP_TIMESTAMP_SZ {
            self.memcpy_to(it, offset, &now.to_ne_bytes(), true);
            self.title_mut(it).it_flags.insert(ItemFlags::HAS_TIMESTAMP);
            slack -= STAMP_TIMESTAMP_SZ;
            offset += STAMP_TIMESTAMP_SZ;
        }
        if slack >= STAMP_IP_SZ {
            self.memcpy_to(it, offset, &addr.octets(), true);
            self.title_mut(it).it_flags.insert(ItemFlags::HAS_IP_ADDRESS);
        }
    }

    /// Read back the stamp, if any.
    pub fn item_stamp(&self, it: ItemHandle) -> (Option<u32>, Option<Ipv4Addr>) {
        let flags = self.title(it).it_flags;
        let nbytes = self.title(it).nbytes as usize;
        let mut timestamp = None;
        let mut ip = None;
        let mut offset = nbytes;
        if flags.contains(ItemFlags::HAS_TIMESTAMP) {
            let mut buf = [0u8; STAMP_TIMESTAMP_SZ];
            self.memcpy_from(&mut buf, it, offset, true);
            timestamp = Some(u32::from_ne_bytes(buf));
            offset += STAMP_TIMESTAMP_SZ;
        }
        if flags.contains(ItemFlags::HAS_IP_ADDRESS) {
            let mut buf = [0u8; STAMP_IP_SZ];
            self.memcpy_from(&mut buf, it, offset, true);
            ip = Some(Ipv4Addr::from(buf));
        }
        (timestamp, ip)
    }

    /// Write the key into the front of the data area, spilling across
    /// bodies as needed. Called once at allocation.
    pub(crate) fn write_key(&mut self, it: ItemHandle, key: &[u8]) {
        let mut rest = key;
        self.item_walk_mut(it, 0, key.len(), false, |seg| {
            let n = seg.len();
            seg.copy_from_slice(&rest[..n]);
            rest = &rest[n..];
        });
    }

    // header getters

    pub fn item_nkey(&self, it: ItemHandle) -> usize {
        self.title(it).nkey as usize
    }

    pub fn item_nbytes(&self, it: ItemHandle) -> usize {
        self.title(it).nbytes as usize
    }

    pub fn item_user_flags(&self, it: ItemHandle) -> u32 {
        self.title(it).flags
    }

    pub fn item_exptime(&self, it: ItemHandle) -> u32 {
        self.title(it).exptime
    }

    pub fn item_time(&self, it: ItemHandle) -> u32 {
        self.title(it).time
    }

    pub fn item_refcount(&self, it: ItemHandle) -> u16 {
        self.title(it).refcount
    }

    pub fn item_flags(&self, it: ItemHandle) -> ItemFlags {
        self.title(it).it_flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assoc::HashIndex;
    use crate::layout::{
        small_tier_max, SMALL_BODY_DATA_SZ, SMALL_CHUNKS_PER_LARGE_CHUNK, SMALL_TITLE_DATA_SZ,
        STORAGE_INCREMENT_DELTA,
    };

    fn test_storage() -> (FlatStorage, HashIndex) {
        let storage = FlatStorage::builder()
            .maxbytes(4 * STORAGE_INCREMENT_DELTA)
            .build()
            .expect("failed to create storage");
        (storage, HashIndex::new(8))
    }

    fn alloc(
        storage: &mut FlatStorage,
        index: &mut HashIndex,
        key: &[u8],
        nbytes: usize,
    ) -> ItemHandle {
        storage
            .alloc(index, key, 0, 0, nbytes, Ipv4Addr::UNSPECIFIED)
            .expect("alloc should succeed")
    }

    #[test]
    fn test_value_round_trip_single_chunk() {
        let (mut storage, mut index) = test_storage();
        let it = alloc(&mut storage, &mut index, b"k", 10);

        storage.memcpy_to(it, 0, b"0123456789", false);
        let mut out = [0u8; 10];
        storage.memcpy_from(&mut out, it, 0, false);
        assert_eq!(&out, b"0123456789");
        storage.deref(it);
    }

    #[test]
    fn test_value_round_trip_multi_chunk() {
        let (mut storage, mut index) = test_storage();
        // Spans the full small chain.
        let nbytes = small_tier_max() - 4;
        let value: Vec<u8> = (0..nbytes).map(|i| (i % 251) as u8).collect();
        let it = alloc(&mut storage, &mut index, b"kkkk", nbytes);
        assert_eq!(storage.chunks_in_item(it), SMALL_CHUNKS_PER_LARGE_CHUNK);

        storage.memcpy_to(it, 0, &value, false);
        let mut out = vec![0u8; nbytes];
        storage.memcpy_from(&mut out, it, 0, false);
        assert_eq!(out, value);

        // Partial reads at chunk-straddling offsets.
        let mut mid = vec![0u8; 200];
        storage.memcpy_from(&mut mid, it, SMALL_TITLE_DATA_SZ - 10, false);
        assert_eq!(mid[..], value[SMALL_TITLE_DATA_SZ - 10..SMALL_TITLE_DATA_SZ + 190]);
        storage.deref(it);
    }

    #[test]
    fn test_key_spills_across_chunks() {
        let (mut storage, mut index) = test_storage();
        let key: Vec<u8> = (0..KEY_MAX_LENGTH).map(|i| b'a' + (i % 26) as u8).collect();
        let it = alloc(&mut storage, &mut index, &key, 4);
        assert!(!storage.is_item_large(it));
        assert!(key.len() > SMALL_TITLE_DATA_SZ + SMALL_BODY_DATA_SZ);

        assert_eq!(storage.key_compare(it, &key), Ordering::Equal);
        assert_eq!(storage.item_key(it).as_ref(), &key[..]);
        assert!(matches!(storage.item_key(it), Cow::Owned(_)));

        // Value still lands after the spilled key.
        storage.memcpy_to(it, 0, b"tail", false);
        let mut out = [0u8; 4];
        storage.memcpy_from(&mut out, it, 0, false);
        assert_eq!(&out, b"tail");
        storage.deref(it);
    }

    #[test]
    fn test_key_compare_orders() {
        let (mut storage, mut index) = test_storage();
        let it = alloc(&mut storage, &mut index, b"middle", 1);

        assert_eq!(storage.key_compare(it, b"middle"), Ordering::Equal);
        assert_eq!(storage.key_compare(it, b"middlf"), Ordering::Less);
        assert_eq!(storage.key_compare(it, b"middld"), Ordering::Greater);
        // Length differences dominate.
        assert_eq!(storage.key_compare(it, b"mid"), Ordering::Greater);
        assert_eq!(storage.key_compare(it, b"middle!"), Ordering::Less);
        storage.deref(it);
    }

    #[test]
    fn test_item_key_borrows_when_title_contained() {
        let (mut storage, mut index) = test_storage();
        let it = alloc(&mut storage, &mut index, b"short", 4);
        assert!(matches!(storage.item_key(it), Cow::Borrowed(_)));
        assert_eq!(storage.item_key(it).as_ref(), b"short");
        storage.deref(it);
    }

    #[test]
    fn test_stamp_slack_tiers() {
        let (mut storage, mut index) = test_storage();
        storage.set_current_time(1234);
        let addr = Ipv4Addr::new(10, 1, 2, 3);

        // Slack of exactly 8: timestamp and address both fit.
        let it = storage
            .alloc(&mut index, b"kkkk", 0, 0, SMALL_TITLE_DATA_SZ - 4 - 8, addr)
            .expect("alloc");
        assert!(storage.item_flags(it).contains(ItemFlags::HAS_TIMESTAMP));
        assert!(storage.item_flags(it).contains(ItemFlags::HAS_IP_ADDRESS));
        assert_eq!(storage.item_stamp(it), (Some(1234), Some(addr)));
        storage.deref(it);

        // Slack of exactly 4: timestamp only.
        let it = storage
            .alloc(&mut index, b"kkkk", 0, 0, SMALL_TITLE_DATA_SZ - 4 - 4, addr)
            .expect("alloc");
        assert!(storage.item_flags(it).contains(ItemFlags::HAS_TIMESTAMP));
        assert!(!storage.item_flags(it).contains(ItemFlags::HAS_IP_ADDRESS));
        assert_eq!(storage.item_stamp(it), (Some(1234), None));
        storage.deref(it);

        // No slack: neither.
        let it = storage
            .alloc(&mut index, b"kkkk", 0, 0, SMALL_TITLE_DATA_SZ - 4, addr)
            .expect("alloc");
        assert!(!storage.item_flags(it).contains(ItemFlags::HAS_TIMESTAMP));
        assert!(!storage.item_flags(it).contains(ItemFlags::HAS_IP_ADDRESS));
        assert_eq!(storage.item_stamp(it), (None, None));
        storage.deref(it);
    }

    #[test]
    fn test_stamp_does_not_clobber_value() {
        let (mut storage, mut index) = test_storage();
        storage.set_current_time(77);
        let nbytes = SMALL_TITLE_DATA_SZ - 4 - 8;
        let it = storage
            .alloc(&mut index, b"kkkk", 0, 0, nbytes, Ipv4Addr::new(1, 2, 3, 4))
            .expect("alloc");

        let value = vec![0xEE_u8; nbytes];
        storage.memcpy_to(it, 0, &value, false);
        let mut out = vec![0u8; nbytes];
        storage.memcpy_from(&mut out, it, 0, false);
        assert_eq!(out, value);
        assert_eq!(storage.item_stamp(it).0, Some(77));
        storage.deref(it);
    }

    #[test]
    fn test_need_realloc() {
        let (mut storage, mut index) = test_storage();
        let it = alloc(&mut storage, &mut index, b"key", 10);

        // Same shape: no realloc.
        assert!(!storage.need_realloc(it, 3, 0, 12));
        // More chunks: realloc.
        assert!(storage.need_realloc(it, 3, 0, SMALL_TITLE_DATA_SZ * 2));
        // Tier change: realloc.
        assert!(storage.need_realloc(it, 3, 0, small_tier_max() + 1));
        storage.deref(it);
    }

    #[test]
    fn test_slackspace() {
        let (mut storage, mut index) = test_storage();
        let it = alloc(&mut storage, &mut index, b"kkkk", 10);
        assert_eq!(storage.item_slackspace(it), SMALL_TITLE_DATA_SZ - 14);
        storage.deref(it);
    }
}
