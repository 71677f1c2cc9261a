//! The external key→item index contract, plus a bundled implementation.
//!
//! The engine itself is index-free: it only requires a mapping from keys to
//! item handles with an atomic rebind operation for the coalescer. The
//! index is passed into every operation that consults or repairs it, under
//! the caller's cache lock.

use ahash::RandomState;

use crate::layout::ItemHandle;
use crate::storage::FlatStorage;

/// Contract between the storage engine and the key→item index.
///
/// `storage` is passed back into every method so implementations can read
/// keys in place and chain through the items' `h_next` field.
pub trait AssocIndex {
    /// Resolve a key to its item handle.
    fn find(&self, storage: &FlatStorage, key: &[u8]) -> Option<ItemHandle>;

    /// Bind `key` to `it`. The key must not already be bound.
    fn insert(&mut self, storage: &mut FlatStorage, it: ItemHandle, key: &[u8]);

    /// Drop the binding for `key`.
    fn delete(&mut self, storage: &mut FlatStorage, key: &[u8]);

    /// Atomically rebind the entry resolving to `old` so it resolves to
    /// `new`. Used only by the coalescer while migrating a title chunk;
    /// after return the old handle is invalid.
    fn update(&mut self, storage: &mut FlatStorage, old: ItemHandle, new: ItemHandle);
}

/// Bundled index: a power-of-two bucket array with separate chaining
/// through the items' `h_next` link, so no key bytes are duplicated
/// outside the region.
pub struct HashIndex {
    hash_builder: RandomState,
    buckets: Box<[Option<ItemHandle>]>,
    mask: u64,
}

impl HashIndex {
    /// Create an index with `2^power` buckets.
    pub fn new(power: u8) -> Self {
        if power < 4 {
            panic!("power too low");
        }

        // Fixed seeds in tests for deterministic behavior, random seeds in
        // production.
        #[cfg(test)]
        let hash_builder = RandomState::with_seeds(
            0xbb8c484891ec6c86,
            0x0522a25ae9c769f9,
            0xeed2797b9571bc75,
            0x4feb29c1fbbd59d0,
        );
        #[cfg(not(test))]
        let hash_builder = RandomState::new();

        let num_buckets = 1_usize << power;
        Self {
            hash_builder,
            buckets: vec![None; num_buckets].into_boxed_slice(),
            mask: (num_buckets as u64) - 1,
        }
    }

    #[inline]
    fn bucket_of(&self, key: &[u8]) -> usize {
        (self.hash_builder.hash_one(key) & self.mask) as usize
    }

    /// Number of bound keys; a full scan, for tests and diagnostics.
    pub fn len(&self, storage: &FlatStorage) -> usize {
        let mut count = 0;
        for head in self.buckets.iter() {
            let mut cur = *head;
            while let Some(it) = cur {
                count += 1;
                cur = storage.index_link(it);
            }
        }
        count
    }

    pub fn is_empty(&self, storage: &FlatStorage) -> bool {
        self.len(storage) == 0
    }
}

impl AssocIndex for HashIndex {
    fn find(&self, storage: &FlatStorage, key: &[u8]) -> Option<ItemHandle> {
        let mut cur = self.buckets[self.bucket_of(key)];
        while let Some(it) = cur {
            if storage.key_compare(it, key) == std::cmp::Ordering::Equal {
                return Some(it);
            }
            cur = storage.index_link(it);
        }
        None
    }

    fn insert(&mut self, storage: &mut FlatStorage, it: ItemHandle, key: &[u8]) {
        debug_assert!(self.find(storage, key).is_none(), "key already bound");
        let bucket = self.bucket_of(key);
        storage.set_index_link(it, self.buckets[bucket]);
        self.buckets[bucket] = Some(it);
    }

    fn delete(&mut self, storage: &mut FlatStorage, key: &[u8]) {
        let bucket = self.bucket_of(key);
        let mut prev: Option<ItemHandle> = None;
        let mut cur = self.buckets[bucket];
        while let Some(it) = cur {
            if storage.key_compare(it, key) == std::cmp::Ordering::Equal {
                let next = storage.index_link(it);
                match prev {
                    None => self.buckets[bucket] = next,
                    Some(p) => storage.set_index_link(p, next),
                }
                return;
            }
            prev = Some(it);
            cur = storage.index_link(it);
        }
        debug_assert!(false, "delete of an unbound key");
    }

    fn update(&mut self, storage: &mut FlatStorage, old: ItemHandle, new: ItemHandle) {
        // The replacement already carries the chain link copied from the
        // old title; only the pointer *to* the old entry needs to move.
        let key = storage.item_key(new).into_owned();
        let bucket = self.bucket_of(&key);

        if self.buckets[bucket] == Some(old) {
            self.buckets[bucket] = Some(new);
            return;
        }
        let mut cur = self.buckets[bucket];
        while let Some(it) = cur {
            let next = storage.index_link(it);
            if next == Some(old) {
                storage.set_index_link(it, Some(new));
                return;
            }
            cur = next;
        }
        panic!("update target is not bound");
    }
}
