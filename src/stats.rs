//! Text reports over the allocator state, and the optional per-prefix
//! removal accounting.

use std::collections::HashMap;
use std::fmt::Write;

use ahash::RandomState;

use crate::layout::{
    chunks_needed, ChunkTier, ItemHandle, CACHEDUMP_LIMIT, KEY_MAX_LENGTH, LARGE_CHUNK_SZ,
    MAX_ITEM_SIZE, SMALL_CHUNK_SZ,
};
use crate::lifecycle::UnlinkCause;
use crate::storage::FlatStorage;

const TERMINATOR: &str = "END\r\n";

impl FlatStorage {
    /// Physical footprint of an item: chunk count times chunk size.
    fn item_footprint(&self, it: ItemHandle) -> usize {
        let sz = match self.item_tier(it) {
            ChunkTier::Large => LARGE_CHUNK_SZ,
            ChunkTier::Small => SMALL_CHUNK_SZ,
        };
        self.chunks_in_item(it) * sz
    }

    /// One `STAT` line per allocator statistic, terminated by `END\r\n`.
    pub fn allocator_stats(&self) -> String {
        let oldest_item_lifetime = match self.get_lru_item() {
            Some(it) => self.current_time.saturating_sub(self.title(it).time),
            None => 0,
        };

        let mut out = String::with_capacity(1024);
        let _ = writeln!(out, "STAT large_chunk_sz {LARGE_CHUNK_SZ}");
        let _ = writeln!(out, "STAT small_chunk_sz {SMALL_CHUNK_SZ}");
        let _ = writeln!(out, "STAT large_title_chunks {}", self.stats.large_title_chunks);
        let _ = writeln!(out, "STAT large_body_chunks {}", self.stats.large_body_chunks);
        let _ = writeln!(out, "STAT large_broken_chunks {}", self.stats.large_broken_chunks);
        let _ = writeln!(out, "STAT small_title_chunks {}", self.stats.small_title_chunks);
        let _ = writeln!(out, "STAT small_body_chunks {}", self.stats.small_body_chunks);
        for (occupancy, count) in self.stats.broken_chunk_histogram.iter().enumerate() {
            let _ = writeln!(out, "STAT broken_chunk_histogram {occupancy} {count}");
        }
        let _ = writeln!(out, "STAT break_events {}", self.stats.break_events);
        let _ = writeln!(out, "STAT unbreak_events {}", self.stats.unbreak_events);
        let _ = writeln!(out, "STAT migrates {}", self.stats.migrates);
        let _ = writeln!(out, "STAT unused_memory {}", self.region.unused_memory());
        let _ = writeln!(out, "STAT large_free_list_sz {}", self.large_free_list_sz);
        let _ = writeln!(out, "STAT small_free_list_sz {}", self.small_free_list_sz);
        let _ = writeln!(out, "STAT oldest_item_lifetime {oldest_item_lifetime}s");
        out.push_str(TERMINATOR);
        out
    }

    /// Dump the items of one tier in LRU order, newest first. `limit == 0`
    /// means no item cap; the response is always capped at 2 MiB.
    pub fn cachedump(&self, tier: ChunkTier, limit: usize) -> String {
        let mut out = String::new();
        let mut shown = 0usize;
        let mut cur = self.lru_head;
        while let Some(it) = cur {
            if limit != 0 && shown >= limit {
                break;
            }
            cur = self.title(it).next.map(ItemHandle);
            if self.item_tier(it) != tier {
                continue;
            }
            let key = self.item_key(it);
            let line = format!(
                "ITEM {} [{} b; {} s]\r\n",
                String::from_utf8_lossy(&key),
                self.title(it).nbytes,
                self.title(it).time as u64 + self.started as u64,
            );
            if out.len() + line.len() + TERMINATOR.len() > CACHEDUMP_LIMIT {
                break;
            }
            out.push_str(&line);
            shown += 1;
        }
        out.push_str(TERMINATOR);
        out
    }

    /// Histogram of live item footprints in 32-byte buckets, one line per
    /// occupied bucket. Each item is counted once.
    pub fn stats_sizes(&self) -> String {
        let max_footprint =
            chunks_needed(KEY_MAX_LENGTH, MAX_ITEM_SIZE, ChunkTier::Large) * LARGE_CHUNK_SZ;
        let num_buckets = max_footprint / 32 + 2;
        let mut histogram = vec![0u64; num_buckets];

        let mut cur = self.lru_head;
        while let Some(it) = cur {
            let footprint = self.item_footprint(it);
            let mut bucket = footprint / 32;
            if footprint % 32 != 0 {
                bucket += 1;
            }
            if bucket < num_buckets {
                histogram[bucket] += 1;
            }
            cur = self.title(it).next.map(ItemHandle);
        }

        let mut out = String::new();
        for (bucket, count) in histogram.iter().enumerate() {
            if *count != 0 {
                let _ = write!(out, "{} {}\r\n", bucket * 32, count);
            }
        }
        out.push_str(TERMINATOR);
        out
    }
}

/// Per-removal counters for one key prefix.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PrefixCounters {
    pub removals: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub bytes: u64,
}

/// Removal accounting grouped by key prefix (the bytes before the first
/// `:`, or the whole key). Populated on unlink while
/// `settings.detail_enabled` is set.
pub struct DetailStats {
    prefixes: HashMap<Box<[u8]>, PrefixCounters, RandomState>,
}

impl DetailStats {
    pub fn new() -> Self {
        Self {
            prefixes: HashMap::with_hasher(RandomState::new()),
        }
    }

    fn prefix_of(key: &[u8]) -> &[u8] {
        match key.iter().position(|b| *b == b':') {
            Some(pos) => &key[..pos],
            None => key,
        }
    }

    pub(crate) fn record_removal(&mut self, key: &[u8], bytes: u64, cause: UnlinkCause) {
        let entry = self
            .prefixes
            .entry(Self::prefix_of(key).into())
            .or_default();
        entry.removals += 1;
        entry.bytes += bytes;
        match cause {
            UnlinkCause::Evict => entry.evictions += 1,
            UnlinkCause::Expired => entry.expirations += 1,
            _ => {}
        }
    }

    /// Counters for one prefix, if any removal was recorded for it.
    pub fn prefix(&self, prefix: &[u8]) -> Option<&PrefixCounters> {
        self.prefixes.get(prefix)
    }

    /// One line per prefix in byte order, terminated by `END\r\n`.
    pub fn dump(&self) -> String {
        let mut entries: Vec<_> = self.prefixes.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let mut out = String::new();
        for (prefix, counters) in entries {
            let _ = write!(
                out,
                "PREFIX {} removals {} evictions {} expirations {} bytes {}\r\n",
                String::from_utf8_lossy(prefix),
                counters.removals,
                counters.evictions,
                counters.expirations,
                counters.bytes,
            );
        }
        out.push_str(TERMINATOR);
        out
    }
}

impl Default for DetailStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assoc::HashIndex;
    use crate::layout::{SMALL_CHUNKS_PER_LARGE_CHUNK, STORAGE_INCREMENT_DELTA};
    use std::net::Ipv4Addr;

    fn test_storage() -> (FlatStorage, HashIndex) {
        let storage = FlatStorage::builder()
            .maxbytes(4 * STORAGE_INCREMENT_DELTA)
            .build()
            .expect("failed to create storage");
        (storage, HashIndex::new(8))
    }

    fn set(storage: &mut FlatStorage, index: &mut HashIndex, key: &[u8], nbytes: usize) {
        let it = storage
            .alloc(index, key, 0, 0, nbytes, Ipv4Addr::UNSPECIFIED)
            .expect("alloc should succeed");
        storage.memcpy_to(it, 0, &vec![b'v'; nbytes], false);
        storage.link(index, it, key);
        storage.deref(it);
    }

    #[test]
    fn test_allocator_stats_format() {
        let (mut storage, mut index) = test_storage();
        set(&mut storage, &mut index, b"one", 10);

        let text = storage.allocator_stats();
        assert!(text.ends_with("END\r\n"));
        assert!(text.contains(&format!("STAT large_chunk_sz {LARGE_CHUNK_SZ}\n")));
        assert!(text.contains(&format!("STAT small_chunk_sz {SMALL_CHUNK_SZ}\n")));
        assert!(text.contains("STAT small_title_chunks 1\n"));
        assert!(text.contains("STAT break_events 1\n"));
        assert!(text.contains(&format!(
            "STAT unused_memory {}\n",
            storage.unused_memory()
        )));

        // One histogram line per occupancy level, 0..=children.
        let histogram_lines = text
            .lines()
            .filter(|l| l.starts_with("STAT broken_chunk_histogram "))
            .count();
        assert_eq!(histogram_lines, SMALL_CHUNKS_PER_LARGE_CHUNK + 1);
    }

    #[test]
    fn test_oldest_item_lifetime() {
        let (mut storage, mut index) = test_storage();
        storage.set_current_time(5);
        set(&mut storage, &mut index, b"old", 4);
        storage.set_current_time(42);

        let text = storage.allocator_stats();
        assert!(text.contains("STAT oldest_item_lifetime 37s\n"));
    }

    #[test]
    fn test_cachedump_order_and_filter() {
        let (mut storage, mut index) = test_storage();
        storage.set_current_time(9);
        set(&mut storage, &mut index, b"small_a", 10);
        set(&mut storage, &mut index, b"small_b", 10);
        set(&mut storage, &mut index, b"large_a", 1200);

        let small = storage.cachedump(ChunkTier::Small, 0);
        assert!(small.ends_with("END\r\n"));
        // Newest first, and only the small tier.
        let lines: Vec<&str> = small.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ITEM small_b [10 b; "));
        assert!(lines[1].starts_with("ITEM small_a [10 b; "));
        assert_eq!(lines[2], "END");

        let large = storage.cachedump(ChunkTier::Large, 0);
        assert!(large.starts_with("ITEM large_a [1200 b; "));

        // The item cap applies after tier filtering.
        let one = storage.cachedump(ChunkTier::Small, 1);
        assert_eq!(one.lines().count(), 2);
    }

    #[test]
    fn test_stats_sizes_counts_each_item_once() {
        let (mut storage, mut index) = test_storage();
        set(&mut storage, &mut index, b"a", 10); // one small chunk: 128 b
        set(&mut storage, &mut index, b"b", 10); // one small chunk: 128 b
        set(&mut storage, &mut index, b"c", 1200); // two large chunks: 2048 b

        let text = storage.stats_sizes();
        assert!(text.ends_with("END\r\n"));
        assert!(text.contains("128 2\r\n"));
        assert!(text.contains("2048 1\r\n"));
    }

    #[test]
    fn test_detail_stats_prefixes() {
        let (mut storage, mut index) = test_storage();
        storage.settings_mut().detail_enabled = true;

        set(&mut storage, &mut index, b"user:1", 8);
        set(&mut storage, &mut index, b"user:2", 8);
        set(&mut storage, &mut index, b"session:9", 8);

        for key in [b"user:1".as_slice(), b"user:2".as_slice()] {
            let it = storage.get(&mut index, key).expect("hit");
            storage.unlink(&mut index, it, UnlinkCause::Normal, Some(key));
            storage.deref(it);
        }

        let user = storage.detail_stats().prefix(b"user").expect("recorded");
        assert_eq!(user.removals, 2);
        assert_eq!(user.bytes, 2 * (6 + 8));
        assert!(storage.detail_stats().prefix(b"session").is_none());

        let dump = storage.detail_stats().dump();
        assert!(dump.starts_with("PREFIX user removals 2 "));
        assert!(dump.ends_with("END\r\n"));
    }
}
