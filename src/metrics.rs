use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Monotonically increasing counter
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Gauge that can increase or decrease
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: i64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn sub(&self, value: i64) {
        self.0.fetch_sub(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

/// Item-population metrics for the storage engine.
///
/// This is the one piece of engine state readable without holding the
/// caller's cache lock: every field is an atomic counter or gauge, so stats
/// threads can sample it while the writer mutates storage. Each engine
/// instance owns its own set, which keeps tests isolated.
pub struct StorageMetrics {
    /// Bytes of the region initialized so far.
    pub storage_allocated: Counter,

    /// Currently linked items.
    pub items_live: Gauge,
    /// Items ever linked.
    pub items_total: Counter,
    /// Key + value bytes of currently linked items.
    pub bytes_live: Gauge,

    /// Items unlinked to reclaim space before their expiry.
    pub evictions: Counter,
    /// Items unlinked because they expired.
    pub expirations: Counter,

    /// Allocations that failed after every replenishment strategy.
    pub allocation_failures: Counter,
}

impl StorageMetrics {
    pub fn new() -> Self {
        Self {
            storage_allocated: Counter::new(),
            items_live: Gauge::new(),
            items_total: Counter::new(),
            bytes_live: Gauge::new(),
            evictions: Counter::new(),
            expirations: Counter::new(),
            allocation_failures: Counter::new(),
        }
    }
}

impl Default for StorageMetrics {
    fn default() -> Self {
        Self::new()
    }
}
