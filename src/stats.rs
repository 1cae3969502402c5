//! Code cache statistics.
//!
//! All counters are relaxed atomics updated on the allocation and eviction
//! paths. Survivor sizes mirror what the eviction log reports: the bytes
//! that survived the most recent compaction and the largest amount ever
//! observed.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Statistics for the code cache.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Bundles allocated in the baseline region.
    baseline_allocations: AtomicU64,
    /// Bundles allocated in the opt region.
    opt_allocations: AtomicU64,
    /// Bundles allocated in the boot region.
    boot_allocations: AtomicU64,
    /// Bundles diverted to the object heap.
    heap_allocations: AtomicU64,
    /// Completed evictions.
    evictions: AtomicU64,
    /// Survivors of the most recent eviction.
    last_survivor_count: AtomicUsize,
    /// Survivor bytes of the most recent eviction.
    last_survivor_bytes: AtomicUsize,
    /// Largest survivor bytes observed over all evictions.
    largest_survivor_bytes: AtomicUsize,
}

impl CacheStats {
    /// Create zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a baseline-region allocation.
    pub(crate) fn record_baseline_allocation(&self) {
        self.baseline_allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an opt-region allocation.
    pub(crate) fn record_opt_allocation(&self) {
        self.opt_allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a boot-region allocation.
    pub(crate) fn record_boot_allocation(&self) {
        self.boot_allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a heap-diverted allocation.
    pub(crate) fn record_heap_allocation(&self) {
        self.heap_allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of one eviction.
    pub(crate) fn record_survivors(&self, count: usize, bytes: usize) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.last_survivor_count.store(count, Ordering::Relaxed);
        self.last_survivor_bytes.store(bytes, Ordering::Relaxed);
        self.largest_survivor_bytes
            .fetch_max(bytes, Ordering::Relaxed);
    }

    /// Bundles allocated in the baseline region.
    pub fn baseline_allocations(&self) -> u64 {
        self.baseline_allocations.load(Ordering::Relaxed)
    }

    /// Bundles allocated in the opt region.
    pub fn opt_allocations(&self) -> u64 {
        self.opt_allocations.load(Ordering::Relaxed)
    }

    /// Bundles allocated in the boot region.
    pub fn boot_allocations(&self) -> u64 {
        self.boot_allocations.load(Ordering::Relaxed)
    }

    /// Bundles diverted to the object heap.
    pub fn heap_allocations(&self) -> u64 {
        self.heap_allocations.load(Ordering::Relaxed)
    }

    /// Completed evictions.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Survivors of the most recent eviction.
    pub fn last_survivor_count(&self) -> usize {
        self.last_survivor_count.load(Ordering::Relaxed)
    }

    /// Survivor bytes of the most recent eviction.
    pub fn last_survivor_bytes(&self) -> usize {
        self.last_survivor_bytes.load(Ordering::Relaxed)
    }

    /// Largest survivor bytes observed over all evictions.
    pub fn largest_survivor_bytes(&self) -> usize {
        self.largest_survivor_bytes.load(Ordering::Relaxed)
    }

    /// Print a statistics block to stderr.
    pub fn dump(&self) {
        eprintln!("=== Code Cache Statistics ===");
        eprintln!(
            "Allocations: baseline={} opt={} boot={} heap={}",
            self.baseline_allocations(),
            self.opt_allocations(),
            self.boot_allocations(),
            self.heap_allocations(),
        );
        eprintln!(
            "Evictions: {} (last survivors: {} bundles, {} bytes; largest: {} bytes)",
            self.evictions(),
            self.last_survivor_count(),
            self.last_survivor_bytes(),
            self.largest_survivor_bytes(),
        );
    }
}
