//! Append-only code region with bump-pointer allocation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::bundle::Bundle;
use crate::layout::round_up_word;
use crate::method::CompiledMethod;
use crate::region::RegionView;

/// A contiguous sub-window holding bundles of one lifespan class.
///
/// Allocation is a bump of `mark`; the mark moves monotonically between
/// evictions and every live bundle is contained in `[start, mark)`.
/// Allocation and index mutation are serialised by the caller (the cache
/// holds its mutex around every allocation); lookups take only the index
/// read lock.
#[derive(Debug)]
pub struct CodeRegion {
    /// Diagnostic name.
    name: &'static str,
    /// First owned address.
    start: usize,
    /// One past the last owned address.
    end: usize,
    /// Bump pointer, `start <= mark <= end`.
    mark: AtomicUsize,
    /// Bundles in allocation order. Bump allocation keeps starts sorted,
    /// so address lookup is a binary search.
    bundles: RwLock<Vec<Bundle>>,
}

impl CodeRegion {
    /// Create a region over `[start, start + size)`.
    pub fn new(name: &'static str, start: usize, size: usize) -> Self {
        Self {
            name,
            start,
            end: start + size,
            mark: AtomicUsize::new(start),
            bundles: RwLock::new(Vec::new()),
        }
    }

    /// Bump-allocate `size` bytes, rounded up to a word.
    ///
    /// Returns the old mark, or `None` when the remaining space is
    /// insufficient. Serialised by the caller.
    pub fn allocate(&self, size: usize) -> Option<usize> {
        let aligned = round_up_word(size);
        let old = self.mark.load(Ordering::Acquire);
        if aligned > self.end - old {
            return None;
        }
        self.mark.store(old + aligned, Ordering::Release);
        Some(old)
    }

    /// Register an allocated bundle with the lookup index.
    ///
    /// Called under the cache mutex, after the bundle header is planted.
    pub fn add(&self, bundle: Bundle) {
        let mut bundles = self.bundles.write();
        debug_assert!(
            bundles.last().map_or(true, |prev| prev.start() < bundle.start()),
            "bundle index out of allocation order"
        );
        bundles.push(bundle);
    }

    /// Total capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.end - self.start
    }

    /// Bytes allocated so far.
    #[inline]
    pub fn used(&self) -> usize {
        self.mark() - self.start
    }

    /// Bytes remaining.
    #[inline]
    pub fn available(&self) -> usize {
        self.end - self.mark()
    }

    /// Number of bundles in the index.
    pub fn bundle_count(&self) -> usize {
        self.bundles.read().len()
    }

    /// Reset the region to empty. Only meaningful for semi-space halves,
    /// inside the eviction safepoint.
    pub(crate) fn reset(&self) {
        self.mark.store(self.start, Ordering::Release);
        self.bundles.write().clear();
    }

    /// Verify internal consistency; usable as an assertion condition.
    pub(crate) fn validate(&self) -> bool {
        let mark = self.mark();
        if mark < self.start || mark > self.end {
            return false;
        }
        let bundles = self.bundles.read();
        let mut prev_end = self.start;
        for bundle in bundles.iter() {
            if bundle.start() < prev_end || bundle.end() > mark {
                return false;
            }
            let header = bundle.header();
            if header.start != bundle.start() || header.size != bundle.size() {
                return false;
            }
            prev_end = bundle.end();
        }
        true
    }
}

impl RegionView for CodeRegion {
    #[inline]
    fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    fn start(&self) -> usize {
        self.start
    }

    #[inline]
    fn end(&self) -> usize {
        self.end
    }

    #[inline]
    fn mark(&self) -> usize {
        self.mark.load(Ordering::Acquire)
    }

    fn find(&self, addr: usize) -> Option<Arc<CompiledMethod>> {
        if !self.contains(addr) {
            return None;
        }
        let bundles = self.bundles.read();
        // First bundle starting after addr; the candidate precedes it.
        let idx = bundles.partition_point(|b| b.start() <= addr);
        let candidate = bundles.get(idx.checked_sub(1)?)?;
        if candidate.contains(addr) {
            Some(Arc::clone(candidate.method()))
        } else {
            None
        }
    }

    fn visit(&self, visitor: &mut dyn FnMut(&Bundle) -> bool) {
        let bundles = self.bundles.read();
        for bundle in bundles.iter() {
            if !visitor(bundle) {
                return;
            }
        }
    }
}
