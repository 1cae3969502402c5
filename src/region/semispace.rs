//! Semi-space code region with compacting eviction.
//!
//! Two equal halves; exactly one (`from`) is active at a time. Allocation
//! and lookup go to the active half. The evictor places survivors into the
//! inactive half (`to`) and then flips; the retired half is reset and
//! becomes the next eviction's destination.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::bundle::Bundle;
use crate::method::CompiledMethod;
use crate::region::{CodeRegion, RegionView};

/// Compacting region for short-lived baseline code.
#[derive(Debug)]
pub struct SemiSpaceCodeRegion {
    name: &'static str,
    /// The two halves; `active` indexes the current from-space.
    spaces: [CodeRegion; 2],
    /// Index of the active half. Written only inside the eviction
    /// safepoint; read lock-free everywhere.
    active: AtomicUsize,
    /// Size of each half in bytes.
    half_size: usize,
}

impl SemiSpaceCodeRegion {
    /// Create a semi-space region over `[start, start + total_size)`.
    ///
    /// # Panics
    /// Panics when `total_size` is odd.
    pub fn new(name: &'static str, start: usize, total_size: usize) -> Self {
        assert!(total_size % 2 == 0, "semi-space size must split evenly");
        let half_size = total_size / 2;
        Self {
            name,
            spaces: [
                CodeRegion::new(name, start, half_size),
                CodeRegion::new(name, start + half_size, half_size),
            ],
            active: AtomicUsize::new(0),
            half_size,
        }
    }

    /// The active (allocation) half.
    #[inline]
    pub fn from_space(&self) -> &CodeRegion {
        &self.spaces[self.active.load(Ordering::Acquire)]
    }

    /// The inactive (eviction destination) half.
    #[inline]
    pub fn to_space(&self) -> &CodeRegion {
        &self.spaces[1 - self.active.load(Ordering::Acquire)]
    }

    /// Size of each half in bytes.
    #[inline]
    pub fn half_size(&self) -> usize {
        self.half_size
    }

    /// Bump-allocate in the active half. Serialised by the caller.
    #[inline]
    pub fn allocate(&self, size: usize) -> Option<usize> {
        self.from_space().allocate(size)
    }

    /// Register an allocated bundle with the active half's index.
    #[inline]
    pub fn add(&self, bundle: Bundle) {
        self.from_space().add(bundle);
    }

    /// Check whether an address falls in the active half's interval.
    #[inline]
    pub fn in_from_space(&self, addr: usize) -> bool {
        self.from_space().contains(addr)
    }

    /// Swap the halves after the evictor has populated to-space.
    ///
    /// The retired half is reset; the new `from.mark` is wherever survivor
    /// placement left it (`start` when nothing survived). Only called
    /// inside the eviction safepoint.
    pub(crate) fn flip(&self) {
        let old = self.active.load(Ordering::Acquire);
        self.spaces[old].reset();
        self.active.store(1 - old, Ordering::Release);
    }

    /// Verify internal consistency of both halves.
    pub(crate) fn validate(&self) -> bool {
        // The inactive half must be empty between evictions.
        self.from_space().validate() && self.to_space().mark() == self.to_space().start()
    }
}

impl RegionView for SemiSpaceCodeRegion {
    #[inline]
    fn name(&self) -> &'static str {
        self.name
    }

    /// The owned interval spans both halves.
    #[inline]
    fn start(&self) -> usize {
        self.spaces[0].start()
    }

    #[inline]
    fn end(&self) -> usize {
        self.spaces[1].end()
    }

    #[inline]
    fn mark(&self) -> usize {
        self.from_space().mark()
    }

    fn find(&self, addr: usize) -> Option<Arc<CompiledMethod>> {
        self.from_space().find(addr)
    }

    fn visit(&self, visitor: &mut dyn FnMut(&Bundle) -> bool) {
        self.from_space().visit(visitor)
    }
}
