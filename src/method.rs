//! Compiled-method descriptor.
//!
//! The descriptor is what the reverse lookup returns and what the evictor
//! updates when it moves a bundle. Placement fields are atomics: readers
//! (stack walker, trampolines) load them lock-free, and the evictor stores
//! new values inside the safepoint where no reader can be mid-walk.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;

/// Descriptor for one compiled method and its cache placement.
#[derive(Debug)]
pub struct CompiledMethod {
    /// Unique identifier assigned by the compilation pipeline.
    id: u64,
    /// Human-readable method name, for traces and diagnostics.
    name: String,
    /// Bundle start address; 0 until the method has been placed.
    start: AtomicUsize,
    /// Total bundle size in bytes.
    size: AtomicUsize,
    /// First byte of the code array.
    code_start: AtomicUsize,
    /// Length of the code array in bytes.
    code_len: AtomicUsize,
    /// Set when the bundle's code is protected against patching.
    protected: AtomicBool,
    /// Offsets into the code stream of 32-bit PC-relative displacement
    /// fields of direct calls. The displacement is relative to the end of
    /// the field: `target = site + 4 + disp`.
    call_sites: Mutex<SmallVec<[u32; 4]>>,
    /// Backing storage for heap-diverted bundles (`in_heap` allocation).
    /// Code-region bundles leave this empty.
    heap_bundle: Mutex<Option<Box<[u8]>>>,
}

impl CompiledMethod {
    /// Create a descriptor that has not been placed yet.
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            start: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
            code_start: AtomicUsize::new(0),
            code_len: AtomicUsize::new(0),
            protected: AtomicBool::new(false),
            call_sites: Mutex::new(SmallVec::new()),
            heap_bundle: Mutex::new(None),
        }
    }

    /// Get the method identifier.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get the method name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current bundle start address (0 if unplaced).
    #[inline]
    pub fn start(&self) -> usize {
        self.start.load(Ordering::Acquire)
    }

    /// Get the bundle size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Get the current code array start address.
    #[inline]
    pub fn code_start(&self) -> usize {
        self.code_start.load(Ordering::Acquire)
    }

    /// Get the code array length in bytes.
    #[inline]
    pub fn code_len(&self) -> usize {
        self.code_len.load(Ordering::Acquire)
    }

    /// Check whether the method has been placed in a bundle.
    #[inline]
    pub fn is_placed(&self) -> bool {
        self.start() != 0
    }

    /// Check whether an address falls inside this method's bundle.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.start();
        start != 0 && addr >= start && addr < start + self.size()
    }

    /// Mark the method's code as protected against patching.
    #[inline]
    pub fn protect(&self) {
        self.protected.store(true, Ordering::Release);
    }

    /// Check the protection flag.
    #[inline]
    pub fn is_protected(&self) -> bool {
        self.protected.load(Ordering::Acquire)
    }

    /// Register the direct-call sites of this method's code stream.
    ///
    /// Each entry is the code-stream offset of a 32-bit displacement field.
    /// Called once by the compiler after the code bytes are emitted.
    pub fn set_call_sites(&self, sites: impl IntoIterator<Item = u32>) {
        let mut guard = self.call_sites.lock();
        guard.clear();
        guard.extend(sites);
        guard.sort_unstable();
    }

    /// Snapshot the registered direct-call sites.
    pub fn call_sites(&self) -> SmallVec<[u32; 4]> {
        self.call_sites.lock().clone()
    }

    /// Record the method's placement. Called under the cache mutex.
    pub(crate) fn set_placement(&self, start: usize, size: usize, code_start: usize, code_len: usize) {
        self.start.store(start, Ordering::Release);
        self.size.store(size, Ordering::Release);
        self.code_start.store(code_start, Ordering::Release);
        self.code_len.store(code_len, Ordering::Release);
    }

    /// Shift the placement by a relocation delta. Called by the evictor
    /// inside the safepoint.
    pub(crate) fn relocate(&self, delta: isize) {
        let start = self.start.load(Ordering::Acquire);
        let code_start = self.code_start.load(Ordering::Acquire);
        self.start
            .store((start as isize + delta) as usize, Ordering::Release);
        self.code_start
            .store((code_start as isize + delta) as usize, Ordering::Release);
    }

    /// Attach heap-side bundle storage. Called for `in_heap` allocations.
    pub(crate) fn set_heap_bundle(&self, storage: Box<[u8]>) {
        *self.heap_bundle.lock() = Some(storage);
    }

    /// Check whether this method's bundle lives on the process heap.
    pub fn is_heap_allocated(&self) -> bool {
        self.heap_bundle.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unplaced_method() {
        let method = CompiledMethod::new(7, "Widget.draw");
        assert_eq!(method.id(), 7);
        assert_eq!(method.name(), "Widget.draw");
        assert!(!method.is_placed());
        assert!(!method.contains(0x1000));
        assert!(!method.is_protected());
    }

    #[test]
    fn test_placement_and_containment() {
        let method = CompiledMethod::new(1, "m");
        method.set_placement(0x1000, 0x100, 0x1020, 0x80);
        assert!(method.is_placed());
        assert!(method.contains(0x1000));
        assert!(method.contains(0x10FF));
        assert!(!method.contains(0x1100));
        assert_eq!(method.code_start(), 0x1020);
    }

    #[test]
    fn test_relocate_shifts_start_and_code() {
        let method = CompiledMethod::new(1, "m");
        method.set_placement(0x1000, 0x100, 0x1020, 0x80);
        method.relocate(-0x200);
        assert_eq!(method.start(), 0xE00);
        assert_eq!(method.code_start(), 0xE20);
        assert_eq!(method.size(), 0x100);
    }

    #[test]
    fn test_call_sites_sorted() {
        let method = CompiledMethod::new(1, "m");
        method.set_call_sites([40, 16, 28]);
        let sites = method.call_sites();
        assert_eq!(sites.as_slice(), &[16, 28, 40]);
    }
}
