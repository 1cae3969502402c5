//! Bundle descriptors.
//!
//! A [`Bundle`] is the value the cache hands back from an allocation: the
//! placement of one method's header and inline arrays. It is a snapshot —
//! eviction moves baseline bundles, after which the owning
//! [`CompiledMethod`] is authoritative for the current placement and a
//! fresh lookup must be issued.

use std::sync::Arc;

use crate::layout::{BundleHeader, BundleLayout};
use crate::method::CompiledMethod;
use crate::Lifespan;

/// One method's contiguous allocation: header, code, scalar literals,
/// reference literals.
#[derive(Debug, Clone)]
pub struct Bundle {
    start: usize,
    layout: BundleLayout,
    lifespan: Lifespan,
    method: Arc<CompiledMethod>,
}

impl Bundle {
    /// Create a descriptor over memory at `start`. The caller (the cache)
    /// guarantees `start` points at `layout.bundle_size()` bytes that stay
    /// mapped for the life of the process.
    pub(crate) fn new(
        start: usize,
        layout: BundleLayout,
        lifespan: Lifespan,
        method: Arc<CompiledMethod>,
    ) -> Self {
        Self {
            start,
            layout,
            lifespan,
            method,
        }
    }

    /// Rebase the descriptor after relocation. The layout and method are
    /// unchanged; only the placement moves.
    pub(crate) fn rebased(&self, new_start: usize) -> Self {
        Self {
            start: new_start,
            layout: self.layout,
            lifespan: self.lifespan,
            method: Arc::clone(&self.method),
        }
    }

    /// Bundle start address.
    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    /// Total bundle size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.layout.bundle_size()
    }

    /// One past the last byte of the bundle.
    #[inline]
    pub fn end(&self) -> usize {
        self.start + self.size()
    }

    /// The layout this bundle was allocated with.
    #[inline]
    pub fn layout(&self) -> &BundleLayout {
        &self.layout
    }

    /// The lifespan the bundle was allocated with.
    #[inline]
    pub fn lifespan(&self) -> Lifespan {
        self.lifespan
    }

    /// The owning method descriptor.
    #[inline]
    pub fn method(&self) -> &Arc<CompiledMethod> {
        &self.method
    }

    /// First byte of the code array.
    #[inline]
    pub fn code_start(&self) -> usize {
        self.start + self.layout.code_offset()
    }

    /// First byte of the scalar-literal array.
    #[inline]
    pub fn scalar_start(&self) -> usize {
        self.start + self.layout.scalar_offset()
    }

    /// First byte of the reference-literal array.
    #[inline]
    pub fn ref_start(&self) -> usize {
        self.start + self.layout.ref_offset()
    }

    /// Check whether an address falls inside this bundle.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// View the code array.
    ///
    /// The backing memory stays mapped for the life of the cache; callers
    /// serialise writes against reads through the cache protocol (code is
    /// written before the method is published, patched only inside the
    /// eviction safepoint).
    #[inline]
    pub fn code(&self) -> &[u8] {
        // SAFETY: region/heap memory behind `start` is live and spans the
        // bundle; see constructor contract.
        unsafe { std::slice::from_raw_parts(self.code_start() as *const u8, self.layout.code_len()) }
    }

    /// Copy emitted machine code into the code array.
    ///
    /// # Panics
    /// Panics when `bytes` exceeds the allocated code length.
    pub fn write_code(&self, bytes: &[u8]) {
        assert!(
            bytes.len() <= self.layout.code_len(),
            "code overflows bundle: {} > {}",
            bytes.len(),
            self.layout.code_len()
        );
        // SAFETY: destination is in-bounds of the bundle's code array.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.code_start() as *mut u8, bytes.len());
        }
    }

    /// View the scalar-literal array.
    #[inline]
    pub fn scalar_literals(&self) -> &[u8] {
        // SAFETY: as for `code`.
        unsafe {
            std::slice::from_raw_parts(self.scalar_start() as *const u8, self.layout.scalar_len())
        }
    }

    /// Copy scalar literals into the bundle.
    ///
    /// # Panics
    /// Panics when `bytes` exceeds the allocated scalar length.
    pub fn write_scalar_literals(&self, bytes: &[u8]) {
        assert!(bytes.len() <= self.layout.scalar_len(), "scalar literals overflow bundle");
        // SAFETY: destination is in-bounds of the bundle's scalar array.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.scalar_start() as *mut u8, bytes.len());
        }
    }

    /// Read one reference-literal slot.
    ///
    /// # Panics
    /// Panics when `index` is out of bounds.
    pub fn ref_literal(&self, index: usize) -> usize {
        assert!(index < self.layout.ref_len());
        // SAFETY: slot is in-bounds and word-aligned by layout construction.
        unsafe { *((self.ref_start() + index * crate::layout::WORD_SIZE) as *const usize) }
    }

    /// Store one reference-literal slot.
    ///
    /// # Panics
    /// Panics when `index` is out of bounds.
    pub fn set_ref_literal(&self, index: usize, value: usize) {
        assert!(index < self.layout.ref_len());
        // SAFETY: slot is in-bounds and word-aligned by layout construction.
        unsafe {
            *((self.ref_start() + index * crate::layout::WORD_SIZE) as *mut usize) = value;
        }
    }

    /// Plant the bundle header at the start address.
    ///
    /// # Safety
    /// The bundle memory must be writable and not concurrently accessed;
    /// callers hold the cache mutex (allocation) or the eviction safepoint.
    pub(crate) unsafe fn plant_header(&self) {
        let header = BundleHeader {
            start: self.start,
            size: self.size(),
            method: Arc::as_ptr(&self.method),
            lifespan: self.lifespan,
            protected: false,
        };
        unsafe {
            std::ptr::write(self.start as *mut BundleHeader, header);
        }
    }

    /// Read back the planted header.
    pub(crate) fn header(&self) -> BundleHeader {
        // SAFETY: the header was planted before the bundle was published.
        unsafe { std::ptr::read(self.start as *const BundleHeader) }
    }

    /// Rewrite the self-referential start field after the bundle's bytes
    /// have been copied to this descriptor's placement.
    ///
    /// # Safety
    /// Must only be called inside the eviction safepoint, on a descriptor
    /// whose memory holds a copied header.
    pub(crate) unsafe fn refresh_header_start(&self) {
        let header = self.start as *mut BundleHeader;
        unsafe {
            std::ptr::addr_of_mut!((*header).start).write(self.start);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::HEADER_SIZE;

    // Back a bundle with plain boxed memory; the descriptor only does
    // address arithmetic over it.
    fn boxed_bundle(layout: BundleLayout) -> (Bundle, Box<[u8]>) {
        let storage = vec![0u8; layout.bundle_size()].into_boxed_slice();
        let start = storage.as_ptr() as usize;
        let method = Arc::new(CompiledMethod::new(1, "test"));
        (Bundle::new(start, layout, Lifespan::Short, method), storage)
    }

    #[test]
    fn test_bundle_geometry() {
        let layout = BundleLayout::new(64, 8, 2);
        let (bundle, _storage) = boxed_bundle(layout);
        assert_eq!(bundle.code_start(), bundle.start() + HEADER_SIZE);
        assert!(bundle.contains(bundle.start()));
        assert!(bundle.contains(bundle.end() - 1));
        assert!(!bundle.contains(bundle.end()));
        assert_eq!(bundle.size(), layout.bundle_size());
    }

    #[test]
    fn test_write_and_read_code() {
        let layout = BundleLayout::new(16, 0, 0);
        let (bundle, _storage) = boxed_bundle(layout);
        bundle.write_code(&[0x90, 0x90, 0xC3]);
        assert_eq!(&bundle.code()[..3], &[0x90, 0x90, 0xC3]);
    }

    #[test]
    fn test_ref_literal_slots() {
        let layout = BundleLayout::new(8, 0, 2);
        let (bundle, _storage) = boxed_bundle(layout);
        bundle.set_ref_literal(0, 0xDEAD);
        bundle.set_ref_literal(1, 0xBEEF);
        assert_eq!(bundle.ref_literal(0), 0xDEAD);
        assert_eq!(bundle.ref_literal(1), 0xBEEF);
    }

    #[test]
    fn test_header_roundtrip() {
        let layout = BundleLayout::new(32, 0, 1);
        let (bundle, _storage) = boxed_bundle(layout);
        unsafe { bundle.plant_header() };
        let header = bundle.header();
        assert_eq!(header.start, bundle.start());
        assert_eq!(header.size, bundle.size());
        assert_eq!(header.lifespan, Lifespan::Short);
        assert!(!header.protected);
    }

    #[test]
    #[should_panic(expected = "code overflows bundle")]
    fn test_code_overflow_panics() {
        let layout = BundleLayout::new(4, 0, 0);
        let (bundle, _storage) = boxed_bundle(layout);
        bundle.write_code(&[0; 8]);
    }
}
