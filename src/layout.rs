//! Deterministic bundle layout.
//!
//! A bundle is one method's contiguous allocation: a fixed header followed
//! by up to three inline arrays (`code`, `scalar_literals`,
//! `reference_literals`). The layout is a pure function of the triple
//! `(code_len, scalar_len, ref_len)` so that relocation can compute new
//! literal addresses without consulting per-bundle metadata.

use crate::method::CompiledMethod;
use crate::Lifespan;

/// Machine word size. All bundle offsets and sizes are word-aligned.
pub const WORD_SIZE: usize = 8;

/// Round a byte count up to the next word boundary.
#[inline]
pub const fn round_up_word(size: usize) -> usize {
    (size + WORD_SIZE - 1) & !(WORD_SIZE - 1)
}

/// Fixed header planted at the start of every bundle.
///
/// The header makes a region walkable without an external index: given a
/// bundle start, `size` yields the next bundle. The method back-pointer is
/// a debugging aid only; the region's index owns the authoritative
/// reference.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BundleHeader {
    /// Bundle start address (self-referential; fixed up on relocation).
    pub start: usize,
    /// Total bundle size in bytes, word-aligned.
    pub size: usize,
    /// Raw back-pointer to the owning method descriptor.
    pub method: *const CompiledMethod,
    /// Lifespan the bundle was allocated with.
    pub lifespan: Lifespan,
    /// Whether the bundle's code has been protected against patching.
    pub protected: bool,
}

/// Size of the planted header, word-aligned.
pub const HEADER_SIZE: usize = round_up_word(std::mem::size_of::<BundleHeader>());

/// Describes the layout of one bundle from its array lengths.
///
/// `code_len` and `scalar_len` are byte counts; `ref_len` counts word-sized
/// reference slots visible to the garbage collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleLayout {
    code_len: u32,
    scalar_len: u32,
    ref_len: u32,
}

impl BundleLayout {
    /// Create a layout for the given array lengths.
    #[inline]
    pub fn new(code_len: u32, scalar_len: u32, ref_len: u32) -> Self {
        Self {
            code_len,
            scalar_len,
            ref_len,
        }
    }

    /// Length of the code array in bytes.
    #[inline]
    pub fn code_len(&self) -> usize {
        self.code_len as usize
    }

    /// Length of the scalar-literal array in bytes.
    #[inline]
    pub fn scalar_len(&self) -> usize {
        self.scalar_len as usize
    }

    /// Number of word-sized reference-literal slots.
    #[inline]
    pub fn ref_len(&self) -> usize {
        self.ref_len as usize
    }

    /// Offset of the code array from the bundle start.
    #[inline]
    pub fn code_offset(&self) -> usize {
        HEADER_SIZE
    }

    /// Offset of the scalar-literal array from the bundle start.
    #[inline]
    pub fn scalar_offset(&self) -> usize {
        self.code_offset() + round_up_word(self.code_len as usize)
    }

    /// Offset of the reference-literal array from the bundle start.
    #[inline]
    pub fn ref_offset(&self) -> usize {
        self.scalar_offset() + round_up_word(self.scalar_len as usize)
    }

    /// Total bundle size in bytes, word-aligned.
    #[inline]
    pub fn bundle_size(&self) -> usize {
        self.ref_offset() + self.ref_len as usize * WORD_SIZE
    }
}
