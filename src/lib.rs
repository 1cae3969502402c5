//! Machine-code cache for a managed runtime.
//!
//! All generated code is position independent as a whole, but compiled
//! methods may contain direct call references between each other, and those
//! are encoded as 32-bit PC-relative displacements. Therefore every
//! code-bearing region must live inside one bounded virtual-address window;
//! [`AddressRange`] reserves that window once at startup and the regions are
//! carved out of it.
//!
//! # Architecture
//!
//! The cache is built from three regions plus the machinery to keep them
//! consistent while threads execute out of them:
//!
//! - **Boot region**: append-only, immortal. Populated during boot-image
//!   construction; never evicted.
//! - **Baseline region**: a semi-space pair. Short-lived code lands here and
//!   is compacted by the [`Evictor`] when the region fills.
//! - **Opt region**: append-only. Long-lived optimised code; expected never
//!   to fill in practice.
//!
//! Compaction moves executable bytes under the feet of running threads, so
//! it is serialised against mutators with a global safepoint
//! ([`SafepointSync`]) and rewrites every inbound direct-call site: calls
//! between surviving baseline bundles, and the boot-to-baseline calls
//! tracked by the [`RootTable`].
//!
//! # Usage
//!
//! ```ignore
//! use codecache::{BundleLayout, CacheConfig, CodeCache, CompiledMethod, Lifespan};
//! use std::sync::Arc;
//!
//! let cache = CodeCache::new(CacheConfig::default())?;
//! let method = Arc::new(CompiledMethod::new(1, "Widget.draw"));
//! let layout = BundleLayout::new(256, 0, 2);
//! let bundle = cache.allocate(&layout, &method, false, Lifespan::Short)?;
//! bundle.write_code(&machine_code);
//! assert!(cache.find_method(bundle.code_start()).is_some());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod cache;
pub mod config;
pub mod error;
pub mod evict;
pub mod inspect;
pub mod layout;
pub mod patch;
pub mod region;
pub mod roots;
pub mod safepoint;

mod bundle;
mod method;
mod os;
mod stats;

// Re-exports for convenient access
pub use bundle::Bundle;
pub use cache::{code_cache, install, CodeCache};
pub use config::CacheConfig;
pub use error::{CacheError, EXIT_CACHE_FULL};
pub use evict::{Evictor, Reachability, RetainAll};
pub use layout::BundleLayout;
pub use method::CompiledMethod;
pub use region::{AddressRange, CodeRegion, RegionView, SemiSpaceCodeRegion};
pub use roots::RootTable;
pub use safepoint::{SafepointGate, SafepointSync, SoloSafepoint};
pub use stats::CacheStats;

/// Categorization of how long a compiled method is destined to stay around.
///
/// The lifespan selects the region an allocation is routed to; it is also
/// stamped into the bundle header so the evictor can tell one-shot code
/// apart without consulting the method descriptor.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifespan {
    /// Class initializers and other run-once code. Allocated like `Short`,
    /// but reclaimed on its first eviction unless still executing.
    OneShot = 0,
    /// Methods that will likely be removed after some time (baseline
    /// compiler output). Routed to the semi-space baseline region.
    Short = 1,
    /// Methods that stay (optimising compiler output, adapters,
    /// trampolines). Routed to the append-only opt region.
    Long = 2,
}

impl Lifespan {
    /// Check whether this lifespan is served by the baseline region.
    #[inline]
    pub fn is_baseline(self) -> bool {
        matches!(self, Lifespan::OneShot | Lifespan::Short)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifespan_routing() {
        assert!(Lifespan::OneShot.is_baseline());
        assert!(Lifespan::Short.is_baseline());
        assert!(!Lifespan::Long.is_baseline());
    }
}
