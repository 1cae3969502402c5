//! The process-wide code cache façade.
//!
//! Routes allocations by lifespan, drives eviction under contention, and
//! answers the reverse lookup from an arbitrary instruction address to the
//! owning method. One instance exists per process, created during startup
//! and installed into a process-wide location that is never reassigned.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::bundle::Bundle;
use crate::config::{
    CacheConfig, BOOT_CODE_REGION_SIZE, RESERVED_BASELINE_CODE_CACHE_SIZE,
    RESERVED_OPT_CODE_CACHE_SIZE,
};
use crate::error::CacheError;
use crate::evict::{Evictor, Reachability, RetainAll};
use crate::layout::BundleLayout;
use crate::method::CompiledMethod;
use crate::region::{AddressRange, CodeRegion, RegionView, SemiSpaceCodeRegion};
use crate::roots::RootTable;
use crate::safepoint::{SafepointGate, SafepointSync, SoloSafepoint};
use crate::stats::CacheStats;
use crate::Lifespan;

/// Name of the immortal boot code region.
const BOOT_REGION_NAME: &str = "Code-Boot";

/// Name of the semi-space baseline code region.
const BASELINE_REGION_NAME: &str = "Code-Runtime-Baseline";

/// Name of the append-only opt code region.
const OPT_REGION_NAME: &str = "Code-Runtime-Opt";

/// Mutable state behind the cache-wide mutex.
#[derive(Debug, Default)]
struct AllocState {
    /// Baseline allocations performed, for the contention-test knob.
    n_allocations: u64,
}

/// Target machine-code cache management.
///
/// The cache exclusively owns its regions; a bundle is owned by its
/// containing region, and the region is authoritative for bundle lifetime.
pub struct CodeCache {
    config: CacheConfig,
    /// The reserved window. Held for ownership; regions carve it up.
    range: AddressRange,
    boot: CodeRegion,
    baseline: SemiSpaceCodeRegion,
    opt: CodeRegion,
    roots: RootTable,
    stats: CacheStats,
    reachability: Arc<dyn Reachability>,
    safepoint: Arc<dyn SafepointSync>,
    /// Cache-wide mutex serialising allocation, root recording, and
    /// eviction.
    alloc_state: Mutex<AllocState>,
}

impl CodeCache {
    /// Create a cache from a validated configuration.
    ///
    /// Collaborators default to [`RetainAll`] and [`SoloSafepoint`]; the
    /// runtime swaps in its stack walker and thread coordinator with
    /// [`with_reachability`](Self::with_reachability) and
    /// [`with_safepoint_sync`](Self::with_safepoint_sync) before the first
    /// mutator thread starts.
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;

        let range = AddressRange::reserve(config.window_size())?;
        let boot_start = range.slice(0, config.boot_size);
        let baseline_start = range.slice(config.boot_size, config.baseline_size);
        let opt_start = range.slice(config.boot_size + config.baseline_size, config.opt_size);

        Ok(Self {
            boot: CodeRegion::new(BOOT_REGION_NAME, boot_start, config.boot_size),
            baseline: SemiSpaceCodeRegion::new(
                BASELINE_REGION_NAME,
                baseline_start,
                config.baseline_size,
            ),
            opt: CodeRegion::new(OPT_REGION_NAME, opt_start, config.opt_size),
            roots: RootTable::new(),
            stats: CacheStats::new(),
            reachability: Arc::new(RetainAll),
            safepoint: Arc::new(SoloSafepoint),
            alloc_state: Mutex::new(AllocState::default()),
            range,
            config,
        })
    }

    /// Replace the reachability oracle. Only sensible before mutators run.
    pub fn with_reachability(mut self, oracle: Arc<dyn Reachability>) -> Self {
        self.reachability = oracle;
        self
    }

    /// Replace the stop-the-world provider. Only sensible before mutators
    /// run.
    pub fn with_safepoint_sync(mut self, sync: Arc<dyn SafepointSync>) -> Self {
        self.safepoint = sync;
        self
    }

    /// Allocate storage for the code-related arrays of a method.
    ///
    /// `in_heap` diverts the bundle to heap-owned storage without touching
    /// the code regions. Otherwise the lifespan selects the region; a full
    /// baseline region is recovered once by eviction, and a second failure
    /// surfaces as [`CacheError::OutOfCodeMemory`].
    pub fn allocate(
        &self,
        layout: &BundleLayout,
        method: &Arc<CompiledMethod>,
        in_heap: bool,
        lifespan: Lifespan,
    ) -> Result<Bundle, CacheError> {
        if in_heap {
            return Ok(self.allocate_in_heap(layout, method, lifespan));
        }

        // The allocation and initialisation of headers in a code region
        // must be atomic with respect to garbage collection.
        let _gate = SafepointGate::enter();
        let mut state = self.alloc_state.lock();
        let size = layout.bundle_size();

        let start = if lifespan.is_baseline() {
            self.allocate_baseline(&mut state, size)?
        } else {
            self.opt
                .allocate(size)
                .ok_or(CacheError::OutOfCodeMemory {
                    region: OPT_REGION_NAME,
                    option: RESERVED_OPT_CODE_CACHE_SIZE,
                })?
        };

        let bundle = self.plant(start, layout, method, lifespan);
        if lifespan.is_baseline() {
            self.baseline.add(bundle.clone());
            self.stats.record_baseline_allocation();
            // Baseline code is patched only by the evictor from here on.
            method.protect();
        } else {
            self.opt.add(bundle.clone());
            self.stats.record_opt_allocation();
        }

        self.trace_chunk_allocation(&bundle, false);
        Ok(bundle)
    }

    /// Plant a bundle in the immortal boot region.
    ///
    /// Boot-image construction path; bundles planted here are never
    /// evicted and may be recorded as [`RootTable`] callers.
    pub fn allocate_boot(
        &self,
        layout: &BundleLayout,
        method: &Arc<CompiledMethod>,
    ) -> Result<Bundle, CacheError> {
        let _gate = SafepointGate::enter();
        let _state = self.alloc_state.lock();

        let start = self
            .boot
            .allocate(layout.bundle_size())
            .ok_or(CacheError::OutOfCodeMemory {
                region: BOOT_REGION_NAME,
                option: BOOT_CODE_REGION_SIZE,
            })?;

        let bundle = self.plant(start, layout, method, Lifespan::Long);
        self.boot.add(bundle.clone());
        self.stats.record_boot_allocation();
        self.trace_chunk_allocation(&bundle, false);
        Ok(bundle)
    }

    /// Baseline allocation with the contention knob and the single
    /// eviction retry. Called with the cache mutex held.
    fn allocate_baseline(&self, state: &mut AllocState, size: usize) -> Result<usize, CacheError> {
        state.n_allocations += 1;
        let forced = self.config.contention_frequency > 0
            && state.n_allocations % self.config.contention_frequency as u64 == 0;

        let mut start = if forced {
            None
        } else {
            self.baseline.allocate(size)
        };

        if start.is_none() {
            // Allocation in the baseline region takes another attempt upon
            // contention, after compaction.
            Evictor::new(
                &self.baseline,
                &self.roots,
                &self.stats,
                &*self.safepoint,
                self.config.trace_eviction,
            )
            .run(&*self.reachability);
            debug_assert!(self.validate());

            start = self.baseline.allocate(size);
            if forced && self.config.trace_eviction {
                eprintln!(
                    "[codecache] forced contention: surviving {} bytes, largest {} bytes",
                    self.stats.last_survivor_bytes(),
                    self.stats.largest_survivor_bytes(),
                );
            }
        }

        start.ok_or(CacheError::OutOfCodeMemory {
            region: BASELINE_REGION_NAME,
            option: RESERVED_BASELINE_CODE_CACHE_SIZE,
        })
    }

    /// Heap-diverted allocation: the bundle lives in storage owned by the
    /// method and the code regions are untouched.
    fn allocate_in_heap(
        &self,
        layout: &BundleLayout,
        method: &Arc<CompiledMethod>,
        lifespan: Lifespan,
    ) -> Bundle {
        let storage = vec![0u8; layout.bundle_size()].into_boxed_slice();
        let start = storage.as_ptr() as usize;
        method.set_heap_bundle(storage);

        // The storage must not move or be scanned until the header is
        // well-formed.
        let _gate = SafepointGate::enter();
        let bundle = self.plant(start, layout, method, lifespan);
        self.stats.record_heap_allocation();
        self.trace_chunk_allocation(&bundle, true);
        bundle
    }

    /// Initialise the bundle at `start` and record the method placement.
    fn plant(
        &self,
        start: usize,
        layout: &BundleLayout,
        method: &Arc<CompiledMethod>,
        lifespan: Lifespan,
    ) -> Bundle {
        let bundle = Bundle::new(start, *layout, lifespan, Arc::clone(method));
        // SAFETY: the allocation claimed `bundle_size()` bytes at `start`
        // and the cache mutex (or heap-storage ownership) excludes
        // concurrent access.
        unsafe { bundle.plant_header() };
        method.set_placement(start, bundle.size(), bundle.code_start(), layout.code_len());
        bundle
    }

    /// Look up the code region in which a code pointer lies.
    ///
    /// Tests boot, then baseline, then opt; lock-free interval tests.
    pub fn find_region(&self, addr: usize) -> Option<&dyn RegionView> {
        if self.boot.contains(addr) {
            return Some(&self.boot);
        }
        if self.baseline.contains(addr) {
            return Some(&self.baseline);
        }
        if self.opt.contains(addr) {
            return Some(&self.opt);
        }
        None
    }

    /// Look up the method whose bundle contains a code pointer.
    ///
    /// A miss is a normal outcome, not an error.
    pub fn find_method(&self, addr: usize) -> Option<Arc<CompiledMethod>> {
        self.find_region(addr)?.find(addr)
    }

    /// Record a boot-region caller with a direct call into the baseline
    /// region, for call-site rewriting on every eviction.
    pub fn record_boot_to_baseline(&self, caller: Arc<CompiledMethod>) {
        let _state = self.alloc_state.lock();
        if self.config.trace_eviction {
            eprintln!(
                "[codecache] boot-to-baseline caller recorded: {}",
                caller.name()
            );
        }
        self.roots.append(caller);
    }

    /// Walk bundles across regions in the fixed order boot → baseline →
    /// opt. The visitor returns `false` to halt the walk.
    pub fn visit_cells(&self, visitor: &mut dyn FnMut(&Bundle) -> bool, include_boot: bool) {
        let halted = std::cell::Cell::new(false);
        let mut wrap = |bundle: &Bundle| {
            let proceed = visitor(bundle);
            halted.set(!proceed);
            proceed
        };
        if include_boot {
            self.boot.visit(&mut wrap);
            if halted.get() {
                return;
            }
        }
        self.baseline.visit(&mut wrap);
        if halted.get() {
            return;
        }
        self.opt.visit(&mut wrap);
    }

    /// By definition, short-lived methods live in the baseline region.
    pub fn is_short_lived(&self, method: &CompiledMethod) -> bool {
        self.baseline.contains(method.start())
    }

    /// The immortal boot region.
    #[inline]
    pub fn boot_region(&self) -> &CodeRegion {
        &self.boot
    }

    /// The semi-space baseline region.
    #[inline]
    pub fn baseline_region(&self) -> &SemiSpaceCodeRegion {
        &self.baseline
    }

    /// The append-only opt region.
    #[inline]
    pub fn opt_region(&self) -> &CodeRegion {
        &self.opt
    }

    /// The boot-to-baseline root table.
    #[inline]
    pub fn roots(&self) -> &RootTable {
        &self.roots
    }

    /// Cache statistics.
    #[inline]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// The active configuration.
    #[inline]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The reserved address window.
    #[inline]
    pub fn address_range(&self) -> &AddressRange {
        &self.range
    }

    /// Code cache validation, usable as an assertion condition so that it
    /// only runs when assertions are enabled.
    pub fn validate(&self) -> bool {
        self.boot.validate() && self.baseline.validate() && self.opt.validate()
    }

    fn trace_chunk_allocation(&self, bundle: &Bundle, in_heap: bool) {
        if !self.config.trace_allocation {
            return;
        }
        let where_ = if in_heap { "heap" } else { "code cache" };
        eprintln!(
            "[codecache] allocated chunk in {} for {} at {:#x} [size {}, end {:#x}] code=[{:#x} - {:#x}], scalars={}, refs={}",
            where_,
            bundle.method().name(),
            bundle.start(),
            bundle.size(),
            bundle.end(),
            bundle.code_start(),
            bundle.code_start() + bundle.layout().code_len(),
            bundle.layout().scalar_len(),
            bundle.layout().ref_len(),
        );
    }
}

impl std::fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeCache")
            .field("window", &(self.range.base()..self.range.end()))
            .field("boot_used", &self.boot.used())
            .field("baseline_used", &self.baseline.from_space().used())
            .field("opt_used", &self.opt.used())
            .field("roots", &self.roots.len())
            .finish()
    }
}

/// The process-wide cache instance. Written once during startup.
static CODE_CACHE: OnceLock<CodeCache> = OnceLock::new();

/// Install the process-wide cache. Called once during the startup phase,
/// before any compilation happens.
///
/// # Panics
/// Panics when a cache has already been installed.
pub fn install(cache: CodeCache) -> &'static CodeCache {
    if CODE_CACHE.set(cache).is_err() {
        panic!("code cache already installed");
    }
    CODE_CACHE.get().expect("just installed")
}

/// Get the process-wide cache.
///
/// # Panics
/// Panics when called before [`install`].
pub fn code_cache() -> &'static CodeCache {
    CODE_CACHE
        .get()
        .expect("code cache queried before installation")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache() -> CodeCache {
        CodeCache::new(CacheConfig::minimal()).expect("cache creation failed")
    }

    fn method(id: u64) -> Arc<CompiledMethod> {
        Arc::new(CompiledMethod::new(id, format!("m{}", id)))
    }

    #[test]
    fn test_regions_partition_the_window() {
        let cache = small_cache();
        let range = cache.address_range();
        assert_eq!(cache.boot_region().start(), range.base());
        assert_eq!(cache.baseline_region().start(), cache.boot_region().end());
        assert_eq!(cache.opt_region().start(), cache.baseline_region().end());
        assert!(cache.opt_region().end() <= range.end());
    }

    #[test]
    fn test_lifespan_routing() {
        let cache = small_cache();
        let layout = BundleLayout::new(64, 0, 0);

        let short = cache
            .allocate(&layout, &method(1), false, Lifespan::Short)
            .unwrap();
        assert!(cache.baseline_region().contains(short.start()));

        let long = cache
            .allocate(&layout, &method(2), false, Lifespan::Long)
            .unwrap();
        assert!(cache.opt_region().contains(long.start()));

        let one_shot = cache
            .allocate(&layout, &method(3), false, Lifespan::OneShot)
            .unwrap();
        assert!(cache.baseline_region().contains(one_shot.start()));
    }

    #[test]
    fn test_find_method_after_allocate() {
        let cache = small_cache();
        let layout = BundleLayout::new(128, 0, 2);
        let m = method(1);
        let bundle = cache.allocate(&layout, &m, false, Lifespan::Short).unwrap();

        let found = cache.find_method(bundle.code_start()).expect("lookup hit");
        assert_eq!(found.id(), 1);
        // Idempotent between evictions.
        assert_eq!(cache.find_method(bundle.code_start()).unwrap().id(), 1);
    }

    #[test]
    fn test_find_region_order_and_miss() {
        let cache = small_cache();
        let boot_addr = cache.boot_region().start();
        assert_eq!(cache.find_region(boot_addr).unwrap().name(), BOOT_REGION_NAME);

        let baseline_addr = cache.baseline_region().start();
        assert_eq!(
            cache.find_region(baseline_addr).unwrap().name(),
            BASELINE_REGION_NAME
        );

        // Just past the opt region: not in any region.
        assert!(cache.find_region(cache.opt_region().end()).is_none());
        assert!(cache.find_method(cache.opt_region().end()).is_none());
    }

    #[test]
    fn test_in_heap_allocation_bypasses_regions() {
        let cache = small_cache();
        let layout = BundleLayout::new(64, 0, 1);
        let m = method(1);
        let bundle = cache.allocate(&layout, &m, true, Lifespan::Short).unwrap();

        assert!(m.is_heap_allocated());
        assert!(cache.find_region(bundle.start()).is_none());
        assert_eq!(cache.baseline_region().from_space().bundle_count(), 0);
        assert_eq!(cache.stats().heap_allocations(), 1);

        // The heap bundle is writable through the descriptor.
        bundle.write_code(&[0xC3]);
        assert_eq!(bundle.code()[0], 0xC3);
    }

    #[test]
    fn test_opt_exhaustion_has_no_recovery() {
        let cache = small_cache();
        let opt_capacity = cache.opt_region().capacity();
        let layout = BundleLayout::new(opt_capacity as u32, 0, 0);

        let err = cache
            .allocate(&layout, &method(1), false, Lifespan::Long)
            .unwrap_err();
        assert!(matches!(err, CacheError::OutOfCodeMemory { .. }));
        assert!(err.to_string().contains(RESERVED_OPT_CODE_CACHE_SIZE));
        // No eviction ran.
        assert_eq!(cache.stats().evictions(), 0);
    }

    #[test]
    fn test_baseline_exhaustion_after_eviction_exits_11() {
        let cache = small_cache();
        let half = cache.baseline_region().half_size();
        let layout = BundleLayout::new(half as u32, 0, 0);

        // Bigger than a half-space: fails, evicts (a no-op), fails again.
        let err = cache
            .allocate(&layout, &method(1), false, Lifespan::Short)
            .unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_CACHE_FULL);
        assert!(err.to_string().contains(RESERVED_BASELINE_CODE_CACHE_SIZE));
        assert_eq!(cache.stats().evictions(), 1);
    }

    #[test]
    fn test_visit_cells_order() {
        let cache = small_cache();
        let layout = BundleLayout::new(16, 0, 0);
        cache.allocate_boot(&layout, &method(1)).unwrap();
        cache
            .allocate(&layout, &method(2), false, Lifespan::Short)
            .unwrap();
        cache
            .allocate(&layout, &method(3), false, Lifespan::Long)
            .unwrap();

        let mut ids = Vec::new();
        cache.visit_cells(
            &mut |bundle| {
                ids.push(bundle.method().id());
                true
            },
            true,
        );
        assert_eq!(ids, vec![1, 2, 3]);

        let mut ids = Vec::new();
        cache.visit_cells(
            &mut |bundle| {
                ids.push(bundle.method().id());
                true
            },
            false,
        );
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_visit_cells_early_halt_spans_regions() {
        let cache = small_cache();
        let layout = BundleLayout::new(16, 0, 0);
        cache.allocate_boot(&layout, &method(1)).unwrap();
        cache
            .allocate(&layout, &method(2), false, Lifespan::Short)
            .unwrap();

        let mut count = 0;
        cache.visit_cells(
            &mut |_| {
                count += 1;
                false
            },
            true,
        );
        assert_eq!(count, 1);
    }

    #[test]
    fn test_is_short_lived() {
        let cache = small_cache();
        let layout = BundleLayout::new(16, 0, 0);
        let short = method(1);
        let long = method(2);
        cache.allocate(&layout, &short, false, Lifespan::Short).unwrap();
        cache.allocate(&layout, &long, false, Lifespan::Long).unwrap();
        assert!(cache.is_short_lived(&short));
        assert!(!cache.is_short_lived(&long));
    }

    #[test]
    fn test_exactly_one_region_contains_each_bundle() {
        let cache = small_cache();
        let layout = BundleLayout::new(32, 0, 0);
        let bundles = [
            cache.allocate_boot(&layout, &method(1)).unwrap(),
            cache
                .allocate(&layout, &method(2), false, Lifespan::Short)
                .unwrap(),
            cache
                .allocate(&layout, &method(3), false, Lifespan::Long)
                .unwrap(),
        ];
        let regions: [&dyn RegionView; 3] =
            [cache.boot_region(), cache.baseline_region(), cache.opt_region()];

        for bundle in &bundles {
            let owners = regions
                .iter()
                .filter(|r| r.contains(bundle.start()))
                .count();
            assert_eq!(owners, 1);
        }
    }

    #[test]
    fn test_gate_balanced_after_allocation() {
        let cache = small_cache();
        let layout = BundleLayout::new(16, 0, 0);
        cache
            .allocate(&layout, &method(1), false, Lifespan::Short)
            .unwrap();
        assert_eq!(crate::safepoint::gate_depth(), 0);
        assert!(!crate::safepoint::polls_disabled());
        assert!(!crate::safepoint::heap_alloc_disabled());
    }

    #[test]
    fn test_validate_on_fresh_cache() {
        let cache = small_cache();
        assert!(cache.validate());
    }

    #[test]
    fn test_install_and_global_access() {
        // The only test in this binary that touches the process singleton.
        let installed = install(small_cache());
        assert!(std::ptr::eq(installed, code_cache()));
        assert!(code_cache().validate());
    }
}
