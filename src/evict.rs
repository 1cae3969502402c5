//! Semi-space code eviction.
//!
//! The evictor reclaims dead baseline bundles by copying survivors into the
//! sister half-space and flipping. It runs entirely inside a global
//! safepoint: mutators are parked at poll points and the GC is blocked, so
//! code bytes, call displacements, and method placements can all change
//! together without a reader observing a torn state.
//!
//! # Phases
//!
//! 1. **Mark**: walk from-space in allocation order, query the reachability
//!    oracle, assign each survivor its to-space placement sequentially.
//! 2. **Relocate**: copy survivor bytes, fix copied headers, rewrite the
//!    direct-call displacements in every survivor's code stream, and patch
//!    the boot-to-baseline root call sites in place.
//! 3. **Flip**: swap the semi-spaces and retire the old from-space.

use rustc_hash::FxHashMap;

use crate::bundle::Bundle;
use crate::inspect;
use crate::method::CompiledMethod;
use crate::patch;
use crate::region::{RegionView, SemiSpaceCodeRegion};
use crate::roots::RootTable;
use crate::safepoint::{SafepointGate, SafepointSync, StwScope};
use crate::stats::CacheStats;
use crate::Lifespan;

/// External oracle deciding which bundles survive an eviction.
///
/// Provided by the stack-walking subsystem: a method is live while any
/// thread's stack may return into it, or while higher-level machinery still
/// dispatches to it.
pub trait Reachability: Send + Sync {
    /// Check whether a method's bundle must survive the current eviction.
    fn is_live(&self, method: &CompiledMethod) -> bool;
}

impl<F> Reachability for F
where
    F: Fn(&CompiledMethod) -> bool + Send + Sync,
{
    fn is_live(&self, method: &CompiledMethod) -> bool {
        self(method)
    }
}

/// Oracle that keeps everything. The default until the runtime wires in a
/// stack walker; also what exhaustion tests use.
#[derive(Debug, Default)]
pub struct RetainAll;

impl Reachability for RetainAll {
    fn is_live(&self, _method: &CompiledMethod) -> bool {
        true
    }
}

/// Relocation decisions of one mark phase.
struct RelocationPlan {
    /// Old bundle start → relocation delta.
    deltas: FxHashMap<usize, isize>,
    /// Survivor extents `(old_start, size)` in address order, for finding
    /// the bundle containing an arbitrary call target.
    extents: Vec<(usize, usize)>,
}

impl RelocationPlan {
    fn new() -> Self {
        Self {
            deltas: FxHashMap::default(),
            extents: Vec::new(),
        }
    }

    fn record(&mut self, old_start: usize, size: usize, new_start: usize) {
        self.deltas
            .insert(old_start, new_start as isize - old_start as isize);
        self.extents.push((old_start, size));
    }

    /// Map an address inside a surviving bundle to its post-move location.
    /// Addresses in bundles that did not survive map to `None` (the call
    /// site is left dangling for higher-level rewriting).
    fn relocate_addr(&self, addr: usize) -> Option<usize> {
        let idx = self.extents.partition_point(|&(start, _)| start <= addr);
        let &(start, size) = self.extents.get(idx.checked_sub(1)?)?;
        if addr < start + size {
            Some((addr as isize + self.deltas[&start]) as usize)
        } else {
            None
        }
    }
}

/// The semi-space compaction algorithm.
pub struct Evictor<'a> {
    region: &'a SemiSpaceCodeRegion,
    roots: &'a RootTable,
    stats: &'a CacheStats,
    safepoint: &'a dyn SafepointSync,
    trace: bool,
}

impl<'a> Evictor<'a> {
    /// Create an evictor over the baseline region.
    pub fn new(
        region: &'a SemiSpaceCodeRegion,
        roots: &'a RootTable,
        stats: &'a CacheStats,
        safepoint: &'a dyn SafepointSync,
        trace: bool,
    ) -> Self {
        Self {
            region,
            roots,
            stats,
            safepoint,
            trace,
        }
    }

    /// Run one complete eviction cycle.
    pub fn run(&self, oracle: &dyn Reachability) {
        let _stw = StwScope::enter(self.safepoint);
        let _gate = SafepointGate::enter();

        inspect::notify_eviction_started(self.region);

        let (survivors, plan, one_shot_reclaimed) = self.mark(oracle);
        self.relocate(&survivors, &plan);
        self.rewrite_roots(&plan);

        let survivor_bytes: usize = survivors.iter().map(|(_, new)| new.size()).sum();
        self.region.flip();
        self.stats.record_survivors(survivors.len(), survivor_bytes);

        if self.trace {
            eprintln!(
                "[codecache] eviction: {} survivors ({} bytes), {} one-shot bundles reclaimed, new mark {:#x}",
                survivors.len(),
                survivor_bytes,
                one_shot_reclaimed,
                self.region.mark(),
            );
        }

        inspect::notify_eviction_completed(self.region);
    }

    /// Walk from-space, consult the oracle, and assign survivor placements.
    ///
    /// Returns `(old, new)` bundle pairs in allocation order plus the
    /// relocation plan. One-shot bundles are reclaimed on their first
    /// eviction unless the oracle explicitly reports them live.
    fn mark(&self, oracle: &dyn Reachability) -> (Vec<(Bundle, Bundle)>, RelocationPlan, usize) {
        let to = self.region.to_space();
        let mut survivors = Vec::new();
        let mut plan = RelocationPlan::new();
        let mut one_shot_reclaimed = 0usize;

        self.region.visit(&mut |bundle| {
            if oracle.is_live(bundle.method()) {
                let new_start = to.allocate(bundle.size()).unwrap_or_else(|| {
                    // Impossible by construction: to-space equals from-space
                    // in size and survivors are a subset of from-space.
                    panic!(
                        "survivor bundle for {} exceeds to-space capacity",
                        bundle.method().name()
                    )
                });
                plan.record(bundle.start(), bundle.size(), new_start);
                survivors.push((bundle.clone(), bundle.rebased(new_start)));
            } else if bundle.lifespan() == Lifespan::OneShot {
                one_shot_reclaimed += 1;
            }
            true
        });

        (survivors, plan, one_shot_reclaimed)
    }

    /// Copy survivor bytes, fix headers and call displacements, update
    /// method placements, and index the survivors in to-space.
    fn relocate(&self, survivors: &[(Bundle, Bundle)], plan: &RelocationPlan) {
        let to = self.region.to_space();

        for (old, new) in survivors {
            // SAFETY: source and destination are distinct halves of the
            // reserved window, both spanning the bundle size.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    old.start() as *const u8,
                    new.start() as *mut u8,
                    old.size(),
                );
                new.refresh_header_start();
            }
            self.rewrite_calls(old, new, plan);
        }

        // Placements change only after every call target has been read
        // from the old locations.
        for (old, new) in survivors {
            let delta = new.start() as isize - old.start() as isize;
            new.method().relocate(delta);
            to.add(new.clone());
        }
    }

    /// Rewrite the direct-call displacements in one survivor's copied code.
    ///
    /// Targets inside from-space follow their bundle through the relocation
    /// plan; targets outside (boot, opt) keep their absolute address, with
    /// the displacement re-biased for the caller's own move. A target in a
    /// bundle that did not survive is left dangling for higher-level
    /// rewriting.
    fn rewrite_calls(&self, old: &Bundle, new: &Bundle, plan: &RelocationPlan) {
        let in_from = |addr: usize| self.region.in_from_space(addr);

        for site_offset in new.method().call_sites() {
            let old_site = old.code_start() + site_offset as usize;
            // SAFETY: call sites are in-bounds of the code array by the
            // compiler's registration contract.
            let old_target = unsafe { patch::call_target(old_site) };

            let new_target = if in_from(old_target) {
                match plan.relocate_addr(old_target) {
                    Some(addr) => addr,
                    None => old_target, // dead callee: site stays dangling until higher-level rewriting
                }
            } else {
                old_target
            };

            let new_site = new.code_start() + site_offset as usize;
            let disp = patch::encode_displacement(new_site, new_target).unwrap_or_else(|| {
                panic!(
                    "call displacement from {:#x} to {:#x} overflows 32 bits",
                    new_site, new_target
                )
            });
            // SAFETY: the displacement field is in-bounds of the copied
            // code array.
            unsafe { patch::write_disp32(new_site, disp) };
        }
    }

    /// Patch boot-region callers whose direct calls target moved bundles.
    /// Boot code does not move, so only from-space-targeted sites change.
    fn rewrite_roots(&self, plan: &RelocationPlan) {
        self.roots.for_each(|tm| {
            let code_start = tm.code_start();
            for site_offset in tm.call_sites() {
                let site = code_start + site_offset as usize;
                // SAFETY: root entries are placed boot-region methods with
                // in-bounds call sites.
                let target = unsafe { patch::call_target(site) };
                if !self.region.in_from_space(target) {
                    continue;
                }
                if let Some(new_target) = plan.relocate_addr(target) {
                    let disp = patch::encode_displacement(site, new_target).unwrap_or_else(|| {
                        panic!(
                            "root call displacement from {:#x} to {:#x} overflows 32 bits",
                            site, new_target
                        )
                    });
                    // SAFETY: in-bounds displacement field in boot code.
                    unsafe { patch::write_disp32(site, disp) };
                }
            }
            true
        });
    }
}
