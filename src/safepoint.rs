//! Safepoint and heap-allocation interlock.
//!
//! The allocation path plants bundle headers into raw region memory; a
//! concurrent GC scan observing a half-initialised header would crash. The
//! [`SafepointGate`] therefore disables safepoint polling and heap
//! allocation for the current thread for the duration of the critical
//! section, restoring exactly what it disabled on every exit path.
//!
//! Stopping the world for eviction is an external collaborator's job: the
//! cache only contracts on the [`SafepointSync`] shape and wraps it in an
//! RAII scope.

use std::cell::Cell;

thread_local! {
    /// Safepoint polling disabled for this thread.
    static POLLS_DISABLED: Cell<bool> = const { Cell::new(false) };
    /// Heap allocation disabled for this thread.
    static HEAP_ALLOC_DISABLED: Cell<bool> = const { Cell::new(false) };
    /// Open gate count, for the imbalance assertion.
    static GATE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Check whether safepoint polling is disabled for the current thread.
///
/// Consulted by the surrounding runtime's poll emission and by the GC
/// before suspending a thread.
#[inline]
pub fn polls_disabled() -> bool {
    POLLS_DISABLED.with(|flag| flag.get())
}

/// Check whether heap allocation is disabled for the current thread.
///
/// Consulted by the surrounding heap's allocation slow path.
#[inline]
pub fn heap_alloc_disabled() -> bool {
    HEAP_ALLOC_DISABLED.with(|flag| flag.get())
}

/// Number of gates currently open on this thread. Zero outside any cache
/// critical section; validation asserts this.
#[inline]
pub fn gate_depth() -> usize {
    GATE_DEPTH.with(|depth| depth.get())
}

/// Scoped critical section that disables per-thread safepoints and heap
/// allocation around region mutation.
///
/// The gate records which of the two flags *it* flipped and restores only
/// those on drop, so a nested gate that finds polling already disabled
/// leaves it disabled for the outer scope. Drop runs on every exit path,
/// including unwinding.
#[derive(Debug)]
pub struct SafepointGate {
    disabled_polls: bool,
    disabled_heap_alloc: bool,
}

impl SafepointGate {
    /// Enter the critical section.
    pub fn enter() -> Self {
        let disabled_polls = POLLS_DISABLED.with(|flag| !flag.replace(true));
        let disabled_heap_alloc = HEAP_ALLOC_DISABLED.with(|flag| !flag.replace(true));
        GATE_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            disabled_polls,
            disabled_heap_alloc,
        }
    }
}

impl Drop for SafepointGate {
    fn drop(&mut self) {
        if self.disabled_polls {
            POLLS_DISABLED.with(|flag| flag.set(false));
        }
        if self.disabled_heap_alloc {
            HEAP_ALLOC_DISABLED.with(|flag| flag.set(false));
        }
        GATE_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// Global stop-the-world primitive, provided by the surrounding runtime.
///
/// `stop_the_world` must park every mutator thread at a polling point and
/// prevent a garbage collection from starting; `resume` undoes both. The
/// cache calls them strictly in pairs through [`StwScope`].
pub trait SafepointSync: Send + Sync {
    /// Park all mutator threads and block GC from starting.
    fn stop_the_world(&self);

    /// Release the mutator threads and re-allow GC.
    fn resume(&self);
}

/// Safepoint synchronisation for single-threaded embeddings and tests:
/// with no other mutators, stopping the world is a no-op.
#[derive(Debug, Default)]
pub struct SoloSafepoint;

impl SafepointSync for SoloSafepoint {
    fn stop_the_world(&self) {}
    fn resume(&self) {}
}

/// RAII scope over a [`SafepointSync`]: the world stays stopped until the
/// scope is dropped.
pub(crate) struct StwScope<'a> {
    sync: &'a dyn SafepointSync,
}

impl<'a> StwScope<'a> {
    pub(crate) fn enter(sync: &'a dyn SafepointSync) -> Self {
        sync.stop_the_world();
        Self { sync }
    }
}

impl Drop for StwScope<'_> {
    fn drop(&mut self) {
        self.sync.resume();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_disables_and_restores() {
        assert!(!polls_disabled());
        assert!(!heap_alloc_disabled());
        {
            let _gate = SafepointGate::enter();
            assert!(polls_disabled());
            assert!(heap_alloc_disabled());
            assert_eq!(gate_depth(), 1);
        }
        assert!(!polls_disabled());
        assert!(!heap_alloc_disabled());
        assert_eq!(gate_depth(), 0);
    }

    #[test]
    fn test_nested_gate_is_idempotent() {
        let _outer = SafepointGate::enter();
        assert!(polls_disabled());
        {
            let _inner = SafepointGate::enter();
            assert!(polls_disabled());
            assert_eq!(gate_depth(), 2);
        }
        // The inner gate found the flags already disabled and must not
        // re-enable them for the outer scope.
        assert!(polls_disabled());
        assert!(heap_alloc_disabled());
        assert_eq!(gate_depth(), 1);
    }

    #[test]
    fn test_gate_restores_on_panic() {
        let result = std::panic::catch_unwind(|| {
            let _gate = SafepointGate::enter();
            panic!("mid-critical-section failure");
        });
        assert!(result.is_err());
        assert!(!polls_disabled());
        assert!(!heap_alloc_disabled());
        assert_eq!(gate_depth(), 0);
    }

    #[test]
    fn test_flags_are_thread_local() {
        let _gate = SafepointGate::enter();
        let handle = std::thread::spawn(|| polls_disabled());
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn test_stw_scope_pairs_calls() {
        use std::sync::atomic::{AtomicI32, Ordering};

        struct Counting(AtomicI32);
        impl SafepointSync for Counting {
            fn stop_the_world(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            fn resume(&self) {
                self.0.fetch_sub(1, Ordering::SeqCst);
            }
        }

        let sync = Counting(AtomicI32::new(0));
        {
            let _scope = StwScope::enter(&sync);
            assert_eq!(sync.0.load(Ordering::SeqCst), 1);
        }
        assert_eq!(sync.0.load(Ordering::SeqCst), 0);
    }
}
