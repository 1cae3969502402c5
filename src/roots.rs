//! Boot-to-baseline root table.
//!
//! Records every boot-region method that owns a direct call whose target
//! lives in the mobile baseline region. The evictor walks this table to
//! rewrite those call sites after moving their callees. Entries are never
//! removed: a stale entry (a caller no longer making the call) is harmless,
//! a missing one would leave a dangling displacement.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::method::CompiledMethod;

/// Initial capacity of the table.
const INITIAL_CAPACITY: usize = 10;

/// Dynamic table of boot-region callers into the baseline region.
#[derive(Debug)]
pub struct RootTable {
    entries: Mutex<Vec<Arc<CompiledMethod>>>,
}

impl RootTable {
    /// Create an empty table with the initial capacity.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::with_capacity(INITIAL_CAPACITY)),
        }
    }

    /// Append a boot-region caller. Duplicates are permitted but wasteful.
    ///
    /// The backing storage doubles on overflow, starting from the initial
    /// capacity of 10; the table never shrinks.
    pub fn append(&self, tm: Arc<CompiledMethod>) {
        let mut entries = self.entries.lock();
        if entries.len() == entries.capacity() {
            let cap = entries.capacity();
            entries.reserve_exact(cap);
        }
        entries.push(tm);
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take an owned snapshot suitable for iteration during eviction.
    pub fn snapshot(&self) -> Vec<Arc<CompiledMethod>> {
        self.entries.lock().clone()
    }

    /// Iterate entries in insertion order. The closure returns `false` to
    /// halt early. Only called inside the eviction safepoint, where no
    /// concurrent writers exist.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<CompiledMethod>) -> bool) {
        let entries = self.entries.lock();
        for tm in entries.iter() {
            if !f(tm) {
                return;
            }
        }
    }
}

impl Default for RootTable {
    fn default() -> Self {
        Self::new()
    }
}
