//! Strongly-typed heap and owner identities.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for unique [`HeapId`] allocation.
static HEAP_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique per-instance identifier for a loader heap.
///
/// Allocated from a monotonic atomic counter via [`HeapId::next`]. Two heaps
/// never share an ID within a process, even if one is dropped and another
/// is created at the same address, so IDs are safe to use as range-index
/// owners and as tracker routing keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapId(NonZeroU64);

impl HeapId {
    /// Allocate a fresh, unique heap ID. Thread-safe.
    pub fn next() -> Self {
        let raw = HEAP_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        // The counter starts at 1 and would need 2^64 heaps to wrap.
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// The raw numeric value.
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for HeapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "heap#{}", self.0)
    }
}

/// Opaque identity stored against a registered address range.
///
/// A range index maps `[start, end)` to an `OwnerId`. The zero value is
/// reserved to mean "vacant", which is why the wrapper is non-zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(NonZeroU64);

impl OwnerId {
    /// Wrap a raw identity. Returns `None` for zero.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// The raw numeric value.
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl From<HeapId> for OwnerId {
    fn from(id: HeapId) -> Self {
        Self(id.0)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}
