//! Lode: loader heaps for runtime metadata.
//!
//! This is the top-level facade crate that re-exports the public API from all
//! lode sub-crates. For most users, adding `lode` as a single dependency is
//! sufficient.
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use lode::prelude::*;
//!
//! let vm: SharedVm = Arc::new(SimulatedVm::new());
//! let index = RangeIndex::default().into_shared();
//! let types = HeapBuilder::new(vm.clone())
//!     .range_index(index.clone())
//!     .build_locked()?;
//! let statics = HeapBuilder::new(vm)
//!     .range_index(index.clone())
//!     .build_locked()?;
//!
//! // Load a component: both allocations survive, or neither does.
//! let mut tracker = AllocationTracker::new();
//! let method_table = tracker.track(types.allocate(64))?;
//! let slots = tracker.track(statics.allocate(256))?;
//! tracker.commit();
//!
//! assert_eq!(
//!     index.lookup(method_table.base()),
//!     Some(OwnerId::from(types.id()))
//! );
//! assert!(!method_table.overlaps(&slots));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Modules
//!
//! Each module corresponds to a sub-crate. Use them for types not in the prelude:
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `lode-core` | Addresses, IDs, `HeapConfig`, fault injection |
//! | [`vm`] | `lode-vm` | `VirtualMemory` backends and address-space reservation |
//! | [`range`] | `lode-range` | Lock-free address-range ownership index |
//! | [`arena`] | `lode-arena` | Loader heaps, allocation tracker, diagnostics |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Loader heaps, allocation tracking and diagnostics (`lode-arena`).
///
/// [`arena::HeapBuilder`] builds every heap policy; most users also need
/// [`arena::AllocationTracker`].
pub use lode_arena as arena;

/// Addresses, identities, configuration and fault injection (`lode-core`).
pub use lode_core as types;

/// Virtual-memory backends (`lode-vm`).
///
/// [`vm::SimulatedVm`] for tests and tools, and on 64-bit Linux a
/// `SystemVm` over mmap.
pub use lode_vm as vm;

/// Address-range to owner lookup (`lode-range`).
pub use lode_range as range;

/// Common imports for typical lode usage.
///
/// ```rust
/// use lode::prelude::*;
/// ```
pub mod prelude {
    // Heaps and tracking
    pub use lode_arena::{
        AllocationTracker, ExplicitAllocation, ExplicitLoaderHeap, HeapBuilder,
        InterleavedLoaderHeap, LoaderHeap, LockedExplicitLoaderHeap,
        LockedInterleavedLoaderHeap, Placement, UnlockedLoaderHeap,
    };

    // Errors
    pub use lode_arena::{ArenaError, ContractViolation};
    pub use lode_core::ConfigError;
    pub use lode_vm::VmError;

    // Core types
    pub use lode_core::{Address, AddressRange, HeapConfig, HeapId, OwnerId};

    // Backends
    pub use lode_vm::{Protection, SharedVm, SimulatedVm, VirtualMemory};

    // Range index
    pub use lode_range::{RangeIndex, RangeIndexConfig};
}
