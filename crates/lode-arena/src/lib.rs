//! Loader heaps: reserve-then-commit bump allocators for runtime metadata.
//!
//! A loader heap hands out memory that lives as long as the heap itself.
//! There is no per-allocation free; the only way back is a *backout*, which
//! undoes allocations made by an operation that failed partway through.
//!
//! # Architecture
//!
//! ```text
//! HeapBuilder ──build──────────────▶ UnlockedLoaderHeap ──▶ LoaderHeap (Mutex)
//!             ──build_explicit─────▶ ExplicitLoaderHeap ──▶ LockedExplicitLoaderHeap
//!             ──build_interleaved──▶ InterleavedLoaderHeap ──▶ LockedInterleavedLoaderHeap
//!
//! every policy
//! └── BumpHeap
//!     ├── BlockChain → ArenaBlock[] (reserved ranges, optionally in a RangeIndex)
//!     ├── FreeList (non-LIFO backouts, default policy only)
//!     ├── ValidationTags (address → kind + size side table)
//!     ├── guard bytes after user data (debug_boundary)
//!     └── ArenaSniffer (alloc/free event log)
//!
//! AllocationTracker ── backs out TaggedAllocations in reverse on drop,
//!                      from any of the three locked heaps
//! ```
//!
//! # Policies
//!
//! - **Default:** reserves blocks on demand and rewinds or free-lists any
//!   backout.
//! - **Explicit:** uses only caller-supplied regions and backs out through
//!   move-only tokens, most recent first.
//! - **Interleaved:** pairs each read-execute code page with a read-write
//!   data page one page above it.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

mod block;
pub mod builder;
mod bump;
pub mod error;
pub mod explicit;
mod freelist;
pub mod guard;
pub mod heap;
pub mod interleaved;
pub mod sniffer;
pub mod tags;
pub mod tracker;

// Public re-exports for the primary API surface.
pub use block::{ArenaBlock, Placement};
pub use builder::HeapBuilder;
pub use bump::AlignedAllocation;
pub use error::{ArenaError, ContractViolation};
pub use explicit::{ExplicitAllocation, ExplicitLoaderHeap, LockedExplicitLoaderHeap};
pub use guard::{BoundaryGuard, GUARD_BYTE};
pub use heap::{LoaderHeap, UnlockedLoaderHeap};
pub use interleaved::{
    CodePageGenerator, InterleavedAllocation, InterleavedLoaderHeap, LockedInterleavedLoaderHeap,
};
pub use sniffer::{ArenaSniffer, EventKind, SnifferEvent};
pub use tags::{AllocationKind, ValidationTag, ValidationTags};
pub use tracker::{AllocationTracker, BackoutTarget, TaggedAllocation};
