//! Virtual-memory boundary for lode loader heaps.
//!
//! Loader heaps never talk to the operating system directly. They go through
//! the [`VirtualMemory`] trait, which exposes exactly the primitives a
//! reserve-then-commit allocator needs: query, reserve (anywhere or at an
//! address), commit, protect, zero and release.
//!
//! # Implementations
//!
//! ```text
//! VirtualMemory (trait)
//! ├── SystemVm     (mmap / mprotect / munmap / mincore, 64-bit Linux)
//! └── SimulatedVm  (deterministic in-process address-space model)
//! ```
//!
//! [`AddressSpaceReserver`] builds windowed reservation on top of the trait,
//! and [`NearReserver`] keeps related blocks close to a moving hint.
//!
//! Raw libc calls live in the private `sys` module; `SystemVm` only calls
//! them on reservations it created itself.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(unsafe_code)]

pub mod error;
pub mod reserver;
pub mod simulated;
#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
mod sys;
#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
pub mod system;
pub mod vm;

pub use error::{ReserveError, VmError};
pub use reserver::{AddressSpaceReserver, NearReserver, SharedNearReserver};
pub use simulated::SimulatedVm;
#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
pub use system::SystemVm;
pub use vm::{Protection, RegionInfo, RegionState, SharedVm, VirtualMemory};
