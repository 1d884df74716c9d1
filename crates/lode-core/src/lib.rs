//! Core types for the lode loader-heap workspace.
//!
//! This is the leaf crate with zero internal dependencies. It defines the
//! vocabulary shared by every other lode crate: raw addresses and address
//! ranges, heap and owner identities, heap configuration, and the
//! fault-injection strategy used to exercise out-of-memory paths.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod address;
pub mod config;
pub mod error;
pub mod fault;
pub mod id;

pub use address::{align_down, align_up, Address, AddressRange, ALLOC_ALIGN};
pub use config::HeapConfig;
pub use error::ConfigError;
pub use fault::{FaultInjector, FaultSite, NeverFail, ProbabilisticFaults, SharedInjector};
pub use id::{HeapId, OwnerId};
