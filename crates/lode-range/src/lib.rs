//! Address-range to owner lookup for lode loader heaps.
//!
//! A [`RangeIndex`] maps `[start, end)` address ranges to the [`OwnerId`]
//! that registered them. Lookups take no lock and may run concurrently with
//! a single writer holding the index's [`RangeWriter`] guard.
//!
//! [`OwnerId`]: lode_core::OwnerId

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod error;
pub mod index;

pub use error::RangeError;
pub use index::{
    RangeEntry, RangeIndex, RangeIndexConfig, RangeWriter, RemovalReport, SLOTS_PER_BLOCK,
};
