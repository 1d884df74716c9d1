//! Per-allocation validation tags.
//!
//! When [`HeapConfig::validation_tags`](lode_core::HeapConfig) is on, every
//! allocation records what it was asked for. Backouts check the record
//! before touching memory, and [`ArenaSniffer::validate`] compares a logged
//! event against it, so a double backout or a size mismatch shows up as a
//! contract violation instead of silent heap corruption.
//!
//! [`ArenaSniffer::validate`]: crate::ArenaSniffer::validate

use std::panic::Location;

use indexmap::IndexMap;
use lode_core::Address;

use crate::error::ContractViolation;

/// Lifecycle state recorded in a [`ValidationTag`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocationKind {
    /// Handed out and not yet backed out.
    Alloc,
    /// Backed out; the bytes are free or reused.
    Freed,
}

/// What an allocation was created with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidationTag {
    /// Current lifecycle state.
    pub kind: AllocationKind,
    /// Size the caller asked for, before rounding.
    pub requested_size: usize,
    /// Where the allocation was requested.
    pub location: &'static Location<'static>,
}

/// Side table of validation tags keyed by allocation start address.
///
/// Uses `IndexMap` so that dumps list allocations in the order they were
/// first made at each address.
#[derive(Debug, Default)]
pub struct ValidationTags {
    tags: IndexMap<Address, ValidationTag>,
}

impl ValidationTags {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fresh allocation at `address`, replacing any older tag.
    pub fn insert(
        &mut self,
        address: Address,
        requested_size: usize,
        location: &'static Location<'static>,
    ) {
        self.tags.insert(
            address,
            ValidationTag {
                kind: AllocationKind::Alloc,
                requested_size,
                location,
            },
        );
    }

    /// The tag recorded at `address`, if any.
    pub fn get(&self, address: Address) -> Option<&ValidationTag> {
        self.tags.get(&address)
    }

    /// Check that a live allocation of `requested_size` starts at `address`.
    ///
    /// # Errors
    ///
    /// [`ContractViolation::InvalidBackout`] if there is no tag, the tag is
    /// already freed, or the size differs.
    pub fn check(&self, address: Address, requested_size: usize) -> Result<(), ContractViolation> {
        match self.tags.get(&address) {
            Some(tag)
                if tag.kind == AllocationKind::Alloc && tag.requested_size == requested_size =>
            {
                Ok(())
            }
            _ => Err(ContractViolation::InvalidBackout {
                address,
                size: requested_size,
            }),
        }
    }

    /// Mark the allocation at `address` as backed out.
    pub fn mark_freed(&mut self, address: Address) {
        if let Some(tag) = self.tags.get_mut(&address) {
            tag.kind = AllocationKind::Freed;
        }
    }

    /// Number of tags recorded, live or freed.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Whether no tags are recorded.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Iterate `(address, tag)` pairs in first-recorded order.
    pub fn iter(&self) -> impl Iterator<Item = (Address, &ValidationTag)> {
        self.tags.iter().map(|(&a, t)| (a, t))
    }
}
