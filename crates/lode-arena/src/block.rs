//! Reserved blocks and the per-heap chain that owns them.

use std::sync::{Arc, PoisonError};

use lode_core::{AddressRange, OwnerId};
use lode_range::RangeIndex;
use lode_vm::{AddressSpaceReserver, ReserveError, SharedNearReserver, SharedVm};

use crate::error::ArenaError;

/// One reservation a heap carves allocations from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaBlock {
    range: AddressRange,
    release_on_drop: bool,
}

impl ArenaBlock {
    pub(crate) fn new(range: AddressRange, release_on_drop: bool) -> Self {
        Self {
            range,
            release_on_drop,
        }
    }

    /// The whole reserved range.
    pub fn range(&self) -> AddressRange {
        self.range
    }

    /// Whether the heap releases this block when it is dropped.
    ///
    /// False for caller-supplied regions the caller keeps ownership of.
    pub fn release_on_drop(&self) -> bool {
        self.release_on_drop
    }
}

/// Where a heap places the blocks it reserves.
#[derive(Clone, Debug, Default)]
pub enum Placement {
    /// Anywhere in the address space.
    #[default]
    Anywhere,
    /// Entirely inside the given window.
    Within(AddressRange),
    /// As close as possible to a shared moving hint.
    Near(SharedNearReserver),
}

impl Placement {
    pub(crate) fn reserve(
        &self,
        reserver: &AddressSpaceReserver,
        size: usize,
    ) -> Result<AddressRange, ReserveError> {
        match self {
            Self::Anywhere => reserver.reserve_anywhere(size),
            Self::Within(window) => reserver.reserve(Some(window.base()), Some(window.end()), size),
            Self::Near(near) => near
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .reserve(size),
        }
    }
}

/// Blocks owned by one heap, oldest first.
///
/// When a range index is attached, every pushed block is registered under
/// the heap's owner ID and all of them are removed again on drop.
#[derive(Debug)]
pub(crate) struct BlockChain {
    vm: SharedVm,
    blocks: Vec<ArenaBlock>,
    registration: Option<(Arc<RangeIndex>, OwnerId)>,
}

impl BlockChain {
    pub(crate) fn new(vm: SharedVm, registration: Option<(Arc<RangeIndex>, OwnerId)>) -> Self {
        Self {
            vm,
            blocks: Vec::new(),
            registration,
        }
    }

    /// Register and adopt a committed block.
    ///
    /// On failure the block is released (if the heap owns it) and nothing
    /// is recorded.
    pub(crate) fn push(&mut self, block: ArenaBlock) -> Result<(), ArenaError> {
        if let Some((index, owner)) = &self.registration {
            let range = block.range();
            if let Err(err) = index.add(range.base(), range.end(), *owner) {
                tracing::debug!(%range, %err, "range registration failed, dropping block");
                if block.release_on_drop() {
                    self.vm.release(range);
                }
                return Err(ArenaError::oom(range.size()));
            }
        }
        self.blocks.push(block);
        Ok(())
    }

    pub(crate) fn blocks(&self) -> &[ArenaBlock] {
        &self.blocks
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn reserved_bytes(&self) -> usize {
        self.blocks.iter().map(|b| b.range().size()).sum()
    }
}

impl Drop for BlockChain {
    fn drop(&mut self) {
        if let Some((index, owner)) = &self.registration {
            index.remove(*owner);
        }
        for block in self.blocks.drain(..).rev() {
            if block.release_on_drop() {
                self.vm.release(block.range());
            }
        }
    }
}
