//! Construction of every loader-heap policy.

use std::sync::Arc;

use lode_core::{AddressRange, ConfigError, HeapConfig, SharedInjector};
use lode_range::RangeIndex;
use lode_vm::SharedVm;

use crate::block::{ArenaBlock, Placement};
use crate::bump::{is_page_region, BumpHeap, HeapKind, HeapParts};
use crate::explicit::{ExplicitLoaderHeap, LockedExplicitLoaderHeap};
use crate::heap::{LoaderHeap, UnlockedLoaderHeap};
use crate::interleaved::{
    CodePageGenerator, InterleavedLoaderHeap, LockedInterleavedLoaderHeap,
};

/// Collects the parameters of a new heap.
///
/// ```text
/// let heap = HeapBuilder::new(vm)
///     .config(HeapConfig::from_env())
///     .range_index(index.clone())
///     .executable(true)
///     .build_locked()?;
/// ```
#[derive(Debug)]
pub struct HeapBuilder {
    vm: SharedVm,
    config: HeapConfig,
    placement: Placement,
    range_index: Option<Arc<RangeIndex>>,
    injector: Option<SharedInjector>,
    reserved_region: Option<(AddressRange, bool)>,
    executable: bool,
}

impl HeapBuilder {
    /// Start a builder for a heap backed by `vm`, with default config.
    pub fn new(vm: SharedVm) -> Self {
        Self {
            vm,
            config: HeapConfig::new(),
            placement: Placement::Anywhere,
            range_index: None,
            injector: None,
            reserved_region: None,
            executable: false,
        }
    }

    /// Replace the heap configuration.
    pub fn config(mut self, config: HeapConfig) -> Self {
        self.config = config;
        self
    }

    /// Choose where new blocks are reserved.
    pub fn placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    /// Register every block the heap reserves in `index`.
    pub fn range_index(mut self, index: Arc<RangeIndex>) -> Self {
        self.range_index = Some(index);
        self
    }

    /// Use `injector` instead of the one described by the config.
    pub fn fault_injector(mut self, injector: SharedInjector) -> Self {
        self.injector = Some(injector);
        self
    }

    /// Carve the first block from a region the caller already reserved.
    ///
    /// With `release_on_drop` the heap takes ownership of the region and
    /// releases it when dropped.
    pub fn reserved_region(mut self, range: AddressRange, release_on_drop: bool) -> Self {
        self.reserved_region = Some((range, release_on_drop));
        self
    }

    /// Commit pages read-execute instead of read-write.
    ///
    /// Ignored by [`build_interleaved`](Self::build_interleaved), whose
    /// code pages are always read-execute.
    pub fn executable(mut self, executable: bool) -> Self {
        self.executable = executable;
        self
    }

    fn parts(self) -> Result<(HeapParts, bool), ConfigError> {
        let page = self.vm.page_size();
        self.config.validate(page)?;
        let injector = match self.injector {
            Some(injector) => injector,
            None => self.config.fault_injector()?,
        };
        let reserved_region = match self.reserved_region {
            Some((range, _)) if !is_page_region(range, page) => {
                return Err(ConfigError::InvalidSize {
                    name: "reserved_region",
                    value: range.size(),
                });
            }
            Some((range, release)) => Some(ArenaBlock::new(range, release)),
            None => None,
        };
        let parts = HeapParts {
            vm: self.vm,
            config: self.config,
            placement: self.placement,
            injector,
            range_index: self.range_index,
            reserved_region,
        };
        Ok((parts, self.executable))
    }

    fn data_kind(executable: bool) -> HeapKind {
        if executable {
            HeapKind::Executable
        } else {
            HeapKind::Data
        }
    }

    /// Build a default-policy heap for single-threaded use.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] if the config does not validate against the backend's
    /// page size or the reserved region is not whole pages.
    pub fn build(self) -> Result<UnlockedLoaderHeap, ConfigError> {
        let (parts, executable) = self.parts()?;
        let core = BumpHeap::new(parts, Self::data_kind(executable), false, None);
        tracing::debug!(heap = %core.id(), executable, "created loader heap");
        Ok(UnlockedLoaderHeap::from_core(core))
    }

    /// Build a default-policy heap behind a lock.
    ///
    /// # Errors
    ///
    /// See [`build`](Self::build).
    pub fn build_locked(self) -> Result<LoaderHeap, ConfigError> {
        self.build().map(LoaderHeap::new)
    }

    /// Build an explicit-control heap.
    ///
    /// # Errors
    ///
    /// See [`build`](Self::build).
    pub fn build_explicit(self) -> Result<ExplicitLoaderHeap, ConfigError> {
        let (parts, executable) = self.parts()?;
        let core = BumpHeap::new(parts, Self::data_kind(executable), true, None);
        tracing::debug!(heap = %core.id(), executable, "created explicit loader heap");
        Ok(ExplicitLoaderHeap::from_core(core))
    }

    /// Build an explicit-control heap behind a lock.
    ///
    /// # Errors
    ///
    /// See [`build`](Self::build).
    pub fn build_explicit_locked(self) -> Result<LockedExplicitLoaderHeap, ConfigError> {
        self.build_explicit().map(LockedExplicitLoaderHeap::new)
    }

    /// Build an interleaved heap whose code pages are filled by `generator`.
    ///
    /// # Errors
    ///
    /// See [`build`](Self::build).
    pub fn build_interleaved(
        self,
        generator: impl CodePageGenerator + 'static,
    ) -> Result<InterleavedLoaderHeap, ConfigError> {
        let (parts, _) = self.parts()?;
        let core = BumpHeap::new(
            parts,
            HeapKind::Interleaved,
            false,
            Some(Box::new(generator)),
        );
        tracing::debug!(heap = %core.id(), "created interleaved loader heap");
        Ok(InterleavedLoaderHeap::from_core(core))
    }

    /// Build an interleaved heap behind a lock.
    ///
    /// # Errors
    ///
    /// See [`build`](Self::build).
    pub fn build_interleaved_locked(
        self,
        generator: impl CodePageGenerator + 'static,
    ) -> Result<LockedInterleavedLoaderHeap, ConfigError> {
        self.build_interleaved(generator)
            .map(LockedInterleavedLoaderHeap::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lode_core::{Address, FaultInjector, FaultSite};
    use lode_vm::{SimulatedVm, VirtualMemory};

    #[derive(Debug)]
    struct FailAllocations;

    impl FaultInjector for FailAllocations {
        fn should_fail(&self, site: FaultSite) -> bool {
            site == FaultSite::Allocate
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let vm = Arc::new(SimulatedVm::new());
        let err = HeapBuilder::new(vm)
            .config(HeapConfig {
                commit_block_size: 100,
                ..HeapConfig::new()
            })
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidSize {
                name: "commit_block_size",
                value: 100
            }
        );
    }

    #[test]
    fn misaligned_reserved_region_is_rejected() {
        let vm = Arc::new(SimulatedVm::new());
        let err = HeapBuilder::new(vm)
            .reserved_region(AddressRange::new(Address(0x1_0008), 0x1000), false)
            .build_explicit()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidSize {
                name: "reserved_region",
                ..
            }
        ));
    }

    #[test]
    fn reserved_region_feeds_the_first_block() {
        let vm = Arc::new(SimulatedVm::new());
        let range = AddressRange::new(vm.reserve(0x1_0000).unwrap(), 0x1_0000);
        let mut heap = HeapBuilder::new(vm.clone())
            .reserved_region(range, true)
            .build_explicit()
            .unwrap();
        let token = heap.allocate(8).unwrap();
        assert_eq!(token.memory().base(), range.base());
        token.keep();
        drop(heap);
        assert_eq!(vm.reservation_count(), 0);
    }

    #[test]
    fn explicit_injector_overrides_config() {
        let vm = Arc::new(SimulatedVm::new());
        let mut heap = HeapBuilder::new(vm.clone())
            .fault_injector(Arc::new(FailAllocations))
            .build()
            .unwrap();
        assert!(heap.allocate(8).unwrap_err().is_out_of_memory());
        assert_eq!(vm.reservation_count(), 0);
    }

    #[test]
    fn heaps_get_distinct_ids() {
        let vm = Arc::new(SimulatedVm::new());
        let a = HeapBuilder::new(vm.clone()).build().unwrap();
        let b = HeapBuilder::new(vm).build_locked().unwrap();
        assert_ne!(a.id(), b.id());
    }
}
