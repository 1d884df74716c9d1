//! Windowed address-space reservation.
//!
//! [`AddressSpaceReserver`] finds and reserves a free region inside an
//! address window. When the window is the whole address space it hands the
//! request straight to the backend; otherwise it tries the backend's native
//! windowed facility, then falls back to a query-and-probe linear scan.
//!
//! The scan never allocates, so it is usable before any heap exists, and it
//! is safe to retry: a failed attempt leaves nothing reserved.

use std::sync::{Arc, Mutex};

use lode_core::{Address, AddressRange, FaultSite, SharedInjector};

use crate::error::ReserveError;
use crate::vm::{RegionState, SharedVm};

/// Reserves address space inside a caller-supplied window.
#[derive(Clone, Debug)]
pub struct AddressSpaceReserver {
    vm: SharedVm,
    injector: Option<SharedInjector>,
}

impl AddressSpaceReserver {
    /// Create a reserver over `vm`.
    pub fn new(vm: SharedVm) -> Self {
        Self { vm, injector: None }
    }

    /// Consult `injector` at [`FaultSite::Reserve`] before every reservation.
    pub fn with_fault_injector(mut self, injector: SharedInjector) -> Self {
        self.injector = Some(injector);
        self
    }

    /// The backend this reserver drives.
    pub fn vm(&self) -> &SharedVm {
        &self.vm
    }

    /// Reserve `size` bytes anywhere.
    pub fn reserve_anywhere(&self, size: usize) -> Result<AddressRange, ReserveError> {
        self.reserve(None, None, size)
    }

    /// Reserve `size` bytes whose every byte lies in `[min, max)`.
    ///
    /// Missing endpoints default to the backend's address bounds, and
    /// supplied endpoints are clamped to them. `size` is rounded up to the
    /// allocation granularity, so the returned range may be larger than
    /// requested.
    ///
    /// # Errors
    ///
    /// - [`ReserveError::ZeroSize`] for a zero-byte request.
    /// - [`ReserveError::InvalidWindow`] if the normalized window is empty.
    /// - [`ReserveError::Exhausted`] if the scan runs off the top of the
    ///   window.
    /// - [`ReserveError::QueryFailed`] if the backend cannot describe a
    ///   probed address.
    /// - [`ReserveError::Os`] if an unconstrained reservation fails.
    pub fn reserve(
        &self,
        min: Option<Address>,
        max: Option<Address>,
        size: usize,
    ) -> Result<AddressRange, ReserveError> {
        if size == 0 {
            return Err(ReserveError::ZeroSize);
        }
        let granularity = self.vm.allocation_granularity();
        let size = lode_core::align_up(size, granularity).ok_or(ReserveError::Exhausted {
            size,
            queries: 0,
        })?;

        let bounds = self.vm.address_bounds();
        let min = min.map_or(bounds.base(), |m| m.max(bounds.base()));
        let max = max.map_or(bounds.end(), |m| m.min(bounds.end()));
        if max <= min {
            return Err(ReserveError::InvalidWindow { min, max });
        }

        if self.fault_injected() {
            tracing::warn!(size, %min, %max, "injected reservation fault");
            return Err(ReserveError::FaultInjected);
        }

        if min == bounds.base() && max == bounds.end() {
            let base = self.vm.reserve(size)?;
            return Ok(AddressRange::new(base, size));
        }

        let window = AddressRange::from_bounds(min, max).ok_or(ReserveError::InvalidWindow { min, max })?;
        if let Some(base) = self.vm.reserve_within(window, size) {
            return Ok(AddressRange::new(base, size));
        }

        self.scan(min, max, size, granularity)
    }

    fn fault_injected(&self) -> bool {
        self.injector
            .as_ref()
            .is_some_and(|i| i.should_fail(FaultSite::Reserve))
    }

    fn scan(
        &self,
        min: Address,
        max: Address,
        size: usize,
        granularity: usize,
    ) -> Result<AddressRange, ReserveError> {
        let mut queries = 0;
        let exhausted = |queries| ReserveError::Exhausted { size, queries };
        let mut probe = min.align_up(granularity).ok_or(exhausted(queries))?;

        loop {
            let end = match probe.checked_add(size) {
                Some(end) if end <= max => end,
                _ => return Err(exhausted(queries)),
            };

            let info = self
                .vm
                .query(probe)
                .map_err(|_| ReserveError::QueryFailed { address: probe })?;
            queries += 1;

            let next = if info.state == RegionState::Free {
                // A zero-sized report means the extent is unknown: just try.
                let fits = info.size == 0 || info.end() >= end;
                if fits {
                    match self.vm.reserve_at(probe, size) {
                        Ok(base) => return Ok(AddressRange::new(base, size)),
                        // Lost a race with another reserver.
                        Err(_) => probe.checked_add(granularity),
                    }
                } else {
                    info.end().align_up(granularity)
                }
            } else if info.size == 0 {
                probe.checked_add(granularity)
            } else {
                info.end().align_up(granularity)
            };

            match next {
                Some(next) if next > probe => probe = next,
                _ => return Err(exhausted(queries)),
            }
        }
    }
}

/// Keeps successive reservations within reach of a moving hint address.
///
/// Used for blocks that must sit close to code so relative displacements
/// stay small. Each request tries the window just above the hint, then the
/// window just below it, then gives up on locality and reserves anywhere.
#[derive(Debug)]
pub struct NearReserver {
    reserver: AddressSpaceReserver,
    initial_hint: Address,
    hint: Address,
    reach: usize,
}

/// A [`NearReserver`] shared between heaps that allocate near the same code.
pub type SharedNearReserver = Arc<Mutex<NearReserver>>;

impl NearReserver {
    /// Two gigabytes less one granule, the span of a signed 32-bit displacement.
    pub const DEFAULT_REACH: usize = (1 << 31) - (64 * 1024);

    /// Create a near reserver starting at `hint`, placing blocks within
    /// `reach` bytes of it.
    pub fn new(reserver: AddressSpaceReserver, hint: Address, reach: usize) -> Self {
        Self {
            reserver,
            initial_hint: hint,
            hint,
            reach,
        }
    }

    /// Wrap in the shared handle heaps accept.
    pub fn into_shared(self) -> SharedNearReserver {
        Arc::new(Mutex::new(self))
    }

    /// The current hint.
    pub fn hint(&self) -> Address {
        self.hint
    }

    /// Return the hint to where it started.
    pub fn reset(&mut self) {
        self.hint = self.initial_hint;
    }

    /// Reserve `size` bytes, as close to the hint as possible.
    ///
    /// A reservation placed above the hint moves the hint past its end, so
    /// the next request packs in right after it.
    pub fn reserve(&mut self, size: usize) -> Result<AddressRange, ReserveError> {
        let hint = self.hint.get();
        let above_max = Address(hint.saturating_add(self.reach));
        if let Ok(range) = self.reserver.reserve(Some(self.hint), Some(above_max), size) {
            self.hint = range.end();
            return Ok(range);
        }

        let below_min = Address(hint.saturating_sub(self.reach));
        if let Ok(range) = self.reserver.reserve(Some(below_min), Some(self.hint), size) {
            return Ok(range);
        }

        tracing::debug!(size, hint = %self.hint, "no room near hint, reserving anywhere");
        self.reserver.reserve_anywhere(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedVm;
    use crate::VirtualMemory;
    use lode_core::FaultInjector;

    const GRAN: usize = SimulatedVm::DEFAULT_GRANULARITY;

    fn setup() -> (Arc<SimulatedVm>, AddressSpaceReserver) {
        let vm = Arc::new(SimulatedVm::new());
        let reserver = AddressSpaceReserver::new(vm.clone());
        (vm, reserver)
    }

    #[derive(Debug)]
    struct AlwaysFail;

    impl FaultInjector for AlwaysFail {
        fn should_fail(&self, _site: FaultSite) -> bool {
            true
        }
    }

    #[test]
    fn full_window_delegates_to_backend() {
        let (vm, reserver) = setup();
        let range = reserver.reserve_anywhere(100).unwrap();
        assert_eq!(range.size(), GRAN);
        assert_eq!(range.base(), vm.address_bounds().base());
        assert_eq!(vm.query_count(), 0);
    }

    #[test]
    fn scan_skips_occupied_regions() {
        let (vm, reserver) = setup();
        let min = Address(0x100_0000);
        vm.occupy(AddressRange::new(min, 3 * GRAN)).unwrap();

        let range = reserver
            .reserve(Some(min), Some(Address(0x200_0000)), GRAN)
            .unwrap();
        assert_eq!(range.base(), min.offset(3 * GRAN));
        assert!(vm.query_count() >= 2);
    }

    #[test]
    fn scan_rounds_min_up_to_granularity() {
        let (_vm, reserver) = setup();
        let range = reserver
            .reserve(Some(Address(0x100_0001)), Some(Address(0x200_0000)), 1)
            .unwrap();
        assert_eq!(range.base(), Address(0x100_0000 + GRAN));
    }

    #[test]
    fn scan_skips_holes_too_small() {
        let (vm, reserver) = setup();
        let min = Address(0x100_0000);
        vm.occupy(AddressRange::new(min.offset(GRAN), GRAN)).unwrap();

        let range = reserver
            .reserve(Some(min), Some(Address(0x200_0000)), 2 * GRAN)
            .unwrap();
        assert_eq!(range.base(), min.offset(2 * GRAN));
    }

    #[test]
    fn scan_reports_exhaustion() {
        let (vm, reserver) = setup();
        let min = Address(0x100_0000);
        let max = min.offset(4 * GRAN);
        vm.occupy(AddressRange::new(min.offset(GRAN), GRAN)).unwrap();
        vm.occupy(AddressRange::new(min.offset(3 * GRAN), GRAN)).unwrap();

        let err = reserver.reserve(Some(min), Some(max), 2 * GRAN).unwrap_err();
        assert!(matches!(err, ReserveError::Exhausted { .. }), "{err}");
        assert_eq!(vm.reservation_count(), 2);
    }

    #[test]
    fn degenerate_requests_rejected() {
        let (_vm, reserver) = setup();
        assert_eq!(reserver.reserve_anywhere(0), Err(ReserveError::ZeroSize));
        let err = reserver
            .reserve(Some(Address(0x200_0000)), Some(Address(0x100_0000)), GRAN)
            .unwrap_err();
        assert!(matches!(err, ReserveError::InvalidWindow { .. }));
    }

    #[test]
    fn injected_fault_reserves_nothing() {
        let (vm, reserver) = setup();
        let reserver = reserver.with_fault_injector(Arc::new(AlwaysFail));
        assert_eq!(reserver.reserve_anywhere(GRAN), Err(ReserveError::FaultInjected));
        assert_eq!(vm.reservation_count(), 0);
    }

    #[test]
    fn near_reserver_packs_above_hint() {
        let (_vm, reserver) = setup();
        let hint = Address(0x4000_0000);
        let mut near = NearReserver::new(reserver, hint, 16 * GRAN);

        let a = near.reserve(GRAN).unwrap();
        let b = near.reserve(GRAN).unwrap();
        assert_eq!(a.base(), hint);
        assert_eq!(b.base(), a.end());
        assert_eq!(near.hint(), b.end());

        near.reset();
        assert_eq!(near.hint(), hint);
    }

    #[test]
    fn near_reserver_falls_back_below_then_anywhere() {
        let (vm, reserver) = setup();
        let hint = Address(0x4000_0000);
        vm.occupy(AddressRange::new(hint, 2 * GRAN)).unwrap();
        let mut near = NearReserver::new(reserver, hint, 2 * GRAN);

        let below = near.reserve(GRAN).unwrap();
        assert!(below.end() <= hint);
        assert_eq!(near.hint(), hint);

        vm.occupy(AddressRange::new(below.end(), GRAN)).unwrap();
        let anywhere = near.reserve(GRAN).unwrap();
        assert_eq!(anywhere.base(), vm.address_bounds().base());
    }
}
