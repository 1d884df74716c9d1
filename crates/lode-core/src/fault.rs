//! Injectable "should this allocation synthetically fail" strategies.
//!
//! Every fallible heap path asks its [`FaultInjector`] before doing any work.
//! Production heaps use [`NeverFail`]; stress configurations use
//! [`ProbabilisticFaults`]; tests compose deterministic countdown injectors
//! from `lode-test-utils`.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::ConfigError;

/// The code path asking whether to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultSite {
    /// A heap allocation request.
    Allocate,
    /// Reserving a new block of address space.
    Reserve,
    /// Committing pages inside a reserved block.
    Commit,
    /// Appending a record to an allocation tracker.
    TrackerRecord,
    /// Appending a new block to a range index.
    RangeBlock,
    /// Appending an event to a sniffer log.
    SnifferRecord,
}

impl fmt::Display for FaultSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Allocate => "allocate",
            Self::Reserve => "reserve",
            Self::Commit => "commit",
            Self::TrackerRecord => "tracker-record",
            Self::RangeBlock => "range-block",
            Self::SnifferRecord => "sniffer-record",
        };
        f.write_str(name)
    }
}

/// Strategy deciding whether a fallible operation should fail synthetically.
pub trait FaultInjector: Send + Sync + fmt::Debug {
    /// Return `true` to make the operation at `site` report out-of-memory.
    fn should_fail(&self, site: FaultSite) -> bool;
}

/// Shared, type-erased fault injector.
pub type SharedInjector = Arc<dyn FaultInjector>;

/// The production injector: never fails anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverFail;

impl FaultInjector for NeverFail {
    fn should_fail(&self, _site: FaultSite) -> bool {
        false
    }
}

/// Fails allocations with a fixed probability using a seeded ChaCha RNG.
///
/// Only [`FaultSite::Allocate`] and [`FaultSite::Reserve`] are affected;
/// bookkeeping sites are left alone so that injected faults model address
/// space exhaustion rather than allocator-internal failures.
pub struct ProbabilisticFaults {
    rate: f64,
    rng: Mutex<ChaCha8Rng>,
}

impl ProbabilisticFaults {
    /// Create an injector failing with probability `rate`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidFaultRate`] unless `rate` is finite and
    /// within `[0, 1]`.
    pub fn new(rate: f64, seed: u64) -> Result<Self, ConfigError> {
        if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
            return Err(ConfigError::InvalidFaultRate { rate });
        }
        Ok(Self {
            rate,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        })
    }

    /// The configured failure probability.
    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl fmt::Debug for ProbabilisticFaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbabilisticFaults")
            .field("rate", &self.rate)
            .finish_non_exhaustive()
    }
}

impl FaultInjector for ProbabilisticFaults {
    fn should_fail(&self, site: FaultSite) -> bool {
        if !matches!(site, FaultSite::Allocate | FaultSite::Reserve) {
            return false;
        }
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        rng.random_bool(self.rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_fail_is_silent() {
        assert!(!NeverFail.should_fail(FaultSite::Allocate));
        assert!(!NeverFail.should_fail(FaultSite::TrackerRecord));
    }

    #[test]
    fn certain_failure_rate_always_fails_allocations() {
        let faults = ProbabilisticFaults::new(1.0, 7).unwrap();
        assert!(faults.should_fail(FaultSite::Allocate));
        assert!(faults.should_fail(FaultSite::Reserve));
        assert!(!faults.should_fail(FaultSite::SnifferRecord));
    }

    #[test]
    fn same_seed_same_sequence() {
        let a = ProbabilisticFaults::new(0.5, 42).unwrap();
        let b = ProbabilisticFaults::new(0.5, 42).unwrap();
        let seq_a: Vec<bool> = (0..64).map(|_| a.should_fail(FaultSite::Allocate)).collect();
        let seq_b: Vec<bool> = (0..64).map(|_| b.should_fail(FaultSite::Allocate)).collect();
        assert_eq!(seq_a, seq_b);
        assert!(seq_a.iter().any(|&f| f));
        assert!(seq_a.iter().any(|&f| !f));
    }

    #[test]
    fn invalid_rate_rejected() {
        assert!(ProbabilisticFaults::new(2.0, 0).is_err());
        assert!(ProbabilisticFaults::new(f64::INFINITY, 0).is_err());
    }
}
