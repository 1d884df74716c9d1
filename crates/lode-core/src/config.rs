//! Loader heap configuration parameters.

use std::str::FromStr;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::fault::{NeverFail, ProbabilisticFaults, SharedInjector};

/// Configuration for a loader heap.
///
/// Controls block growth, commit granularity and the diagnostic
/// instrumentation attached to every allocation. Read once at heap
/// construction; all values are immutable afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct HeapConfig {
    /// Minimum size of each newly reserved block, in bytes.
    ///
    /// Default: 256 KiB. A request larger than this reserves a block just
    /// big enough for the request (rounded up to allocation granularity).
    pub reserve_block_size: usize,

    /// Minimum number of bytes committed at a time inside a block.
    ///
    /// Default: 4 KiB (one page on common platforms).
    pub commit_block_size: usize,

    /// Record every allocation and backout in an `ArenaSniffer` event log.
    pub call_tracing: bool,

    /// Record a `(kind, requested_size)` validation tag per allocation so
    /// that backouts and later scans can detect corruption.
    ///
    /// Defaults to on in debug builds.
    pub validation_tags: bool,

    /// Guard bytes appended after the user data of every allocation.
    ///
    /// Default: 0.
    pub debug_boundary: usize,

    /// Probability that any single allocation fails synthetically.
    ///
    /// Default: 0.0 (disabled). Used to exercise callers' out-of-memory paths.
    pub fault_injection_rate: f64,

    /// Seed for the deterministic fault-injection RNG.
    pub fault_seed: u64,
}

impl HeapConfig {
    /// Default reserve block size: 256 KiB.
    pub const DEFAULT_RESERVE_BLOCK_SIZE: usize = 256 * 1024;

    /// Default commit block size: 4 KiB.
    pub const DEFAULT_COMMIT_BLOCK_SIZE: usize = 4 * 1024;

    /// Default fault-injection seed.
    pub const DEFAULT_FAULT_SEED: u64 = 0x5EED_10AD_4EA9;

    /// Environment variable enabling call tracing.
    pub const ENV_CALL_TRACING: &'static str = "LODE_CALL_TRACING";
    /// Environment variable enabling validation tags.
    pub const ENV_VALIDATION_TAGS: &'static str = "LODE_VALIDATION_TAGS";
    /// Environment variable setting the fault-injection probability.
    pub const ENV_INJECT_FAULT_RATE: &'static str = "LODE_INJECT_FAULT_RATE";
    /// Environment variable setting the fault-injection seed.
    pub const ENV_FAULT_SEED: &'static str = "LODE_FAULT_SEED";
    /// Environment variable overriding the reserve block size.
    pub const ENV_RESERVE_BLOCK_SIZE: &'static str = "LODE_RESERVE_BLOCK_SIZE";
    /// Environment variable overriding the commit block size.
    pub const ENV_COMMIT_BLOCK_SIZE: &'static str = "LODE_COMMIT_BLOCK_SIZE";

    /// Create a config with default values for every parameter.
    pub fn new() -> Self {
        Self {
            reserve_block_size: Self::DEFAULT_RESERVE_BLOCK_SIZE,
            commit_block_size: Self::DEFAULT_COMMIT_BLOCK_SIZE,
            call_tracing: false,
            validation_tags: cfg!(debug_assertions),
            debug_boundary: 0,
            fault_injection_rate: 0.0,
            fault_seed: Self::DEFAULT_FAULT_SEED,
        }
    }

    /// Create a config from the process environment.
    ///
    /// Absent or unparsable variables fall back to the defaults of
    /// [`HeapConfig::new`]. Booleans accept `1`/`true`/`0`/`false`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create a config from an arbitrary key lookup.
    ///
    /// [`HeapConfig::from_env`] delegates here with `std::env::var`; tests
    /// pass a map instead of mutating the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::new();
        if let Some(v) = parse_bool(lookup(Self::ENV_CALL_TRACING)) {
            config.call_tracing = v;
        }
        if let Some(v) = parse_bool(lookup(Self::ENV_VALIDATION_TAGS)) {
            config.validation_tags = v;
        }
        if let Some(v) = parse(lookup(Self::ENV_INJECT_FAULT_RATE)) {
            config.fault_injection_rate = v;
        }
        if let Some(v) = parse(lookup(Self::ENV_FAULT_SEED)) {
            config.fault_seed = v;
        }
        if let Some(v) = parse(lookup(Self::ENV_RESERVE_BLOCK_SIZE)) {
            config.reserve_block_size = v;
        }
        if let Some(v) = parse(lookup(Self::ENV_COMMIT_BLOCK_SIZE)) {
            config.commit_block_size = v;
        }
        config
    }

    /// Validate the config against the platform page size.
    ///
    /// # Errors
    ///
    /// Returns `Err` if:
    /// - either block size is zero or not a multiple of `page_size`
    /// - the fault rate is not a finite probability
    /// - the debug boundary exceeds the commit block size
    pub fn validate(&self, page_size: usize) -> Result<(), ConfigError> {
        check_size("reserve_block_size", self.reserve_block_size, page_size)?;
        check_size("commit_block_size", self.commit_block_size, page_size)?;
        if !self.fault_injection_rate.is_finite()
            || !(0.0..=1.0).contains(&self.fault_injection_rate)
        {
            return Err(ConfigError::InvalidFaultRate {
                rate: self.fault_injection_rate,
            });
        }
        if self.debug_boundary > self.commit_block_size {
            return Err(ConfigError::BoundaryTooLarge {
                boundary: self.debug_boundary,
                max: self.commit_block_size,
            });
        }
        Ok(())
    }

    /// Build the fault injector described by this config.
    ///
    /// A zero rate yields [`NeverFail`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidFaultRate`] if the rate is not a
    /// probability.
    pub fn fault_injector(&self) -> Result<SharedInjector, ConfigError> {
        if self.fault_injection_rate == 0.0 {
            return Ok(Arc::new(NeverFail));
        }
        let faults = ProbabilisticFaults::new(self.fault_injection_rate, self.fault_seed)?;
        Ok(Arc::new(faults))
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn check_size(name: &'static str, value: usize, page_size: usize) -> Result<(), ConfigError> {
    if value == 0 || page_size == 0 || value % page_size != 0 {
        return Err(ConfigError::InvalidSize { name, value });
    }
    Ok(())
}

fn parse<T: FromStr>(raw: Option<String>) -> Option<T> {
    raw.and_then(|s| s.trim().parse().ok())
}

fn parse_bool(raw: Option<String>) -> Option<bool> {
    match raw?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_validate() {
        let config = HeapConfig::new();
        assert!(config.validate(4096).is_ok());
        assert_eq!(config.reserve_block_size, 256 * 1024);
        assert!(!config.call_tracing);
    }

    #[test]
    fn rejects_unaligned_block_sizes() {
        let config = HeapConfig {
            commit_block_size: 1000,
            ..HeapConfig::new()
        };
        assert!(matches!(
            config.validate(4096),
            Err(ConfigError::InvalidSize {
                name: "commit_block_size",
                ..
            })
        ));
    }

    #[test]
    fn rejects_bad_fault_rate() {
        for rate in [-0.1, 1.5, f64::NAN] {
            let config = HeapConfig {
                fault_injection_rate: rate,
                ..HeapConfig::new()
            };
            assert!(config.validate(4096).is_err());
            assert!(config.fault_injector().is_err());
        }
    }

    #[test]
    fn rejects_oversized_boundary() {
        let config = HeapConfig {
            debug_boundary: 8192,
            ..HeapConfig::new()
        };
        assert!(matches!(
            config.validate(4096),
            Err(ConfigError::BoundaryTooLarge { .. })
        ));
    }

    #[test]
    fn lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            ("LODE_CALL_TRACING", "1"),
            ("LODE_VALIDATION_TAGS", "false"),
            ("LODE_INJECT_FAULT_RATE", "0.25"),
            ("LODE_RESERVE_BLOCK_SIZE", "65536"),
            ("LODE_COMMIT_BLOCK_SIZE", "garbage"),
        ]
        .into_iter()
        .collect();
        let config = HeapConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert!(config.call_tracing);
        assert!(!config.validation_tags);
        assert_eq!(config.fault_injection_rate, 0.25);
        assert_eq!(config.reserve_block_size, 65536);
        assert_eq!(
            config.commit_block_size,
            HeapConfig::DEFAULT_COMMIT_BLOCK_SIZE
        );
    }

    #[test]
    fn zero_rate_never_fails() {
        let injector = HeapConfig::new().fault_injector().unwrap();
        for _ in 0..100 {
            assert!(!injector.should_fail(crate::FaultSite::Allocate));
        }
    }
}
