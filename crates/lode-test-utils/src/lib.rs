//! Test utilities for lode development.
//!
//! - [`FailAfter`] and [`FailNth`]: deterministic fault injectors that
//!   target one [`FaultSite`](lode_core::FaultSite) or all of them.
//! - [`ScriptedVm`]: a [`SimulatedVm`](lode_vm::SimulatedVm) whose reserve
//!   and commit calls can be made to fail on demand.
//! - [`init_tracing`]: routes `tracing` output to the test harness.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod faults;
pub mod vm;

pub use faults::{FailAfter, FailNth};
pub use vm::ScriptedVm;

use tracing_subscriber::EnvFilter;

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Honors `RUST_LOG`, defaulting to `debug`. Safe to call from every test;
/// only the first call in a process installs anything.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
