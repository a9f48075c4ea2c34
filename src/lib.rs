//! xdrive — a high-throughput disk-to-disk and host-to-host data-movement
//! and benchmarking engine.
//!
//! The crate is built around three subsystems, each documented in its own
//! module:
//!
//! - [`worker`] / [`target`]: a per-target pool of native-thread workers
//!   that run a barrier-synchronized, throttled, triggerable operation loop.
//! - [`net`]: a pluggable end-to-end streaming transport that couples a
//!   reading source pool to a writing destination pool.
//! - [`restart`]: a background monitor that durably checkpoints the
//!   destination's committed prefix so a transfer can resume after a crash.
//!
//! [`plan`] ties these together: it builds targets, wires the shared
//! barriers, spawns everything, and joins it all at teardown.
//!
//! See the `features` module below for what `default-features = false`
//! changes.

pub mod barrier;
pub mod buffer;
pub mod clock;
pub mod error;
pub mod gates;
pub mod net;
pub mod plan;
pub mod raw;
pub mod restart;
pub mod seek;
pub mod target;
pub mod worker;

#[cfg(feature = "config")]
pub mod config;

/// Cargo feature documentation.
///
/// - `config` (off by default): derives `serde::{Serialize, Deserialize}`
///   for the plain configuration DTOs in [`crate::config`] and enables
///   `PlanConfig::from_toml_str`. Disabled by default because most
///   embedders build a [`plan::Plan`] programmatically.
pub mod features {}

pub use error::{Error, OpOutcome, Result};
pub use plan::{Plan, PlanBuilder, PlanCoordinator, PlanOutcome};
