#![deny(unsafe_code)]

//! Shared test utilities for the rigd workspace.
//!
//! Provides scripted mock hardware, a discovery probe whose report tests can
//! change mid-run, and a fully wired orchestration fixture so integration
//! tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! rigd-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod probe;
pub mod rig;
pub mod tracing_setup;
pub mod transport;

pub use probe::ScriptedProbe;
pub use rig::TestRig;
pub use transport::{MockHub, MockTransportHandle};
