//! Shared fixtures for allocator integration tests
//!
//! Everything runs against [`SimulatedDevice`](rocmcache::SimulatedDevice),
//! so no GPU is needed. Tests that touch the process-wide registry must be
//! marked `#[serial]`.

#![allow(dead_code)]

mod fixtures;
mod tempfile_helpers;

pub use fixtures::*;
pub use serial_test::serial;
pub use tempfile_helpers::*;
