// SPDX-License-Identifier: AGPL-3.0-only

//! Driver implementations
//!
//! - **Emulated**: in-memory device that records submissions instead of
//!   executing them (CI, integration tests, development without hardware)
//!
//! OS drivers implement [`crate::driver::DriverInterface`] outside this crate.

pub mod emulated;

pub use emulated::{EmulatedDriver, Submission};
