// SPDX-License-Identifier: AGPL-3.0-only

//! Silicon model for the GNA accelerator family.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the silicon: device versions, per-generation limits and
//! feature sets, layer descriptor layouts, operation codes, bar tables for
//! MMU-less parts, hardware status bits and the legacy export header.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`version`] | Device version codes and their descriptor generation |
//! | [`limits`] | Max layers, compute engines, input buffer sizing, feature sets |
//! | [`descriptor`] | 128-byte layer / GMM descriptor field tables, op codes |
//! | [`bar`] | Memory tags and the tag → bar table of MMU-less targets |
//! | [`status`] | Hardware status register bits and fault decoding |
//! | [`export`] | 64-byte legacy single-shot export header layout |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bar;
pub mod descriptor;
pub mod export;
pub mod limits;
pub mod status;
pub mod version;

pub use bar::MemoryTag;
pub use descriptor::{Field, FieldLayout, GmmField, NnOp};
pub use limits::{Feature, FeatureSet, GenerationLimits};
pub use status::HardwareFault;
pub use version::{DeviceVersion, Generation};

/// Page size used by the device MMU.
pub const PAGE_SIZE: u32 = 4096;

/// Required alignment of every buffer referenced by a descriptor.
pub const BUFFER_ALIGNMENT: u32 = 64;
