// SPDX-License-Identifier: AGPL-3.0-only

//! Legacy single-shot export header.
//!
//! A 64-byte little-endian record that precedes the flat model image loaded
//! by first-generation embedded parts.
//!
//! ```text
//! 0x00 descriptor base offset      0x14 output element size
//! 0x04 total exported size         0x18 input element count
//! 0x08 operation mode              0x1C output element count
//! 0x0C layer count                 0x20 input descriptor offset
//! 0x10 input element size          0x24 output descriptor offset
//!                                  0x28..0x40 reserved, zero
//! ```

/// Header size in bytes.
pub const HEADER_SIZE: usize = 64;

/// Descriptor base offset.
pub const DESCRIPTOR_BASE: usize = 0x00;
/// Total exported size in bytes.
pub const MODEL_SIZE: usize = 0x04;
/// Operation mode, see [`OPERATION_MODE_NN`] / [`OPERATION_MODE_GMM`].
pub const OPERATION_MODE: usize = 0x08;
/// Number of layers.
pub const LAYER_COUNT: usize = 0x0C;
/// Bytes per input element.
pub const INPUT_ELEMENT_SIZE: usize = 0x10;
/// Bytes per output element.
pub const OUTPUT_ELEMENT_SIZE: usize = 0x14;
/// Input element count.
pub const INPUT_ELEMENT_COUNT: usize = 0x18;
/// Output element count.
pub const OUTPUT_ELEMENT_COUNT: usize = 0x1C;
/// Offset of the first layer's input buffer field.
pub const INPUT_DESCRIPTOR_OFFSET: usize = 0x20;
/// Offset of the last layer's output buffer field.
pub const OUTPUT_DESCRIPTOR_OFFSET: usize = 0x24;
/// First reserved byte.
pub const RESERVED: usize = 0x28;

/// Neural-network descriptor list.
pub const OPERATION_MODE_NN: u32 = 0;
/// Stand-alone GMM scoring.
pub const OPERATION_MODE_GMM: u32 = 1;
