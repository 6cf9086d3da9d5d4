// SPDX-License-Identifier: AGPL-3.0-only

//! Device versions as reported by the driver.
//!
//! Embedded parts share the descriptor format and operation set of a desktop
//! base version; see [`DeviceVersion::base`].

use std::fmt;

/// Descriptor format family.
///
/// Generation 1 and 2 share one descriptor layout; generation 2 adds the
/// multi-bias affine and the in-list GMM operation. Generation 3 has its own
/// layout with 2-D convolution fields and precision selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Generation {
    /// GMM-only accelerator, no neural-network descriptors.
    Gmm,
    /// First neural-network generation.
    Gen1,
    /// Second generation, same layout as [`Generation::Gen1`].
    Gen2,
    /// Third generation and its 3.x derivatives.
    Gen3,
}

/// Hardware device version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceVersion {
    /// GMM-only accelerator.
    Gmm,
    /// GNA 1.0.
    Gna1_0,
    /// GNA 2.0.
    Gna2_0,
    /// GNA 3.0.
    Gna3_0,
    /// GNA 3.5.
    Gna3_5,
    /// Embedded 1.0, target of the legacy single-shot export.
    Embedded1_0,
    /// Embedded 3.0.
    Embedded3_0,
    /// Embedded 3.1, autonomous and MMU-less.
    Embedded3_1,
    /// Embedded 3.5, MMU-less.
    Embedded3_5,
}

impl DeviceVersion {
    /// Every known version, in raw-code order.
    pub const ALL: [Self; 9] = [
        Self::Gmm,
        Self::Gna1_0,
        Self::Gna2_0,
        Self::Gna3_0,
        Self::Gna3_5,
        Self::Embedded1_0,
        Self::Embedded3_0,
        Self::Embedded3_1,
        Self::Embedded3_5,
    ];

    /// Raw version code as found in the device identification register.
    pub const fn raw(self) -> u32 {
        match self {
            Self::Gmm => 0x01,
            Self::Gna1_0 => 0x10,
            Self::Gna2_0 => 0x20,
            Self::Gna3_0 => 0x30,
            Self::Gna3_5 => 0x35,
            Self::Embedded1_0 => 0x10E,
            Self::Embedded3_0 => 0x30E,
            Self::Embedded3_1 => 0x31F,
            Self::Embedded3_5 => 0x35E,
        }
    }

    /// Decode a raw version code. Unknown codes yield `None`.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0x01 => Self::Gmm,
            0x10 => Self::Gna1_0,
            0x20 => Self::Gna2_0,
            0x30 => Self::Gna3_0,
            0x35 => Self::Gna3_5,
            0x10E => Self::Embedded1_0,
            0x30E => Self::Embedded3_0,
            0x31F => Self::Embedded3_1,
            0x35E => Self::Embedded3_5,
            _ => return None,
        })
    }

    /// Desktop version this version derives its feature set from.
    pub const fn base(self) -> Self {
        match self {
            Self::Embedded1_0 => Self::Gna1_0,
            Self::Embedded3_0 | Self::Embedded3_1 => Self::Gna3_0,
            Self::Embedded3_5 => Self::Gna3_5,
            other => other,
        }
    }

    /// True when `self` is `base` or one of its derived variants.
    pub fn is_derived_from(self, base: Self) -> bool {
        self.base() == base.base()
    }

    /// Descriptor format family.
    pub const fn generation(self) -> Generation {
        match self.base() {
            Self::Gmm => Generation::Gmm,
            Self::Gna1_0 => Generation::Gen1,
            Self::Gna2_0 => Generation::Gen2,
            _ => Generation::Gen3,
        }
    }

    /// Embedded parts have fewer compute engines and a smaller input buffer.
    pub const fn is_embedded(self) -> bool {
        matches!(
            self,
            Self::Embedded1_0 | Self::Embedded3_0 | Self::Embedded3_1 | Self::Embedded3_5
        )
    }

    /// MMU-less parts address memory through bar-relative offsets.
    pub const fn has_mmu(self) -> bool {
        !matches!(self, Self::Embedded3_1 | Self::Embedded3_5)
    }
}

impl fmt::Display for DeviceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gmm => "GMM",
            Self::Gna1_0 => "GNA 1.0",
            Self::Gna2_0 => "GNA 2.0",
            Self::Gna3_0 => "GNA 3.0",
            Self::Gna3_5 => "GNA 3.5",
            Self::Embedded1_0 => "GNA 1.0 embedded",
            Self::Embedded3_0 => "GNA 3.0 embedded",
            Self::Embedded3_1 => "GNA 3.1 autonomous",
            Self::Embedded3_5 => "GNA 3.5 embedded",
        };
        write!(f, "{name} (0x{:X})", self.raw())
    }
}
