// SPDX-License-Identifier: AGPL-3.0-only

//! Per-version hardware limits and feature sets.
//!
//! ```text
//! Version        layers  CEs  input buffer  notable features
//! GMM                 1    1      12 KiB    legacy GMM only
//! 1.0              1023    1      12 KiB    affine, diagonal, RNN, CNN-1D, copy, transpose, legacy GMM
//! 2.0              4096    1      12 KiB    + multi-bias affine, GMM layer
//! 3.0 / 3.5        4096   16      24 KiB    + CNN-2D, pooling-2D, no legacy GMM
//! 1.0 embedded     1023    1       6 KiB    as 1.0
//! 3.x embedded     4096    8      12 KiB    as 3.0 / 3.5
//! ```

use crate::version::DeviceVersion;

/// Hardware feature flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Feature {
    /// Stand-alone Gaussian mixture scoring mode.
    LegacyGmm = 1 << 0,
    /// Fully connected affine.
    Affine = 1 << 1,
    /// Element-wise (diagonal) affine.
    AffineDiagonal = 1 << 2,
    /// Affine with a selectable bias vector.
    AffineMultiBias = 1 << 3,
    /// Recurrent affine with output feedback.
    Recurrent = 1 << 4,
    /// One-dimensional convolution with fused pooling.
    Convolution1D = 1 << 5,
    /// Two-dimensional fused convolution.
    Convolution2D = 1 << 6,
    /// Two-dimensional pooling.
    Pooling2D = 1 << 7,
    /// Copy of a sub-matrix.
    Copy = 1 << 8,
    /// Interleave / deinterleave.
    Transpose = 1 << 9,
    /// GMM scoring as a layer of the neural-network descriptor list.
    GmmLayer = 1 << 10,
    /// Active-list output selection.
    ActiveList = 1 << 11,
}

/// Set of [`Feature`] flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureSet(u32);

impl FeatureSet {
    /// Empty set.
    pub const EMPTY: Self = Self(0);

    /// Build a set from a slice of features.
    pub const fn of(features: &[Feature]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < features.len() {
            bits |= features[i] as u32;
            i += 1;
        }
        Self(bits)
    }

    /// Union of two sets.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Set difference.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Membership test.
    pub const fn contains(self, feature: Feature) -> bool {
        self.0 & feature as u32 != 0
    }

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }
}

const GMM_FEATURES: FeatureSet = FeatureSet::of(&[Feature::LegacyGmm]);

const GNA1_FEATURES: FeatureSet = FeatureSet::of(&[
    Feature::LegacyGmm,
    Feature::Affine,
    Feature::AffineDiagonal,
    Feature::Recurrent,
    Feature::Convolution1D,
    Feature::Copy,
    Feature::Transpose,
    Feature::ActiveList,
]);

const GNA2_FEATURES: FeatureSet =
    GNA1_FEATURES.with(FeatureSet::of(&[Feature::AffineMultiBias, Feature::GmmLayer]));

const GNA3_FEATURES: FeatureSet = GNA2_FEATURES
    .with(FeatureSet::of(&[Feature::Convolution2D, Feature::Pooling2D]))
    .without(FeatureSet::of(&[Feature::LegacyGmm]));

/// Maximum descriptors per submission on first-generation parts.
pub const MAX_LAYERS_GEN1: u32 = 1023;

/// Maximum descriptors per submission on later parts.
pub const MAX_LAYERS: u32 = 4096;

/// Largest input grouping (vectors scored together).
pub const MAX_GROUPING: u32 = 8;

/// Element granule of the input buffer per compute engine.
pub const BUFFER_GRANULE: u32 = 8;

/// Static limits of one device version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationLimits {
    /// Maximum number of layers in one hardware submission.
    pub max_layer_count: u32,
    /// Number of compute engines.
    pub compute_engine_count: u32,
    /// Input buffer size in bytes.
    pub input_buffer_size: u32,
    /// Supported hardware features.
    pub features: FeatureSet,
}

impl GenerationLimits {
    /// Limits table lookup.
    pub const fn of(version: DeviceVersion) -> Self {
        match version {
            DeviceVersion::Gmm => Self::new(1, 1, 12 * 1024, GMM_FEATURES),
            DeviceVersion::Gna1_0 => Self::new(MAX_LAYERS_GEN1, 1, 12 * 1024, GNA1_FEATURES),
            DeviceVersion::Embedded1_0 => Self::new(MAX_LAYERS_GEN1, 1, 6 * 1024, GNA1_FEATURES),
            DeviceVersion::Gna2_0 => Self::new(MAX_LAYERS, 1, 12 * 1024, GNA2_FEATURES),
            DeviceVersion::Gna3_0 | DeviceVersion::Gna3_5 => {
                Self::new(MAX_LAYERS, 16, 24 * 1024, GNA3_FEATURES)
            }
            DeviceVersion::Embedded3_0
            | DeviceVersion::Embedded3_1
            | DeviceVersion::Embedded3_5 => Self::new(MAX_LAYERS, 8, 12 * 1024, GNA3_FEATURES),
        }
    }

    const fn new(
        max_layer_count: u32,
        compute_engine_count: u32,
        input_buffer_size: u32,
        features: FeatureSet,
    ) -> Self {
        Self {
            max_layer_count,
            compute_engine_count,
            input_buffer_size,
            features,
        }
    }

    /// Number of input elements the hardware holds at once for a grouping
    /// (1..=8) and input precision in bytes (1 or 2).
    ///
    /// Returns 0 for a grouping or precision outside the table.
    pub const fn buffer_elements(&self, grouping: u32, precision: u32) -> u32 {
        if grouping == 0 || grouping > MAX_GROUPING || !(precision == 1 || precision == 2) {
            return 0;
        }
        let step = BUFFER_GRANULE * self.compute_engine_count;
        let raw = self.input_buffer_size / precision / grouping;
        raw - raw % step
    }
}
