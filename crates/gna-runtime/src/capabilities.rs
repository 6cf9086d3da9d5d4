// SPDX-License-Identifier: AGPL-3.0-only

//! Hardware capabilities of one device version
//!
//! Everything here is static: limits and feature sets come from the chip
//! tables, and the supported element types per operation family come from
//! the data-configuration tables below. A layer whose operation or element
//! types are missing for the generation runs in software.

use gna_chip::{DeviceVersion, Feature, FeatureSet, Generation, GenerationLimits};
use gna_model::DataType;

use crate::error::{GnaError, Result};
use crate::layer::{DataConfig, Layer, LayerKind};
use crate::submodel::SubModelKind;

/// Capabilities of a device version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareCapabilities {
    version: DeviceVersion,
    limits: GenerationLimits,
}

impl HardwareCapabilities {
    /// Capabilities of a known version
    pub fn for_version(version: DeviceVersion) -> Self {
        Self {
            version,
            limits: GenerationLimits::of(version),
        }
    }

    /// Capabilities of `version` with driver-specific `limits`
    pub fn with_limits(version: DeviceVersion, limits: GenerationLimits) -> Self {
        Self { version, limits }
    }

    /// Capabilities of a raw version code as reported by the driver
    ///
    /// # Errors
    ///
    /// [`GnaError::DeviceVersionInvalid`] for unknown codes.
    pub fn from_raw(raw: u32) -> Result<Self> {
        DeviceVersion::from_raw(raw)
            .map(Self::for_version)
            .ok_or(GnaError::DeviceVersionInvalid { version: raw })
    }

    /// Device version
    pub fn version(&self) -> DeviceVersion {
        self.version
    }

    /// Descriptor generation
    pub fn generation(&self) -> Generation {
        self.version.generation()
    }

    /// True when `self` is `base` or an embedded variant of it
    pub fn is_derived_from(&self, base: DeviceVersion) -> bool {
        self.version.is_derived_from(base)
    }

    /// Maximum layers in one hardware submission
    pub fn max_layer_count(&self) -> u32 {
        self.limits.max_layer_count
    }

    /// Compute engines
    pub fn compute_engine_count(&self) -> u32 {
        self.limits.compute_engine_count
    }

    /// Input elements the hardware holds per iteration, 0 outside the table
    pub fn buffer_elements(&self, grouping: u32, precision: u32) -> u32 {
        self.limits.buffer_elements(grouping, precision)
    }

    /// Supported features
    pub fn features(&self) -> FeatureSet {
        self.limits.features
    }

    /// Feature test
    pub fn has_feature(&self, feature: Feature) -> bool {
        self.limits.features.contains(feature)
    }

    /// True when the generation runs `kind` natively
    pub fn supports_operation(&self, kind: LayerKind) -> bool {
        self.has_feature(operation_feature(kind))
    }

    /// True when the element types of a layer are valid for the generation
    pub fn supports_data_config(&self, kind: LayerKind, config: &DataConfig) -> bool {
        data_rules(self.generation(), kind)
            .iter()
            .any(|rule| rule.matches(config))
    }

    /// Execution kind of a layer on this version
    pub fn classify(&self, layer: &Layer) -> SubModelKind {
        let kind = layer.kind();
        if !self.supports_data_config(kind, &layer.data_config()) {
            SubModelKind::Software
        } else if self.supports_operation(kind) {
            SubModelKind::HardwareNative
        } else if kind == LayerKind::Gmm && self.has_feature(Feature::LegacyGmm) {
            SubModelKind::HardwareLegacy
        } else {
            SubModelKind::Software
        }
    }
}

/// Feature a native operation requires
pub const fn operation_feature(kind: LayerKind) -> Feature {
    match kind {
        LayerKind::Affine => Feature::Affine,
        LayerKind::AffineMultiBias => Feature::AffineMultiBias,
        LayerKind::Diagonal => Feature::AffineDiagonal,
        LayerKind::Recurrent => Feature::Recurrent,
        LayerKind::Convolution1D => Feature::Convolution1D,
        LayerKind::Convolution2D => Feature::Convolution2D,
        LayerKind::Copy => Feature::Copy,
        LayerKind::Interleave | LayerKind::Deinterleave => Feature::Transpose,
        LayerKind::Gmm => Feature::GmmLayer,
    }
}

/// Accepted element types. An empty `weights` or `biases` list means the
/// operand must be absent; `activation: None` accepts both.
struct DataRule {
    inputs: &'static [DataType],
    weights: &'static [DataType],
    biases: &'static [DataType],
    outputs: &'static [DataType],
    activation: Option<bool>,
}

impl DataRule {
    fn matches(&self, config: &DataConfig) -> bool {
        let optional = |allowed: &[DataType], actual: Option<DataType>| match actual {
            Some(t) => allowed.contains(&t),
            None => allowed.is_empty(),
        };
        self.inputs.contains(&config.input)
            && optional(self.weights, config.weights)
            && optional(self.biases, config.bias)
            && self.outputs.contains(&config.output)
            && self.activation.map_or(true, |a| a == config.activation)
    }
}

use DataType::{CompoundBias, Int16, Int32, Int8, Uint32, Uint8};

const AFFINE_GEN1: &[DataRule] = &[
    DataRule {
        inputs: &[Int16],
        weights: &[Int16],
        biases: &[Int32],
        outputs: &[Int16],
        activation: Some(true),
    },
    DataRule {
        inputs: &[Int16],
        weights: &[Int16],
        biases: &[Int32],
        outputs: &[Int32],
        activation: Some(false),
    },
    DataRule {
        inputs: &[Int16],
        weights: &[Int8],
        biases: &[CompoundBias, Int32],
        outputs: &[Int16],
        activation: Some(true),
    },
    DataRule {
        inputs: &[Int16],
        weights: &[Int8],
        biases: &[CompoundBias, Int32],
        outputs: &[Int32],
        activation: Some(false),
    },
];

const AFFINE_GEN3: &[DataRule] = &[
    DataRule {
        inputs: &[Int8, Int16],
        weights: &[Int8, Int16],
        biases: &[Int8, Int16, Int32],
        outputs: &[Int8, Int16, Int32],
        activation: None,
    },
    DataRule {
        inputs: &[Int8, Int16],
        weights: &[Int8],
        biases: &[CompoundBias],
        outputs: &[Int8, Int16, Int32],
        activation: None,
    },
];

const TRANSFER_GEN1: &[DataRule] = &[DataRule {
    inputs: &[Int16],
    weights: &[],
    biases: &[],
    outputs: &[Int16],
    activation: Some(false),
}];

const TRANSFER_GEN3: &[DataRule] = &[DataRule {
    inputs: &[Int8, Int16],
    weights: &[],
    biases: &[],
    outputs: &[Int8, Int16],
    activation: Some(false),
}];

const GMM: &[DataRule] = &[DataRule {
    inputs: &[Uint8],
    weights: &[],
    biases: &[],
    outputs: &[Uint32],
    activation: Some(false),
}];

fn data_rules(generation: Generation, kind: LayerKind) -> &'static [DataRule] {
    match (generation, kind) {
        (_, LayerKind::Gmm) => GMM,
        (Generation::Gmm, _) => &[],
        (Generation::Gen1 | Generation::Gen2, LayerKind::Copy | LayerKind::Interleave | LayerKind::Deinterleave) => {
            TRANSFER_GEN1
        }
        (Generation::Gen3, LayerKind::Copy | LayerKind::Interleave | LayerKind::Deinterleave) => {
            TRANSFER_GEN3
        }
        (Generation::Gen1 | Generation::Gen2, _) => AFFINE_GEN1,
        (Generation::Gen3, _) => AFFINE_GEN3,
    }
}
