// SPDX-License-Identifier: AGPL-3.0-only

//! Partitioning of a model into hardware and software runs

use std::ops::Range;

use crate::capabilities::HardwareCapabilities;
use crate::layer::Layer;

/// Where a run of layers executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubModelKind {
    /// CPU kernels
    Software,
    /// Neural-network descriptor list
    HardwareNative,
    /// Stand-alone GMM mode, one layer per submission
    HardwareLegacy,
}

impl SubModelKind {
    /// True for the two hardware kinds
    pub fn is_hardware(self) -> bool {
        !matches!(self, Self::Software)
    }
}

/// Contiguous layer range with one execution kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubModel {
    /// Execution kind
    pub kind: SubModelKind,
    /// First layer
    pub layer_index: u32,
    /// Number of layers
    pub layer_count: u32,
}

impl SubModel {
    /// Layer indices covered
    pub fn range(&self) -> Range<u32> {
        self.layer_index..self.layer_index + self.layer_count
    }

    /// Part of the sub-model inside `range`, if any
    pub fn intersect(&self, range: &Range<u32>) -> Option<Range<u32>> {
        let start = self.layer_index.max(range.start);
        let end = (self.layer_index + self.layer_count).min(range.end);
        (start < end).then_some(start..end)
    }
}

/// Split `layers` into runs for `capabilities`
///
/// A run ends when the execution kind changes, before every legacy GMM
/// layer, and when a native run reaches the per-submission layer limit.
pub fn partition(layers: &[Layer], capabilities: &HardwareCapabilities) -> Vec<SubModel> {
    let limit = capabilities.max_layer_count();
    let mut submodels: Vec<SubModel> = Vec::new();
    for layer in layers {
        let kind = capabilities.classify(layer);
        match submodels.last_mut() {
            Some(current)
                if current.kind == kind
                    && kind != SubModelKind::HardwareLegacy
                    && !(kind == SubModelKind::HardwareNative && current.layer_count >= limit) =>
            {
                current.layer_count += 1;
            }
            _ => submodels.push(SubModel {
                kind,
                layer_index: layer.index(),
                layer_count: 1,
            }),
        }
    }
    tracing::debug!(
        "Partitioned {} layers into {} sub-models for {}",
        layers.len(),
        submodels.len(),
        capabilities.version()
    );
    submodels
}

/// True when no run executes in software
pub fn is_fully_hardware_compatible(submodels: &[SubModel]) -> bool {
    !submodels.is_empty() && submodels.iter().all(|s| s.kind.is_hardware())
}

/// True when at least one run executes on the device
pub fn has_hardware_layers(submodels: &[SubModel]) -> bool {
    submodels.iter().any(|s| s.kind.is_hardware())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gna_chip::DeviceVersion;
    use gna_model::{DataType, Operation, Tensor};

    fn affine(index: u32, input: DataType) -> Layer {
        let op = Operation::fully_connected_affine(
            Tensor::new(&[1, 16], input),
            Tensor::new(&[1, 8], DataType::Int32),
            Tensor::new(&[8, 16], DataType::Int16),
            Tensor::new(&[8], DataType::Int32),
        );
        Layer::from_operation(index, &op).unwrap()
    }

    fn gmm(index: u32) -> Layer {
        let op = Operation::gmm(
            Tensor::new(&[1, 8], DataType::Uint8),
            Tensor::new(&[1, 2], DataType::Uint32),
            Tensor::new(&[2, 1, 8], DataType::Uint8),
            Tensor::new(&[2, 1, 8], DataType::Uint8),
            Tensor::new(&[2, 1], DataType::Uint32),
            100,
        );
        Layer::from_operation(index, &op).unwrap()
    }

    fn assert_cover(submodels: &[SubModel], count: u32) {
        let mut next = 0;
        for s in submodels {
            assert_eq!(s.layer_index, next, "gap or overlap at {next}");
            assert!(s.layer_count > 0);
            next += s.layer_count;
        }
        assert_eq!(next, count);
    }

    #[test]
    fn test_kind_change_splits_native_runs() {
        let caps = HardwareCapabilities::for_version(DeviceVersion::Gna2_0);
        let layers = [
            affine(0, DataType::Int16),
            affine(1, DataType::Int8),
            affine(2, DataType::Int16),
        ];
        let parts = partition(&layers, &caps);
        assert_eq!(
            parts,
            vec![
                SubModel { kind: SubModelKind::HardwareNative, layer_index: 0, layer_count: 1 },
                SubModel { kind: SubModelKind::Software, layer_index: 1, layer_count: 1 },
                SubModel { kind: SubModelKind::HardwareNative, layer_index: 2, layer_count: 1 },
            ]
        );
        assert!(!is_fully_hardware_compatible(&parts));
        assert!(has_hardware_layers(&parts));
    }

    #[test]
    fn test_legacy_gmm_runs_are_singletons() {
        let caps = HardwareCapabilities::for_version(DeviceVersion::Gna1_0);
        let layers: Vec<_> = (0..4).map(gmm).collect();
        let parts = partition(&layers, &caps);
        assert_eq!(parts.len(), 4);
        assert!(parts
            .iter()
            .all(|s| s.kind == SubModelKind::HardwareLegacy && s.layer_count == 1));
        assert!(is_fully_hardware_compatible(&parts));
    }

    #[test]
    fn test_native_runs_respect_layer_limit() {
        let caps = HardwareCapabilities::for_version(DeviceVersion::Gna1_0);
        let count = caps.max_layer_count() * 2 + 5;
        let layers: Vec<_> = (0..count).map(|i| affine(i, DataType::Int16)).collect();
        let parts = partition(&layers, &caps);
        assert_cover(&parts, count);
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|s| s.layer_count <= caps.max_layer_count()));
    }

    #[test]
    fn test_cover_on_every_version() {
        let layers = vec![
            affine(0, DataType::Int16),
            gmm(1),
            gmm(2),
            affine(3, DataType::Int8),
            affine(4, DataType::Int16),
            affine(5, DataType::Int16),
        ];
        for version in DeviceVersion::ALL {
            let caps = HardwareCapabilities::for_version(version);
            let parts = partition(&layers, &caps);
            assert_cover(&parts, 6);
            for s in &parts {
                if s.kind == SubModelKind::HardwareLegacy {
                    assert_eq!(s.layer_count, 1);
                }
            }
        }
    }

    #[test]
    fn test_all_software() {
        let caps = HardwareCapabilities::for_version(DeviceVersion::Gmm);
        let parts = partition(&[affine(0, DataType::Int16)], &caps);
        assert!(!has_hardware_layers(&parts));
        assert!(!is_fully_hardware_compatible(&parts));
    }

    #[test]
    fn test_intersect() {
        let s = SubModel { kind: SubModelKind::Software, layer_index: 2, layer_count: 3 };
        assert_eq!(s.intersect(&(0..3)), Some(2..3));
        assert_eq!(s.intersect(&(5..9)), None);
        assert_eq!(s.range(), 2..5);
    }
}
