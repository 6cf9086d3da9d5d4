// SPDX-License-Identifier: AGPL-3.0-only

//! Sub-model partitioning across device generations

mod common;

use std::cell::Cell;
use std::sync::Arc;

use gna_chip::DeviceVersion;
use gna_model::{DataType, Model, Operation, Tensor};
use gna_runtime::software_model::SoftwareModel;
use gna_runtime::submodel::{is_fully_hardware_compatible, partition};
use gna_runtime::{
    CompiledModel, DriverInterface, EmulatedDriver, HardwareCapabilities, Memory, MemoryContainer, SubModelKind,
};

fn affine(input: DataType) -> Operation {
    Operation::fully_connected_affine(
        Tensor::new(&[1, 16], input),
        Tensor::new(&[1, 8], DataType::Int32),
        Tensor::new(&[8, 16], DataType::Int16),
        Tensor::new(&[8], DataType::Int32),
    )
}

fn gmm() -> Operation {
    Operation::gmm(
        Tensor::new(&[1, 24], DataType::Uint8),
        Tensor::new(&[1, 4], DataType::Uint32),
        Tensor::new(&[4, 2, 24], DataType::Uint8),
        Tensor::new(&[4, 2, 24], DataType::Uint8),
        Tensor::new(&[4, 2], DataType::Uint32),
        1000,
    )
}

fn copy() -> Operation {
    Operation::copy(
        Tensor::new(&[1, 16], DataType::Int16),
        Tensor::new(&[1, 16], DataType::Int16),
        1,
        16,
    )
}

fn mixed_model() -> SoftwareModel {
    let operations = vec![
        affine(DataType::Int16),
        gmm(),
        gmm(),
        affine(DataType::Int8),
        copy(),
        affine(DataType::Int16),
        gmm(),
        copy(),
    ];
    SoftwareModel::new(&Model::new(operations).expect("valid model")).expect("layers")
}

#[test]
fn test_partition_covers_every_layer_on_every_generation() {
    let model = mixed_model();
    for version in DeviceVersion::ALL {
        let caps = HardwareCapabilities::for_version(version);
        let submodels = partition(model.layers(), &caps);
        let mut next = 0;
        for s in &submodels {
            assert_eq!(s.layer_index, next, "{version}: gap or overlap at {next}");
            assert!(s.layer_count > 0);
            if s.kind == SubModelKind::HardwareLegacy {
                assert_eq!(s.layer_count, 1, "{version}: legacy GMM run");
            }
            if s.kind == SubModelKind::HardwareNative {
                assert!(s.layer_count <= caps.max_layer_count());
            }
            next += s.layer_count;
        }
        assert_eq!(next, model.layer_count(), "{version}: cover ends early");
    }
}

#[test]
fn test_native_runs_respect_layer_limit() {
    let operations = (0..1030).map(|_| copy()).collect();
    let model = SoftwareModel::new(&Model::new(operations).expect("valid model")).expect("layers");
    let caps = HardwareCapabilities::for_version(DeviceVersion::Gna1_0);
    let submodels = partition(model.layers(), &caps);
    assert_eq!(submodels.len(), 2);
    assert_eq!(submodels[0].layer_count, caps.max_layer_count());
    assert_eq!(submodels[1].layer_count, 1030 - caps.max_layer_count());
}

#[test]
fn test_kind_change_splits_native_runs() {
    let model = Model::new(vec![
        affine(DataType::Int16),
        affine(DataType::Int8),
        affine(DataType::Int16),
    ])
    .expect("valid model");
    let software = SoftwareModel::new(&model).expect("layers");
    let submodels = partition(
        software.layers(),
        &HardwareCapabilities::for_version(DeviceVersion::Gna2_0),
    );
    let shape: Vec<_> = submodels.iter().map(|s| (s.kind, s.range())).collect();
    assert_eq!(
        shape,
        vec![
            (SubModelKind::HardwareNative, 0..1),
            (SubModelKind::Software, 1..2),
            (SubModelKind::HardwareNative, 2..3),
        ]
    );
}

#[test]
fn test_all_software_model_skips_hardware_build() {
    common::init_tracing();
    let mut memory = MemoryContainer::new();
    let (model, _) = common::affine_model(|size| {
        let m = Memory::allocate(size).expect("allocation");
        memory.append(Arc::clone(&m)).expect("append");
        m
    });
    let allocations = Cell::new(0);
    // The GMM-only device runs no affine layer.
    let compiled = CompiledModel::hybrid(
        0,
        &model,
        memory,
        Arc::new(EmulatedDriver::new(DeviceVersion::Gmm)) as Arc<dyn DriverInterface>,
        HardwareCapabilities::for_version(DeviceVersion::Gmm),
        &mut |size| {
            allocations.set(allocations.get() + 1);
            Memory::allocate(size)
        },
    )
    .expect("compiles");
    assert!(!compiled.is_fully_hardware_compatible(DeviceVersion::Gmm));
    assert!(!is_fully_hardware_compatible(&compiled.submodels(DeviceVersion::Gmm)));
    assert!(compiled.hardware().is_none());
    assert_eq!(allocations.get(), 0);
}
