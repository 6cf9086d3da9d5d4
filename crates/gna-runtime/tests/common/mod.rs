// SPDX-License-Identifier: AGPL-3.0-only

//! Shared fixtures for the runtime integration tests

#![allow(dead_code)]

use std::sync::Arc;

use gna_chip::DeviceVersion;
use gna_model::{DataType, Model, Operation, Tensor};
use gna_runtime::kernels::MemoryView;
use gna_runtime::{Device, DriverInterface, EmulatedDriver, Memory, MemoryContainer, RuntimeConfig};
use tracing_subscriber::EnvFilter;

/// Route runtime logs to the test output; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Device 0 backed by an emulated driver of `version`
pub fn emulated_device(version: DeviceVersion) -> (Arc<EmulatedDriver>, Device) {
    init_tracing();
    let driver = Arc::new(EmulatedDriver::new(version));
    let device = Device::open(
        0,
        Some(Arc::clone(&driver) as Arc<dyn DriverInterface>),
        RuntimeConfig::default(),
    )
    .expect("emulated device opens");
    (driver, device)
}

/// Buffers of an affine layer
pub struct AffineBuffers {
    pub input: Arc<Memory>,
    pub output: Arc<Memory>,
    pub weights: Arc<Memory>,
    pub bias: Arc<Memory>,
}

/// Affine 4 -> 2 with unit weights, bias 1 and input `[1, 2, 3, 4]`; scores
/// to `[11, 11]`
pub fn affine_model(mut allocate: impl FnMut(u32) -> Arc<Memory>) -> (Model, AffineBuffers) {
    let buffers = AffineBuffers {
        input: allocate(64),
        output: allocate(64),
        weights: allocate(64),
        bias: allocate(64),
    };
    let model = Model::new(vec![Operation::fully_connected_affine(
        Tensor::new(&[1, 4], DataType::Int16).with_data(buffers.input.address()),
        Tensor::new(&[1, 2], DataType::Int32).with_data(buffers.output.address()),
        Tensor::new(&[2, 4], DataType::Int16).with_data(buffers.weights.address()),
        Tensor::new(&[2], DataType::Int32).with_data(buffers.bias.address()),
    )])
    .expect("valid affine model");

    let mut container = MemoryContainer::new();
    for m in [&buffers.input, &buffers.output, &buffers.weights, &buffers.bias] {
        container.append(Arc::clone(m)).expect("append");
    }
    let view = MemoryView::new(&container, None);
    view.write_ints(buffers.input.address(), DataType::Int16, &[1, 2, 3, 4])
        .expect("input");
    view.write_ints(buffers.weights.address(), DataType::Int16, &[1; 8])
        .expect("weights");
    view.write_ints(buffers.bias.address(), DataType::Int32, &[1, 1])
        .expect("bias");
    (model, buffers)
}

/// Two 32-bit outputs of an affine layer
pub fn read_output(memory: &Arc<Memory>) -> Vec<i64> {
    let mut container = MemoryContainer::new();
    container.append(Arc::clone(memory)).expect("append");
    MemoryView::new(&container, None)
        .read_ints(memory.address(), DataType::Int32, 2)
        .expect("output")
}
