// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end scoring through devices backed by the emulated driver

mod common;

use std::sync::Arc;
use std::time::Duration;

use gna_chip::{status, DeviceVersion, MemoryTag};
use gna_model::OperandKind;
use gna_runtime::hardware_request::{HardwareRequest, OperationMode};
use gna_runtime::{
    AccelerationMode, DeviceRegistry, DriverError, GnaError, InstrumentationPoint, InstrumentationUnit,
    ProfilerConfiguration, RequestConfiguration, RequestStatus, RuntimeConfig,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn completed(status: RequestStatus) -> gna_runtime::ScoreReport {
    match status {
        RequestStatus::Completed(report) => report,
        RequestStatus::Busy => panic!("request did not complete in {TIMEOUT:?}"),
    }
}

#[test]
fn test_contention_without_fallback_is_returned() {
    let (driver, device) = common::emulated_device(DeviceVersion::Gna3_0);
    let (model, buffers) = common::affine_model(|size| device.allocate_memory(size).expect("allocation"));
    let config = device.create_config(device.create_model(&model).expect("model")).expect("config");

    driver.fail_next(DriverError::QueueContention);
    let request = device.enqueue(config).expect("enqueue");
    assert!(matches!(device.wait(request, TIMEOUT), Err(GnaError::QueueContention)));
    // Nothing was scored.
    assert_eq!(common::read_output(&buffers.output), vec![0, 0]);
}

#[test]
fn test_contention_with_fallback_scores_in_software() {
    let (driver, device) = common::emulated_device(DeviceVersion::Gna3_0);
    let (model, buffers) = common::affine_model(|size| device.allocate_memory(size).expect("allocation"));
    let config = device.create_config(device.create_model(&model).expect("model")).expect("config");
    device.set_software_fallback(config, true).expect("fallback");

    driver.fail_next(DriverError::QueueContention);
    let request = device.enqueue(config).expect("enqueue");
    let report = completed(device.wait(request, TIMEOUT).expect("fallback hides contention"));
    assert_eq!(report.saturation_count, 0);
    assert_eq!(common::read_output(&buffers.output), vec![11, 11]);
    assert!(driver.submissions().is_empty());
}

#[test]
fn test_hardware_fault_is_fatal() {
    let (driver, device) = common::emulated_device(DeviceVersion::Gna2_0);
    let (model, _) = common::affine_model(|size| device.allocate_memory(size).expect("allocation"));
    let config = device.create_config(device.create_model(&model).expect("model")).expect("config");
    device.set_software_fallback(config, true).expect("fallback");

    driver.set_status(status::COMPLETED | status::MMU_REQUEST_ERROR);
    let request = device.enqueue(config).expect("enqueue");
    assert!(matches!(device.wait(request, TIMEOUT), Err(GnaError::Hardware { .. })));
}

#[test]
fn test_software_acceleration_bypasses_driver() {
    let (driver, device) = common::emulated_device(DeviceVersion::Gna2_0);
    let (model, buffers) = common::affine_model(|size| device.allocate_memory(size).expect("allocation"));
    let config = device.create_config(device.create_model(&model).expect("model")).expect("config");
    device.set_acceleration(config, AccelerationMode::Software).expect("mode");
    device
        .set_profiler(
            config,
            ProfilerConfiguration::new(
                [InstrumentationPoint::LibPreprocessing, InstrumentationPoint::LibCompletion],
                InstrumentationUnit::Microseconds,
            ),
        )
        .expect("profiler");

    let request = device.enqueue(config).expect("enqueue");
    let report = completed(device.wait(request, TIMEOUT).expect("scores"));
    assert_eq!(common::read_output(&buffers.output), vec![11, 11]);
    assert!(report.profile.get(InstrumentationPoint::LibCompletion).is_some());
    assert!(driver.submissions().is_empty());
}

#[test]
fn test_rebinding_output_repatches_descriptors() {
    let (driver, device) = common::emulated_device(DeviceVersion::Gna3_0);
    let (model, _) = common::affine_model(|size| device.allocate_memory(size).expect("allocation"));
    let model_id = device.create_model(&model).expect("model");
    let config = device.create_config(model_id).expect("config");

    let request = device.enqueue(config).expect("enqueue");
    completed(device.wait(request, TIMEOUT).expect("scores"));
    let alternate = device.allocate_memory(64).expect("allocation");
    device
        .bind_buffer(config, 0, OperandKind::Output, alternate.address())
        .expect("bind");
    let request = device.enqueue(config).expect("enqueue");
    completed(device.wait(request, TIMEOUT).expect("scores"));

    let submissions = driver.submissions();
    assert_eq!(submissions.len(), 2);
    assert_ne!(submissions[0].descriptors, submissions[1].descriptors);
    assert_eq!(device.model(model_id).expect("model").cached_requests(), 1);
}

#[test]
fn test_request_patches_are_stable() {
    let (_, device) = common::emulated_device(DeviceVersion::Gna3_0);
    let (model, buffers) = common::affine_model(|size| device.allocate_memory(size).expect("allocation"));
    let compiled = device.model(device.create_model(&model).expect("model")).expect("model");
    let hardware = compiled.hardware().expect("hardware model");
    let layer = compiled.software().layer(0).expect("layer");

    let input = device.allocate_memory(64).expect("allocation");
    let mut config = RequestConfiguration::new(0, compiled.id());
    config
        .set_buffer(layer, OperandKind::Input, input.address(), Arc::clone(&input))
        .expect("bind");
    config
        .set_active_list(layer, buffers.bias.address(), 1, Arc::clone(&buffers.bias))
        .expect("active list");

    let mut request = HardwareRequest::new(hardware, &config).expect("request");
    let before = request.patches().to_vec();
    assert!(!before.is_empty());
    request.update(hardware, 0, 1, OperationMode::Neural).expect("update");
    request.invalidate(hardware, &config).expect("invalidate");
    assert_eq!(request.patches(), &before[..]);
}

#[test]
fn test_registry_shares_devices() {
    common::init_tracing();
    let registry = DeviceRegistry::new(RuntimeConfig::default(), None);
    let device = registry.open(0).expect("software device");
    let (model, buffers) = common::affine_model(|size| device.allocate_memory(size).expect("allocation"));
    let config = device.create_config(device.create_model(&model).expect("model")).expect("config");

    let same = registry.open(0).expect("second reference");
    let request = same.enqueue(config).expect("enqueue");
    completed(device.wait(request, TIMEOUT).expect("scores"));
    assert_eq!(common::read_output(&buffers.output), vec![11, 11]);

    registry.close(0).expect("close");
    registry.close(0).expect("close");
    assert!(registry.get(0).is_err());
}

#[test]
fn test_mmu_less_export_through_device() {
    common::init_tracing();
    let registry = DeviceRegistry::new(RuntimeConfig::default(), None);
    let device = registry.open(0).expect("software device");
    let (model, buffers) = common::affine_model(|size| device.allocate_memory(size).expect("allocation"));
    device.tag_memory(buffers.input.address(), MemoryTag::ExternalInput).expect("tag");
    device.tag_memory(buffers.output.address(), MemoryTag::ExternalOutput).expect("tag");
    device.tag_memory(buffers.weights.address(), MemoryTag::ReadOnly).expect("tag");
    device.tag_memory(buffers.bias.address(), MemoryTag::ReadOnly).expect("tag");

    let model_id = device
        .create_export_model(&model, DeviceVersion::Embedded3_5)
        .expect("export model");
    let export = device
        .export_mmu_less(model_id, DeviceVersion::Embedded3_5)
        .expect("exports");
    assert_eq!(export.externals.len(), 2);
    assert_eq!(export.read_only.len(), 128);

    // Export models still score, with the target's numerics.
    let config = device.create_config(model_id).expect("config");
    let request = device.enqueue(config).expect("enqueue");
    completed(device.wait(request, TIMEOUT).expect("scores"));
    assert_eq!(common::read_output(&buffers.output), vec![11, 11]);
}
