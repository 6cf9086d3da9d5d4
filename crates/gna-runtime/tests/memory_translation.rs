// SPDX-License-Identifier: AGPL-3.0-only

//! Memory container offsets and MMU buffer translation

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use gna_chip::{DeviceVersion, PAGE_SIZE};
use gna_runtime::address::BufferOffset;
use gna_runtime::{CompiledModel, DriverInterface, EmulatedDriver, GnaError, HardwareCapabilities, Memory, MemoryContainer};

#[test]
fn test_offsets_of_second_allocation() {
    let mut container = MemoryContainer::new();
    let first = Memory::allocate(100).expect("allocation");
    let second = Memory::allocate(50).expect("allocation");
    assert!(container.append(Arc::clone(&first)).expect("append"));
    assert!(container.append(Arc::clone(&second)).expect("append"));

    let buffer = second.address() + 10;
    assert_eq!(container.offset_of(buffer, 1), Some(110));
    assert_eq!(container.offset_of(buffer, PAGE_SIZE), Some(PAGE_SIZE + 10));
    // The first allocation starts at a real offset of zero.
    assert_eq!(container.offset_of(first.address(), 1), Some(0));
    assert_eq!(container.offset_of(Memory::allocate(8).expect("allocation").address(), 1), None);
}

#[test]
fn test_cumulative_offsets_are_monotonic() {
    let sizes = [100u32, 50, 4096, 1, 8000];
    let mut container = MemoryContainer::new();
    for size in sizes {
        container.append(Memory::allocate(size).expect("allocation")).expect("append");
    }
    let mut unaligned = 0;
    let mut aligned = 0;
    for (entry, size) in container.entries().iter().zip(sizes) {
        assert_eq!(entry.offset(), unaligned);
        assert_eq!(entry.offset_aligned(), aligned);
        unaligned += size;
        aligned += size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
    }
    assert_eq!(container.total_size(), unaligned);
    assert_eq!(container.total_size_aligned(), aligned);
}

#[test]
fn test_appending_twice_keeps_one_entry() {
    let mut container = MemoryContainer::new();
    let memory = Memory::allocate(64).expect("allocation");
    assert!(container.append(Arc::clone(&memory)).expect("append"));
    assert!(!container.append(memory).expect("append"));
    assert_eq!(container.len(), 1);
}

#[test]
fn test_mmu_translation_is_injective() {
    common::init_tracing();
    let mut memory = MemoryContainer::new();
    let (model, buffers) = common::affine_model(|size| {
        let m = Memory::allocate(size).expect("allocation");
        memory.append(Arc::clone(&m)).expect("append");
        m
    });
    let compiled = CompiledModel::hybrid(
        0,
        &model,
        memory,
        Arc::new(EmulatedDriver::new(DeviceVersion::Gna2_0)) as Arc<dyn DriverInterface>,
        HardwareCapabilities::for_version(DeviceVersion::Gna2_0),
        &mut |size| Memory::allocate(size),
    )
    .expect("compiles");
    let hardware = compiled.hardware().expect("affine runs on 2.0");

    let mut addresses = Vec::new();
    for m in [&buffers.input, &buffers.output, &buffers.weights, &buffers.bias] {
        addresses.extend([m.address(), m.address() + 16, m.address() + 48]);
    }
    let mut seen = HashSet::new();
    for address in addresses {
        let offset = match hardware.translate(address, None).expect("translates") {
            BufferOffset::Device(offset) => offset,
            other => panic!("unexpected {other:?}"),
        };
        assert_ne!(offset, 0);
        assert!(seen.insert(offset), "0x{address:X} collides at {offset}");
    }

    // Descriptor memory occupies offset zero.
    assert!(matches!(
        hardware.translate(hardware.descriptor_memory().address(), None),
        Err(GnaError::MemoryBufferInvalid { .. })
    ));
    let request = Memory::allocate(64).expect("allocation");
    let mut request_memory = MemoryContainer::new();
    request_memory.append(Arc::clone(&request)).expect("append");
    let offset = hardware
        .translate(request.address(), Some(&request_memory))
        .expect("request memory translates");
    assert_eq!(offset.value(), hardware.model_memory().total_size_aligned());
}
