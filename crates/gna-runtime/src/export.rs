// SPDX-License-Identifier: AGPL-3.0-only

//! Model export
//!
//! Two formats are produced from a compiled model:
//!
//! - **MMU-less** (embedded 3.1 / 3.5): descriptors with bar-relative buffer
//!   fields, the packed read-only data window, the sizes of the other
//!   windows and the buffer fields the host relocates.
//! - **Legacy single-shot** (embedded 1.0): one flat image holding
//!   descriptor memory followed by page-aligned copies of every model
//!   allocation, described by a 64-byte header.
//!
//! Both need every layer of the model to run on the target.

use std::sync::Arc;

use gna_chip::export::{self as header, HEADER_SIZE, OPERATION_MODE_GMM, OPERATION_MODE_NN};
use gna_chip::{DeviceVersion, MemoryTag, BUFFER_ALIGNMENT, PAGE_SIZE};
use gna_model::OperandKind;

use crate::capabilities::HardwareCapabilities;
use crate::compiled_model::CompiledModel;
use crate::descriptor::ExternalBufferField;
use crate::error::{GnaError, Result};
use crate::hardware_model::{DescriptorAllocator, HardwareModel, HardwareModelKind};
use crate::submodel::{SubModel, SubModelKind};

/// Components of an MMU-less export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmuLessExport {
    /// Target version
    pub target: DeviceVersion,
    /// Layer and GMM descriptors
    pub descriptors: Vec<u8>,
    /// Read-only window contents, following the descriptors in bar 0
    pub read_only: Vec<u8>,
    /// Bytes of the scratch window
    pub scratch_size: u32,
    /// Bytes of the state window
    pub state_size: u32,
    /// Bytes of the input window
    pub input_size: u32,
    /// Bytes of the output window
    pub output_size: u32,
    /// Bytes of the read-write window
    pub read_write_size: u32,
    /// Fields pointing at host-owned buffers
    pub externals: Vec<ExternalBufferField>,
}

/// 64-byte header of a legacy export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LegacyExportHeader {
    /// Offset of the first descriptor in the image
    pub descriptor_base: u32,
    /// Image size
    pub model_size: u32,
    /// [`OPERATION_MODE_NN`] or [`OPERATION_MODE_GMM`]
    pub operation_mode: u32,
    /// Exported layers
    pub layer_count: u32,
    /// Bytes per input element
    pub input_element_size: u32,
    /// Bytes per output element
    pub output_element_size: u32,
    /// Input elements
    pub input_element_count: u32,
    /// Output elements
    pub output_element_count: u32,
    /// Location of the first layer's input buffer field
    pub input_descriptor_offset: u32,
    /// Location of the last layer's output buffer field
    pub output_descriptor_offset: u32,
}

impl LegacyExportHeader {
    fn fields(&self) -> [(usize, u32); 10] {
        [
            (header::DESCRIPTOR_BASE, self.descriptor_base),
            (header::MODEL_SIZE, self.model_size),
            (header::OPERATION_MODE, self.operation_mode),
            (header::LAYER_COUNT, self.layer_count),
            (header::INPUT_ELEMENT_SIZE, self.input_element_size),
            (header::OUTPUT_ELEMENT_SIZE, self.output_element_size),
            (header::INPUT_ELEMENT_COUNT, self.input_element_count),
            (header::OUTPUT_ELEMENT_COUNT, self.output_element_count),
            (header::INPUT_DESCRIPTOR_OFFSET, self.input_descriptor_offset),
            (header::OUTPUT_DESCRIPTOR_OFFSET, self.output_descriptor_offset),
        ]
    }

    /// Little-endian encoding; reserved bytes are zero
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        for (at, value) in self.fields() {
            bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    /// Decode a header; `None` when `bytes` is shorter than a header
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..HEADER_SIZE)?;
        let word = |at: usize| {
            let mut w = [0u8; 4];
            w.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(w)
        };
        Some(Self {
            descriptor_base: word(header::DESCRIPTOR_BASE),
            model_size: word(header::MODEL_SIZE),
            operation_mode: word(header::OPERATION_MODE),
            layer_count: word(header::LAYER_COUNT),
            input_element_size: word(header::INPUT_ELEMENT_SIZE),
            output_element_size: word(header::OUTPUT_ELEMENT_SIZE),
            input_element_count: word(header::INPUT_ELEMENT_COUNT),
            output_element_count: word(header::OUTPUT_ELEMENT_COUNT),
            input_descriptor_offset: word(header::INPUT_DESCRIPTOR_OFFSET),
            output_descriptor_offset: word(header::OUTPUT_DESCRIPTOR_OFFSET),
        })
    }
}

/// Legacy single-shot export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyExport {
    /// Header describing `image`
    pub header: LegacyExportHeader,
    /// Descriptor memory followed by the model allocations
    pub image: Vec<u8>,
}

fn hardware_submodels(compiled: &CompiledModel, target: DeviceVersion) -> Result<Arc<[SubModel]>> {
    let submodels = compiled.submodels(target);
    if !compiled.is_fully_hardware_compatible(target) {
        return Err(GnaError::model_invalid(format!(
            "model {} is not fully supported by {target}",
            compiled.id()
        )));
    }
    Ok(submodels)
}

/// Export for an MMU-less target
///
/// Every model allocation must be tagged; `allocator` supplies descriptor
/// memory.
///
/// # Errors
///
/// [`GnaError::DeviceVersionInvalid`] for a target with an MMU,
/// [`GnaError::ModelInvalid`] when a layer would run in software, and the
/// translation errors of untagged or misaligned allocations.
pub fn export_mmu_less(
    compiled: &CompiledModel,
    target: DeviceVersion,
    allocator: &mut dyn DescriptorAllocator,
) -> Result<MmuLessExport> {
    if target.has_mmu() {
        return Err(GnaError::DeviceVersionInvalid {
            version: target.raw(),
        });
    }
    let submodels = hardware_submodels(compiled, target)?;
    let hardware = HardwareModel::build(
        compiled.software().layers(),
        &submodels,
        HardwareCapabilities::for_version(target),
        HardwareModelKind::ExportMmuLess { target },
        compiled.memory(),
        allocator,
    )?;
    let bar = hardware
        .translation()
        .bar()
        .ok_or_else(|| GnaError::model_invalid("MMU-less export without bar translation"))?;

    let mut read_only = vec![0u8; bar.group_size(MemoryTag::ReadOnly) as usize];
    if let Some(group) = bar.group(MemoryTag::ReadOnly) {
        for memory in group.memories() {
            let at = group
                .offset_of(memory.address(), BUFFER_ALIGNMENT)
                .ok_or_else(|| GnaError::buffer_invalid(memory.address(), "not in read-only group"))?
                as usize;
            let bytes = memory.to_bytes();
            read_only[at..at + bytes.len()].copy_from_slice(&bytes);
        }
    }

    let export = MmuLessExport {
        target,
        descriptors: hardware.descriptor_memory().to_bytes().to_vec(),
        read_only,
        scratch_size: bar.group_size(MemoryTag::Scratch),
        state_size: bar.group_size(MemoryTag::State),
        input_size: bar.group_size(MemoryTag::Input),
        output_size: bar.group_size(MemoryTag::Output),
        read_write_size: bar.group_size(MemoryTag::ReadWrite),
        externals: hardware.external_fields().to_vec(),
    };
    tracing::info!(
        "Exported model {} for {target}: {} descriptor bytes, {} read-only bytes, {} external fields",
        compiled.id(),
        export.descriptors.len(),
        export.read_only.len(),
        export.externals.len()
    );
    Ok(export)
}

/// Legacy single-shot export for embedded 1.0
///
/// # Errors
///
/// [`GnaError::ModelInvalid`] when a layer would run in software or legacy
/// GMM layers are mixed with other layers, and hardware model build errors.
pub fn export_legacy(compiled: &CompiledModel, allocator: &mut dyn DescriptorAllocator) -> Result<LegacyExport> {
    let target = DeviceVersion::Embedded1_0;
    let submodels = hardware_submodels(compiled, target)?;
    let legacy_gmm = submodels.iter().any(|s| s.kind == SubModelKind::HardwareLegacy);
    if legacy_gmm && compiled.layer_count() != 1 {
        return Err(GnaError::model_invalid(
            "single-shot export holds one stand-alone GMM layer or a layer list",
        ));
    }
    let hardware = HardwareModel::build(
        compiled.software().layers(),
        &submodels,
        HardwareCapabilities::for_version(target),
        HardwareModelKind::ExportLegacy,
        compiled.memory(),
        allocator,
    )?;

    let memory = hardware.model_memory();
    let mut image = vec![0u8; memory.total_size_aligned() as usize];
    for allocation in memory.memories() {
        let at = memory
            .offset_of(allocation.address(), PAGE_SIZE)
            .ok_or_else(|| GnaError::buffer_invalid(allocation.address(), "not in model memory"))?
            as usize;
        let bytes = allocation.to_bytes();
        image[at..at + bytes.len()].copy_from_slice(&bytes);
    }

    let software = compiled.software();
    let first = software.layer(0)?;
    let last = software.layer(compiled.layer_count() - 1)?;
    let input = first.required(OperandKind::Input)?;
    let output = last.required(OperandKind::Output)?;
    let field = |index: u32, operand: OperandKind| -> Result<u32> {
        hardware
            .layer(index)?
            .buffer_location(operand)
            .ok_or_else(|| GnaError::operand_invalid(operand, "no descriptor field"))
    };
    let header = LegacyExportHeader {
        descriptor_base: 0,
        model_size: image.len() as u32,
        operation_mode: if legacy_gmm { OPERATION_MODE_GMM } else { OPERATION_MODE_NN },
        layer_count: compiled.layer_count(),
        input_element_size: input.data_type.size(),
        output_element_size: output.data_type.size(),
        input_element_count: input.element_count(),
        output_element_count: output.element_count(),
        input_descriptor_offset: field(first.index(), OperandKind::Input)?,
        output_descriptor_offset: field(last.index(), OperandKind::Output)?,
    };
    tracing::info!(
        "Exported model {} as single-shot image: {} bytes, {} layers",
        compiled.id(),
        header.model_size,
        header.layer_count
    );
    Ok(LegacyExport { header, image })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Memory, MemoryContainer};
    use gna_model::{DataType, Model, Operation, Tensor};

    struct Fixture {
        memory: MemoryContainer,
        model: Model,
        weights: Arc<Memory>,
    }

    fn fixture(tags: [MemoryTag; 4]) -> Fixture {
        let mut memory = MemoryContainer::new();
        let mut allocations = Vec::new();
        for tag in tags {
            let m = Memory::allocate(64).unwrap();
            m.set_tag(tag);
            memory.append(Arc::clone(&m)).unwrap();
            allocations.push(m);
        }
        allocations[2].write(0, &[7u8; 64]).unwrap();
        let model = Model::new(vec![Operation::fully_connected_affine(
            Tensor::new(&[1, 4], DataType::Int16).with_data(allocations[0].address()),
            Tensor::new(&[1, 2], DataType::Int32).with_data(allocations[1].address()),
            Tensor::new(&[2, 4], DataType::Int16).with_data(allocations[2].address()),
            Tensor::new(&[2], DataType::Int32).with_data(allocations[3].address()),
        )])
        .unwrap();
        Fixture {
            memory,
            model,
            weights: Arc::clone(&allocations[2]),
        }
    }

    fn compile(f: &Fixture, target: DeviceVersion) -> CompiledModel {
        CompiledModel::for_export(0, &f.model, f.memory.clone(), target).unwrap()
    }

    #[test]
    fn test_header_layout() {
        let h = LegacyExportHeader {
            model_size: 0x1000,
            layer_count: 3,
            output_descriptor_offset: 0x1A4,
            ..LegacyExportHeader::default()
        };
        let bytes = h.to_bytes();
        assert_eq!(&bytes[0x04..0x08], &0x1000u32.to_le_bytes());
        assert_eq!(&bytes[0x0C..0x10], &3u32.to_le_bytes());
        assert_eq!(&bytes[0x24..0x28], &0x1A4u32.to_le_bytes());
        assert!(bytes[header::RESERVED..].iter().all(|&b| b == 0));
        assert_eq!(LegacyExportHeader::from_bytes(&bytes), Some(h));
        assert_eq!(LegacyExportHeader::from_bytes(&bytes[..10]), None);
    }

    #[test]
    fn test_mmu_less_export() {
        let f = fixture([
            MemoryTag::ExternalInput,
            MemoryTag::Output,
            MemoryTag::ReadOnly,
            MemoryTag::ReadOnly,
        ]);
        let compiled = compile(&f, DeviceVersion::Embedded3_1);
        let export =
            export_mmu_less(&compiled, DeviceVersion::Embedded3_1, &mut |size| Memory::allocate(size)).unwrap();
        assert_eq!(export.descriptors.len(), 128);
        // Weights then bias, each 64-byte aligned.
        assert_eq!(export.read_only.len(), 128);
        assert_eq!(&export.read_only[..64], &f.weights.to_bytes()[..]);
        assert_eq!(export.output_size, 64);
        assert_eq!(export.input_size, 0);
        assert_eq!(export.externals.len(), 1);
        assert_eq!(export.externals[0].tag, MemoryTag::ExternalInput);
    }

    #[test]
    fn test_mmu_less_rejects_mmu_target() {
        let f = fixture([MemoryTag::Input, MemoryTag::Output, MemoryTag::ReadOnly, MemoryTag::ReadOnly]);
        let compiled = compile(&f, DeviceVersion::Gna3_0);
        assert!(matches!(
            export_mmu_less(&compiled, DeviceVersion::Gna3_0, &mut |size| Memory::allocate(size)),
            Err(GnaError::DeviceVersionInvalid { .. })
        ));
    }

    #[test]
    fn test_legacy_export_image() {
        let f = fixture([MemoryTag::Input, MemoryTag::Output, MemoryTag::ReadOnly, MemoryTag::ReadOnly]);
        let compiled = compile(&f, DeviceVersion::Embedded1_0);
        let export = export_legacy(&compiled, &mut |size| Memory::allocate(size)).unwrap();
        // Descriptor page plus four model pages.
        assert_eq!(export.image.len(), 5 * PAGE_SIZE as usize);
        assert_eq!(export.header.model_size, 5 * PAGE_SIZE);
        assert_eq!(export.header.operation_mode, OPERATION_MODE_NN);
        assert_eq!(export.header.layer_count, 1);
        assert_eq!(export.header.input_element_size, 2);
        assert_eq!(export.header.output_element_count, 2);
        // Weights are the third model allocation.
        let weights = 3 * PAGE_SIZE as usize;
        assert_eq!(&export.image[weights..weights + 64], &[7u8; 64][..]);
        assert_ne!(export.header.input_descriptor_offset, export.header.output_descriptor_offset);
    }

    #[test]
    fn test_software_layers_block_export() {
        let mut memory = MemoryContainer::new();
        let mut buffer = || {
            let m = Memory::allocate(64).unwrap();
            memory.append(Arc::clone(&m)).unwrap();
            m.address()
        };
        // First-generation copy moves 16-bit elements only.
        let model = Model::new(vec![Operation::copy(
            Tensor::new(&[1, 8], DataType::Int8).with_data(buffer()),
            Tensor::new(&[1, 8], DataType::Int8).with_data(buffer()),
            1,
            8,
        )])
        .unwrap();
        let compiled = CompiledModel::for_export(0, &model, memory, DeviceVersion::Embedded1_0).unwrap();
        assert!(matches!(
            export_legacy(&compiled, &mut |size| Memory::allocate(size)),
            Err(GnaError::ModelInvalid { .. })
        ));
    }
}
