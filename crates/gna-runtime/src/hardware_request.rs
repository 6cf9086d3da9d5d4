// SPDX-License-Identifier: AGPL-3.0-only

//! Per-configuration hardware command state
//!
//! Descriptor memory is encoded once with the buffers given in the model.
//! A [`HardwareRequest`] carries everything a request configuration changes
//! on top of it as `(offset, value, size)` patches that the driver applies
//! to its copy of descriptor memory before execution:
//!
//! - buffer fields of bound operands,
//! - the op-type byte of affine and GMM layers (active list or not),
//! - active-list pointer and length, GMM flags and score buffer length,
//! - the feedback pointer of recurrent layers with a bound output.
//!
//! [`HardwareRequest::invalidate`] always regenerates the full patch set
//! from the configuration; patches are never merged across calls.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use gna_chip::descriptor::{gmm_field, layer_field, op_code};
use gna_chip::{Field, GmmField, NnOp};
use gna_model::OperandKind;

use crate::descriptor::{feedback_address, ActiveListFields, HardwareLayer};
use crate::error::{GnaError, Result};
use crate::hardware_model::HardwareModel;
use crate::memory::Memory;
use crate::request_config::{ActiveList, RequestConfiguration};
use crate::submodel::SubModelKind;

/// One value written over descriptor memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Patch {
    /// Byte offset inside the allocation
    pub offset: u32,
    /// Little-endian value
    pub value: u32,
    /// Bytes written (1, 2 or 4)
    pub size: u8,
}

impl Patch {
    /// Write the patch into `image`; `false` when it does not fit
    pub fn apply(&self, image: &mut [u8]) -> bool {
        let start = self.offset as usize;
        let size = usize::from(self.size);
        match image.get_mut(start..start + size) {
            Some(target) if size <= 4 => {
                target.copy_from_slice(&self.value.to_le_bytes()[..size]);
                true
            }
            _ => false,
        }
    }
}

/// An allocation the submission uses and the patches applied to it
#[derive(Debug, Clone)]
pub struct MemoryPatches {
    memory: Arc<Memory>,
    patches: Vec<Patch>,
}

impl MemoryPatches {
    /// Allocation
    pub fn memory(&self) -> &Arc<Memory> {
        &self.memory
    }

    /// Patches in ascending offset order
    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }
}

/// How the device walks the submitted range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    /// Layer descriptor list
    Neural,
    /// One stand-alone GMM descriptor
    LegacyGmm,
}

impl OperationMode {
    /// Mode executing a hardware sub-model kind
    pub fn for_submodel(kind: SubModelKind) -> Option<Self> {
        match kind {
            SubModelKind::HardwareNative => Some(Self::Neural),
            SubModelKind::HardwareLegacy => Some(Self::LegacyGmm),
            SubModelKind::Software => None,
        }
    }
}

/// Patched descriptor state of one request configuration
#[derive(Debug)]
pub struct HardwareRequest {
    config_id: u32,
    config_version: u64,
    memories: Vec<MemoryPatches>,
    layer_index: u32,
    layer_count: u32,
    mode: OperationMode,
    descriptor_base: u32,
    active_list_layers: BTreeSet<u32>,
    active_list_cache: HashMap<u32, bool>,
}

impl HardwareRequest {
    /// Build the request of `config` on `model`
    ///
    /// # Errors
    ///
    /// See [`HardwareRequest::invalidate`].
    pub fn new(model: &HardwareModel, config: &RequestConfiguration) -> Result<Self> {
        let mut request = Self {
            config_id: config.id(),
            config_version: config.version(),
            memories: Vec::new(),
            layer_index: 0,
            layer_count: 0,
            mode: OperationMode::Neural,
            descriptor_base: 0,
            active_list_layers: BTreeSet::new(),
            active_list_cache: HashMap::new(),
        };
        request.invalidate(model, config)?;
        Ok(request)
    }

    /// Regenerate all patches from `config`
    ///
    /// # Errors
    ///
    /// Translation errors of bound buffers, annotated with the layer index.
    pub fn invalidate(&mut self, model: &HardwareModel, config: &RequestConfiguration) -> Result<()> {
        let mut patches = Vec::new();
        for layer in model.hardware_layers() {
            layer_patches(model, layer, config, &mut patches)
                .map_err(|e| e.at_layer(layer.layer_index()))?;
        }
        patches.sort_unstable();

        let descriptor = model.descriptor_memory();
        let mut memories = vec![MemoryPatches {
            memory: Arc::clone(descriptor),
            patches,
        }];
        let others = model
            .model_memory()
            .memories()
            .chain(config.memory().memories())
            .filter(|m| m.id() != descriptor.id());
        for memory in others {
            if memories.iter().all(|m| m.memory.id() != memory.id()) {
                memories.push(MemoryPatches {
                    memory: Arc::clone(memory),
                    patches: Vec::new(),
                });
            }
        }

        self.memories = memories;
        self.config_id = config.id();
        self.config_version = config.version();
        self.active_list_layers = config.active_lists().map(|(layer, _)| layer).collect();
        self.active_list_cache.clear();
        tracing::debug!(
            "Config {}: {} descriptor patches over {} allocations",
            self.config_id,
            self.memories[0].patches.len(),
            self.memories.len()
        );
        Ok(())
    }

    /// Select the layers the next submission executes
    ///
    /// # Errors
    ///
    /// [`GnaError::IdentifierInvalid`] or [`GnaError::ModelInvalid`] when the
    /// first layer has no descriptor.
    pub fn update(
        &mut self,
        model: &HardwareModel,
        layer_index: u32,
        layer_count: u32,
        mode: OperationMode,
    ) -> Result<()> {
        self.descriptor_base = model.layer(layer_index)?.descriptor_offset();
        self.layer_index = layer_index;
        self.layer_count = layer_count;
        self.mode = mode;
        if mode == OperationMode::LegacyGmm {
            for index in layer_index..layer_index + layer_count {
                let present = self.active_list_layers.contains(&index);
                self.active_list_cache.entry(index).or_insert(present);
            }
        }
        Ok(())
    }

    /// Configuration the patches were generated from
    pub fn config_id(&self) -> u32 {
        self.config_id
    }

    /// Configuration version the patches reflect
    pub fn config_version(&self) -> u64 {
        self.config_version
    }

    /// Allocations of the submission: descriptor memory, model, request
    pub fn memories(&self) -> &[MemoryPatches] {
        &self.memories
    }

    /// Descriptor memory patches
    pub fn patches(&self) -> &[Patch] {
        self.memories.first().map_or(&[], |m| &m.patches)
    }

    /// First layer of the submission
    pub fn layer_index(&self) -> u32 {
        self.layer_index
    }

    /// Layers in the submission
    pub fn layer_count(&self) -> u32 {
        self.layer_count
    }

    /// Operating mode of the submission
    pub fn mode(&self) -> OperationMode {
        self.mode
    }

    /// Descriptor offset the device starts at
    pub fn descriptor_base(&self) -> u32 {
        self.descriptor_base
    }

    /// True when a legacy GMM layer of the current range has an active list
    pub fn has_active_list(&self) -> bool {
        (self.layer_index..self.layer_index + self.layer_count)
            .any(|i| self.active_list_cache.get(&i).copied().unwrap_or(false))
    }

    /// Descriptor memory with the patches applied
    pub fn patched_descriptors(&self) -> Result<Vec<u8>> {
        let descriptors = self
            .memories
            .first()
            .ok_or_else(|| GnaError::model_invalid("request has no descriptor memory"))?;
        let mut image = descriptors.memory.to_bytes().to_vec();
        for patch in &descriptors.patches {
            if !patch.apply(&mut image) {
                return Err(GnaError::ParameterOutOfRange {
                    field: "patch".into(),
                    value: u64::from(patch.offset),
                });
            }
        }
        Ok(image)
    }
}

fn translate(model: &HardwareModel, config: &RequestConfiguration, address: u64) -> Result<u32> {
    Ok(model.translate(address, Some(config.memory()))?.value())
}

fn op_type_patch(model: &HardwareModel, at: u32, op: NnOp) -> Result<Patch> {
    let generation = model.capabilities().generation();
    let code = op_code(generation, op).ok_or_else(|| GnaError::HardwareModuleUnavailable {
        reason: format!("{generation:?} has no {op:?} operation"),
    })?;
    let size = layer_field(generation, Field::OpType).map_or(1, |l| l.size);
    Ok(Patch {
        offset: at,
        value: u32::from(code),
        size,
    })
}

fn active_list_patches(
    model: &HardwareModel,
    config: &RequestConfiguration,
    fields: &ActiveListFields,
    list: ActiveList,
    patches: &mut Vec<Patch>,
) -> Result<()> {
    patches.push(Patch {
        offset: fields.buffer,
        value: translate(model, config, list.address)?,
        size: 4,
    });
    patches.push(Patch {
        offset: fields.count,
        value: list.count,
        size: fields.count_size,
    });
    Ok(())
}

fn layer_patches(
    model: &HardwareModel,
    layer: &HardwareLayer,
    config: &RequestConfiguration,
    patches: &mut Vec<Patch>,
) -> Result<()> {
    let index = layer.layer_index();
    for (_, operand, address) in config.buffers().filter(|(l, _, _)| *l == index) {
        let location = layer.buffer_location(operand).ok_or_else(|| {
            GnaError::operand_invalid(operand, "no descriptor field for the operand")
        })?;
        patches.push(Patch {
            offset: location,
            value: translate(model, config, address)?,
            size: 4,
        });
        if let HardwareLayer::Recurrent {
            feedback,
            delay,
            output_row_bytes,
            ..
        } = layer
        {
            if operand == OperandKind::Output {
                let address = feedback_address(address, *delay, *output_row_bytes)?;
                patches.push(Patch {
                    offset: *feedback,
                    value: translate(model, config, address)?,
                    size: 4,
                });
            }
        }
    }

    let list = config.active_list(index);
    match layer {
        HardwareLayer::Affine {
            op_type,
            active_list: Some(fields),
            ..
        } => {
            let op = if list.is_some() { NnOp::AffineActiveList } else { NnOp::Affine };
            patches.push(op_type_patch(model, *op_type, op)?);
            if let Some(list) = list {
                active_list_patches(model, config, fields, list, patches)?;
            }
        }
        HardwareLayer::Gmm { gmm, .. } => {
            if let Some(at) = gmm.op_type {
                let op = if list.is_some() { NnOp::GmmActiveList } else { NnOp::Gmm };
                patches.push(op_type_patch(model, at, op)?);
            }
            if let Some(list) = list {
                active_list_patches(model, config, &gmm.active_list, list, patches)?;
                let enabled = gmm_field(GmmField::ActiveListEnabled);
                patches.push(Patch {
                    offset: gmm.flags,
                    value: u32::from(gmm.flags_base) | (1 << enabled.bit_offset),
                    size: 1,
                });
                if gmm.legacy {
                    patches.push(Patch {
                        offset: gmm.score_length,
                        value: list.count * gmm.grouping * 4,
                        size: 4,
                    });
                }
            }
        }
        _ if list.is_some() => {
            return Err(GnaError::model_invalid(format!(
                "{:?} layer cannot use an active list",
                layer.kind()
            )));
        }
        _ => {}
    }
    Ok(())
}
