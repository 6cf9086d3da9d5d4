// SPDX-License-Identifier: AGPL-3.0-only

//! Hardware model: descriptor memory of a compiled model
//!
//! Built once per compiled model and target. Descriptor memory holds one
//! 128-byte layer descriptor per native hardware layer in layer order,
//! followed by one 128-byte GMM descriptor per hardware GMM layer:
//!
//! ```text
//! 0x000  layer descriptor (first native layer)
//! 0x080  layer descriptor
//! ...
//! n*128  GMM descriptor (first GMM layer)
//! ...
//! ```
//!
//! After build the descriptor memory is never modified by the runtime;
//! request-specific buffer fields are carried as patches.

use std::sync::Arc;

use gna_chip::descriptor::{GMM_DESCRIPTOR_SIZE, LAYER_DESCRIPTOR_SIZE};
use gna_chip::DeviceVersion;

use crate::address::{AddressTranslation, BarTranslation, BufferOffset, ContainerTranslation};
use crate::capabilities::HardwareCapabilities;
use crate::descriptor::{encoder, EncodeContext, ExternalBufferField, HardwareLayer};
use crate::error::{GnaError, Result};
use crate::layer::{Layer, LayerKind};
use crate::memory::{Memory, MemoryContainer};
use crate::submodel::{SubModel, SubModelKind};

/// Purpose of a hardware model, selecting its address translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareModelKind {
    /// Live scoring through the device MMU
    Scoring,
    /// Export for an MMU-less target
    ExportMmuLess {
        /// Export target
        target: DeviceVersion,
    },
    /// Legacy single-shot export image
    ExportLegacy,
}

/// Source of descriptor memory
pub trait DescriptorAllocator {
    /// Allocate `size` bytes of descriptor memory
    ///
    /// # Errors
    ///
    /// Any allocation or mapping failure.
    fn allocate(&mut self, size: u32) -> Result<Arc<Memory>>;
}

impl<F> DescriptorAllocator for F
where
    F: FnMut(u32) -> Result<Arc<Memory>>,
{
    fn allocate(&mut self, size: u32) -> Result<Arc<Memory>> {
        self(size)
    }
}

/// Descriptor memory and per-layer field locations
#[derive(Debug)]
pub struct HardwareModel {
    capabilities: HardwareCapabilities,
    kind: HardwareModelKind,
    layers: Vec<Option<HardwareLayer>>,
    descriptor_memory: Arc<Memory>,
    gmm_block_offset: u32,
    translation: AddressTranslation,
    externals: Vec<ExternalBufferField>,
}

impl HardwareModel {
    /// Encode every hardware layer of `layers`
    ///
    /// `submodels` is the partition of `layers` for `capabilities`;
    /// `model_memory` holds the allocations the layers refer to.
    ///
    /// # Errors
    ///
    /// [`GnaError::ModelInvalid`] when no layer runs on hardware; per-layer
    /// failures wrapped in [`GnaError::Layer`]; allocation failures of
    /// `allocator` as returned; [`GnaError::HardwareModuleUnavailable`] when
    /// the generation has no encoder for a layer.
    pub fn build(
        layers: &[Layer],
        submodels: &[SubModel],
        capabilities: HardwareCapabilities,
        kind: HardwareModelKind,
        model_memory: &MemoryContainer,
        allocator: &mut dyn DescriptorAllocator,
    ) -> Result<Self> {
        let mut classes = vec![SubModelKind::Software; layers.len()];
        for submodel in submodels {
            for index in submodel.range() {
                if let Some(class) = classes.get_mut(index as usize) {
                    *class = submodel.kind;
                }
            }
        }
        let native_count = classes
            .iter()
            .filter(|c| **c == SubModelKind::HardwareNative)
            .count() as u32;
        let gmm_count = layers
            .iter()
            .zip(&classes)
            .filter(|(l, c)| c.is_hardware() && l.kind() == LayerKind::Gmm)
            .count() as u32;
        if native_count == 0 && gmm_count == 0 {
            return Err(GnaError::model_invalid("no layer runs on hardware"));
        }

        let gmm_block_offset = native_count * LAYER_DESCRIPTOR_SIZE;
        let size = gmm_block_offset + gmm_count * GMM_DESCRIPTOR_SIZE;
        let descriptor_memory = allocator.allocate(size)?;

        let mut container = MemoryContainer::new();
        container.append(Arc::clone(&descriptor_memory))?;
        for memory in model_memory.memories() {
            container.append(Arc::clone(memory))?;
        }
        let translation = match kind {
            HardwareModelKind::Scoring => {
                AddressTranslation::Mmu(ContainerTranslation::new(container))
            }
            HardwareModelKind::ExportLegacy => {
                AddressTranslation::Flat(ContainerTranslation::new(container))
            }
            HardwareModelKind::ExportMmuLess { target } => {
                AddressTranslation::BarRelative(BarTranslation::new(target, container)?)
            }
        };

        let mut image = vec![0u8; size as usize];
        let mut externals = Vec::new();
        let mut encoded = Vec::with_capacity(layers.len());
        let mut next_descriptor = 0;
        let mut next_gmm = gmm_block_offset;
        for (layer, class) in layers.iter().zip(&classes) {
            if !class.is_hardware() {
                encoded.push(None);
                continue;
            }
            let descriptor_offset = (*class == SubModelKind::HardwareNative).then(|| {
                let offset = next_descriptor;
                next_descriptor += LAYER_DESCRIPTOR_SIZE;
                offset
            });
            let gmm_offset = (layer.kind() == LayerKind::Gmm).then(|| {
                let offset = next_gmm;
                next_gmm += GMM_DESCRIPTOR_SIZE;
                offset
            });
            let generation = capabilities.generation();
            let encode = encoder(generation, layer.kind()).ok_or_else(|| {
                GnaError::HardwareModuleUnavailable {
                    reason: format!("no {:?} encoder for {generation:?}", layer.kind()),
                }
            })?;
            let mut ctx = EncodeContext {
                image: &mut image,
                capabilities: &capabilities,
                translation: &translation,
                externals: &mut externals,
                descriptor_offset,
                gmm_offset,
            };
            let hardware_layer = encode(layer, &mut ctx).map_err(|e| e.at_layer(layer.index()))?;
            encoded.push(Some(hardware_layer));
        }
        descriptor_memory.write(0, &image)?;

        tracing::info!(
            "Built {kind:?} hardware model for {}: {native_count} layer descriptors, {gmm_count} GMM descriptors, {size} bytes",
            capabilities.version()
        );
        Ok(Self {
            capabilities,
            kind,
            layers: encoded,
            descriptor_memory,
            gmm_block_offset,
            translation,
            externals,
        })
    }

    /// Capabilities the model was built for
    pub fn capabilities(&self) -> &HardwareCapabilities {
        &self.capabilities
    }

    /// Purpose of the model
    pub fn kind(&self) -> HardwareModelKind {
        self.kind
    }

    /// Encoded layer; `None` for software layers
    pub fn hardware_layer(&self, index: u32) -> Option<&HardwareLayer> {
        self.layers.get(index as usize).and_then(Option::as_ref)
    }

    /// Encoded layer
    ///
    /// # Errors
    ///
    /// [`GnaError::IdentifierInvalid`] for an index past the model and
    /// [`GnaError::ModelInvalid`] for a layer that runs in software.
    pub fn layer(&self, index: u32) -> Result<&HardwareLayer> {
        match self.layers.get(index as usize) {
            None => Err(GnaError::identifier("layer", index)),
            Some(None) => Err(GnaError::model_invalid(format!(
                "layer {index} has no hardware descriptor"
            ))),
            Some(Some(layer)) => Ok(layer),
        }
    }

    /// Hardware layers in model order
    pub fn hardware_layers(&self) -> impl Iterator<Item = &HardwareLayer> {
        self.layers.iter().flatten()
    }

    /// Number of model layers, hardware or not
    pub fn layer_count(&self) -> u32 {
        self.layers.len() as u32
    }

    /// Descriptor memory
    pub fn descriptor_memory(&self) -> &Arc<Memory> {
        &self.descriptor_memory
    }

    /// Start of the GMM descriptor block
    pub fn gmm_block_offset(&self) -> u32 {
        self.gmm_block_offset
    }

    /// Descriptor memory followed by the model allocations
    pub fn model_memory(&self) -> &MemoryContainer {
        self.translation.model_memory()
    }

    /// Address translation in use
    pub fn translation(&self) -> &AddressTranslation {
        &self.translation
    }

    /// Translate a buffer address, consulting `request` memory when scoring
    ///
    /// # Errors
    ///
    /// See [`AddressTranslation::translate`].
    pub fn translate(&self, address: u64, request: Option<&MemoryContainer>) -> Result<BufferOffset> {
        self.translation.translate(address, request)
    }

    /// Buffer fields the host relocates, for MMU-less exports
    pub fn external_fields(&self) -> &[ExternalBufferField] {
        &self.externals
    }
}
