// SPDX-License-Identifier: AGPL-3.0-only

//! CPU representation of a compiled model

use std::ops::Range;

use gna_model::{Model, OperandKind};

use crate::error::{GnaError, Result};
use crate::kernels::{execute, ConsistencyMode, KernelContext, LayerBuffers, MemoryView};
use crate::layer::Layer;
use crate::request_config::RequestConfiguration;

/// Validated layers of a model, executable by the CPU kernels
#[derive(Debug, Clone)]
pub struct SoftwareModel {
    layers: Vec<Layer>,
}

impl SoftwareModel {
    /// Derive the layers of `model`
    ///
    /// # Errors
    ///
    /// The first failing layer, wrapped in [`GnaError::Layer`].
    pub fn new(model: &Model) -> Result<Self> {
        let layers = model
            .operations()
            .iter()
            .enumerate()
            .map(|(index, operation)| {
                let index = index as u32;
                Layer::from_operation(index, operation).map_err(|e| e.at_layer(index))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    /// Layers in execution order
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Number of layers
    pub fn layer_count(&self) -> u32 {
        self.layers.len() as u32
    }

    /// Layer by index
    ///
    /// # Errors
    ///
    /// [`GnaError::IdentifierInvalid`] past the last layer.
    pub fn layer(&self, index: u32) -> Result<&Layer> {
        self.layers
            .get(index as usize)
            .ok_or_else(|| GnaError::identifier("layer", index))
    }

    /// Largest operand of each slot over all layers, in bytes
    pub fn max_operand_size(&self, kind: OperandKind) -> u32 {
        self.layers
            .iter()
            .filter_map(|layer| layer.operand(kind))
            .map(|operand| operand.size)
            .max()
            .unwrap_or(0)
    }

    /// Score `range` on the CPU and return the saturation count
    ///
    /// # Errors
    ///
    /// Unbound operands and unreachable buffers, wrapped in
    /// [`GnaError::Layer`].
    pub fn score(
        &self,
        range: Range<u32>,
        config: &RequestConfiguration,
        view: MemoryView<'_>,
        mode: ConsistencyMode,
    ) -> Result<u32> {
        if range.end > self.layer_count() {
            return Err(GnaError::LayerCountExceeded {
                count: range.end,
                limit: self.layer_count(),
            });
        }
        let mut ctx = KernelContext::new(view, mode);
        for index in range {
            let layer = &self.layers[index as usize];
            LayerBuffers::resolve(layer, config)
                .and_then(|buffers| execute(layer, &buffers, &mut ctx))
                .map_err(|e| e.at_layer(index))?;
        }
        Ok(ctx.saturations())
    }
}
