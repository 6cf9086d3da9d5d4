// SPDX-License-Identifier: AGPL-3.0-only

//! Request configurations
//!
//! A [`RequestConfiguration`] binds caller buffers to the operands of one
//! compiled model. Each change bumps a version counter, which is how cached
//! hardware requests notice that their patches are stale.

use std::collections::BTreeMap;
use std::sync::Arc;

use gna_chip::DeviceVersion;
use gna_model::{DataType, OperandKind};

use crate::error::{GnaError, Result};
use crate::layer::{check_buffer_alignment, Layer, LayerKind};
use crate::memory::{Memory, MemoryContainer};
use crate::profiler::ProfilerConfiguration;

/// Where scoring runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccelerationMode {
    /// Hardware when a compatible hardware model exists, software otherwise
    #[default]
    Auto,
    /// Always in software
    Software,
    /// Always on the device; fails when the model has no hardware part
    Hardware,
}

/// Subset of output rows (affine) or states (GMM) to compute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveList {
    /// Address of the `u32` index array
    pub address: u64,
    /// Number of indices
    pub count: u32,
}

/// Buffer bindings and scoring options of one caller
#[derive(Debug, Clone)]
pub struct RequestConfiguration {
    id: u32,
    model_id: u32,
    version: u64,
    buffers: BTreeMap<(u32, OperandKind), u64>,
    active_lists: BTreeMap<u32, ActiveList>,
    acceleration: AccelerationMode,
    software_fallback: bool,
    hardware_consistency: Option<DeviceVersion>,
    profiler: ProfilerConfiguration,
    memory: MemoryContainer,
}

impl RequestConfiguration {
    /// Empty configuration for a compiled model
    pub fn new(id: u32, model_id: u32) -> Self {
        Self {
            id,
            model_id,
            version: 0,
            buffers: BTreeMap::new(),
            active_lists: BTreeMap::new(),
            acceleration: AccelerationMode::Auto,
            software_fallback: false,
            hardware_consistency: None,
            profiler: ProfilerConfiguration::default(),
            memory: MemoryContainer::new(),
        }
    }

    /// Configuration id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Compiled model the configuration belongs to
    pub fn model_id(&self) -> u32 {
        self.model_id
    }

    /// Incremented on every binding change
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Bind `address` to an operand of `layer`
    ///
    /// `memory` is the allocation containing the buffer; it is registered
    /// with the configuration unless already present.
    ///
    /// # Errors
    ///
    /// [`GnaError::OperandInvalid`] when the layer has no such operand,
    /// [`GnaError::MemoryAlignmentInvalid`] for a misaligned buffer and
    /// [`GnaError::MemoryBufferInvalid`] when the operand does not fit
    /// inside `memory`.
    pub fn set_buffer(
        &mut self,
        layer: &Layer,
        operand: OperandKind,
        address: u64,
        memory: Arc<Memory>,
    ) -> Result<()> {
        let size = layer.required(operand)?.size;
        check_buffer_alignment(address)?;
        if !memory.contains(address, u64::from(size)) {
            return Err(GnaError::buffer_invalid(
                address,
                format!("{size} bytes of {operand:?} exceed the allocation"),
            ));
        }
        self.memory.append(memory)?;
        self.buffers.insert((layer.index(), operand), address);
        self.version += 1;
        tracing::debug!(
            "Config {}: layer {} {operand:?} bound to 0x{address:X}",
            self.id,
            layer.index()
        );
        Ok(())
    }

    /// Select an active list for an affine or GMM layer
    ///
    /// # Errors
    ///
    /// [`GnaError::ModelInvalid`] for other layer kinds,
    /// [`GnaError::ParameterOutOfRange`] for an empty or oversized list and
    /// the buffer errors of [`RequestConfiguration::set_buffer`].
    pub fn set_active_list(
        &mut self,
        layer: &Layer,
        address: u64,
        count: u32,
        memory: Arc<Memory>,
    ) -> Result<()> {
        if !matches!(layer.kind(), LayerKind::Affine | LayerKind::Gmm) {
            return Err(GnaError::model_invalid(format!(
                "{:?} does not support active lists",
                layer.kind()
            )));
        }
        if count == 0 || count > layer.output_elements() {
            return Err(GnaError::ParameterOutOfRange {
                field: "ActiveListCount".into(),
                value: u64::from(count),
            });
        }
        check_buffer_alignment(address)?;
        let size = u64::from(count) * u64::from(DataType::Uint32.size());
        if !memory.contains(address, size) {
            return Err(GnaError::buffer_invalid(address, "active list exceeds the allocation"));
        }
        self.memory.append(memory)?;
        self.active_lists
            .insert(layer.index(), ActiveList { address, count });
        self.version += 1;
        Ok(())
    }

    /// Remove the active list of a layer
    pub fn clear_active_list(&mut self, layer_index: u32) {
        if self.active_lists.remove(&layer_index).is_some() {
            self.version += 1;
        }
    }

    /// Buffer bound to an operand
    pub fn buffer(&self, layer_index: u32, operand: OperandKind) -> Option<u64> {
        self.buffers.get(&(layer_index, operand)).copied()
    }

    /// All bindings in `(layer, operand)` order
    pub fn buffers(&self) -> impl Iterator<Item = (u32, OperandKind, u64)> + '_ {
        self.buffers
            .iter()
            .map(|(&(layer, operand), &address)| (layer, operand, address))
    }

    /// Active list of a layer
    pub fn active_list(&self, layer_index: u32) -> Option<ActiveList> {
        self.active_lists.get(&layer_index).copied()
    }

    /// All active lists in layer order
    pub fn active_lists(&self) -> impl Iterator<Item = (u32, ActiveList)> + '_ {
        self.active_lists.iter().map(|(&layer, &list)| (layer, list))
    }

    /// Acceleration mode
    pub fn acceleration(&self) -> AccelerationMode {
        self.acceleration
    }

    /// Change the acceleration mode
    pub fn set_acceleration(&mut self, mode: AccelerationMode) {
        self.acceleration = mode;
    }

    /// True when contention on the device falls back to software
    pub fn software_fallback(&self) -> bool {
        self.software_fallback
    }

    /// Enable or disable software fallback
    pub fn set_software_fallback(&mut self, enabled: bool) {
        self.software_fallback = enabled;
    }

    /// Device version whose numerics software scoring reproduces
    pub fn hardware_consistency(&self) -> Option<DeviceVersion> {
        self.hardware_consistency
    }

    /// Request hardware-consistent software scoring for `version`
    pub fn set_hardware_consistency(&mut self, version: Option<DeviceVersion>) {
        self.hardware_consistency = version;
    }

    /// Profiler settings
    pub fn profiler(&self) -> &ProfilerConfiguration {
        &self.profiler
    }

    /// Attach profiler settings
    pub fn set_profiler(&mut self, profiler: ProfilerConfiguration) {
        self.profiler = profiler;
    }

    /// Allocations bound through this configuration
    pub fn memory(&self) -> &MemoryContainer {
        &self.memory
    }
}
