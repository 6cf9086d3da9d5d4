// SPDX-License-Identifier: AGPL-3.0-only

//! Integer CPU kernels
//!
//! Every layer kind has a software implementation operating directly on
//! device memory through a [`MemoryView`]. Tensors are row-major; grouped
//! inputs and outputs are `[grouping, elements]`.
//!
//! Two numeric modes are provided:
//!
//! - [`ConsistencyMode::Generic`] accumulates exactly in 64 bits and
//!   saturates once when storing.
//! - [`ConsistencyMode::Hardware`] reproduces a device generation: the
//!   accumulator is split into input-buffer sized chunks and saturated to
//!   32 bits after each chunk, as the compute engines do.
//!
//! Saturations are counted, never reported as errors.

mod affine;
mod convolution;
mod gmm;
mod pwl;
mod transfer;

use std::collections::BTreeMap;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use gna_chip::DeviceVersion;
use gna_model::{DataType, OperandKind};

use crate::capabilities::HardwareCapabilities;
use crate::error::{GnaError, Result};
use crate::layer::{Layer, LayerKind};
use crate::memory::{Memory, MemoryContainer};
use crate::request_config::{ActiveList, RequestConfiguration};

pub use pwl::PwlSegment;

/// Numeric behaviour of software scoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyMode {
    /// Exact accumulation
    Generic,
    /// Chunked accumulation of the given device version
    Hardware(DeviceVersion),
}

impl ConsistencyMode {
    /// Accumulation chunk for a layer, `None` for exact accumulation
    fn chunk(self, grouping: u32, precision: u32) -> Option<usize> {
        match self {
            Self::Generic => None,
            Self::Hardware(version) => {
                let elements =
                    HardwareCapabilities::for_version(version).buffer_elements(grouping, precision);
                (elements > 0).then_some(elements as usize)
            }
        }
    }
}

/// Compound bias of layers with one-byte weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CompoundBias {
    /// Bias
    pub bias: i32,
    /// Weight multiplier of the row
    pub multiplier: u8,
    /// Padding
    pub reserved: [u8; 3],
}

/// Per-row weight scale of a multi-bias layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct WeightScaleFactor {
    /// Weight multiplier of the row
    pub multiplier: u8,
    /// Padding
    pub reserved: [u8; 7],
}

/// Device memory reachable by a request: model allocations first, then
/// request allocations
#[derive(Debug, Clone, Copy)]
pub struct MemoryView<'a> {
    model: &'a MemoryContainer,
    request: Option<&'a MemoryContainer>,
}

impl<'a> MemoryView<'a> {
    /// View over model and request memory
    pub fn new(model: &'a MemoryContainer, request: Option<&'a MemoryContainer>) -> Self {
        Self { model, request }
    }

    fn locate(&self, address: u64, len: usize) -> Result<(&'a Arc<Memory>, u32)> {
        let len = len as u64;
        let entry = self
            .model
            .find(address, len)
            .or_else(|| self.request.and_then(|r| r.find(address, len)))
            .ok_or_else(|| {
                GnaError::buffer_invalid(address, format!("{len} bytes not inside a registered allocation"))
            })?;
        let memory = entry.memory();
        let offset = memory
            .offset_of(address)
            .ok_or_else(|| GnaError::buffer_invalid(address, "outside allocation"))?;
        Ok((memory, offset))
    }

    /// Copy `len` bytes at `address`
    ///
    /// # Errors
    ///
    /// [`GnaError::MemoryBufferInvalid`] when the range is not registered.
    pub fn read(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let (memory, offset) = self.locate(address, len)?;
        memory.read_vec(offset, len)
    }

    /// Store bytes at `address`
    ///
    /// # Errors
    ///
    /// [`GnaError::MemoryBufferInvalid`] when the range is not registered.
    pub fn write(&self, address: u64, data: &[u8]) -> Result<()> {
        let (memory, offset) = self.locate(address, data.len())?;
        memory.write(offset, data)
    }

    fn read_pod<T: Pod>(&self, address: u64, count: usize) -> Result<Vec<T>> {
        let size = std::mem::size_of::<T>();
        let bytes = self.read(address, count * size)?;
        Ok(bytes
            .chunks_exact(size)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    /// Read `count` integers of `data_type`
    ///
    /// # Errors
    ///
    /// [`GnaError::MemoryBufferInvalid`] for unregistered memory and
    /// [`GnaError::ModelInvalid`] for structured types.
    pub fn read_ints(&self, address: u64, data_type: DataType, count: usize) -> Result<Vec<i64>> {
        Ok(match data_type {
            DataType::Int8 => widen(self.read_pod::<i8>(address, count)?),
            DataType::Int16 => widen(self.read_pod::<i16>(address, count)?),
            DataType::Int32 => widen(self.read_pod::<i32>(address, count)?),
            DataType::Uint8 => widen(self.read_pod::<u8>(address, count)?),
            DataType::Uint16 => widen(self.read_pod::<u16>(address, count)?),
            DataType::Uint32 => widen(self.read_pod::<u32>(address, count)?),
            other => {
                return Err(GnaError::model_invalid(format!(
                    "{other:?} is not an integer type"
                )))
            }
        })
    }

    /// Store integers already saturated to `data_type`
    ///
    /// # Errors
    ///
    /// Same as [`MemoryView::read_ints`].
    pub fn write_ints(&self, address: u64, data_type: DataType, values: &[i64]) -> Result<()> {
        // Values are in range; the casts only narrow the storage.
        match data_type {
            DataType::Int8 => self.write_pod(address, &narrow::<i8>(values, |v| v as i8)),
            DataType::Int16 => self.write_pod(address, &narrow::<i16>(values, |v| v as i16)),
            DataType::Int32 => self.write_pod(address, &narrow::<i32>(values, |v| v as i32)),
            DataType::Uint8 => self.write_pod(address, &narrow::<u8>(values, |v| v as u8)),
            DataType::Uint16 => self.write_pod(address, &narrow::<u16>(values, |v| v as u16)),
            DataType::Uint32 => self.write_pod(address, &narrow::<u32>(values, |v| v as u32)),
            other => Err(GnaError::model_invalid(format!(
                "{other:?} is not an integer type"
            ))),
        }
    }

    fn write_pod<T: Pod>(&self, address: u64, values: &[T]) -> Result<()> {
        self.write(address, bytemuck::cast_slice(values))
    }
}

fn widen<T: Into<i64>>(values: Vec<T>) -> Vec<i64> {
    values.into_iter().map(Into::into).collect()
}

fn narrow<T>(values: &[i64], cast: impl Fn(i64) -> T) -> Vec<T> {
    values.iter().map(|&v| cast(v)).collect()
}

/// Buffers a layer executes on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerBuffers {
    addresses: BTreeMap<OperandKind, u64>,
    active_list: Option<ActiveList>,
}

impl LayerBuffers {
    /// Resolve every operand of `layer`: request binding first, then the
    /// address given in the model
    ///
    /// # Errors
    ///
    /// [`GnaError::OperandInvalid`] for an operand with no buffer.
    pub fn resolve(layer: &Layer, config: &RequestConfiguration) -> Result<Self> {
        let addresses = layer
            .operands()
            .map(|operand| {
                config
                    .buffer(layer.index(), operand.kind)
                    .or(operand.address)
                    .map(|address| (operand.kind, address))
                    .ok_or_else(|| GnaError::operand_invalid(operand.kind, "no buffer bound"))
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            addresses,
            active_list: config.active_list(layer.index()),
        })
    }

    /// Address of an operand
    ///
    /// # Errors
    ///
    /// [`GnaError::OperandInvalid`] when the layer has no such operand.
    pub fn address(&self, kind: OperandKind) -> Result<u64> {
        self.addresses
            .get(&kind)
            .copied()
            .ok_or_else(|| GnaError::operand_invalid(kind, "no buffer bound"))
    }

    /// Address of an optional operand
    pub fn optional(&self, kind: OperandKind) -> Option<u64> {
        self.addresses.get(&kind).copied()
    }

    /// Active list selected for the layer
    pub fn active_list(&self) -> Option<ActiveList> {
        self.active_list
    }
}

/// Output rows to compute: the active list when one is set, otherwise all
fn selected_rows(view: &MemoryView<'_>, list: Option<ActiveList>, rows: u32) -> Result<Vec<usize>> {
    let Some(list) = list else {
        return Ok((0..rows as usize).collect());
    };
    view.read_ints(list.address, DataType::Uint32, list.count as usize)?
        .into_iter()
        .map(|index| {
            if index < i64::from(rows) {
                Ok(index as usize)
            } else {
                Err(GnaError::buffer_invalid(
                    list.address,
                    format!("active list index {index} out of {rows} rows"),
                ))
            }
        })
        .collect()
}

/// Execution state of one software pass
#[derive(Debug)]
pub struct KernelContext<'a> {
    view: MemoryView<'a>,
    mode: ConsistencyMode,
    saturations: u32,
}

impl<'a> KernelContext<'a> {
    /// Context over `view` in `mode`
    pub fn new(view: MemoryView<'a>, mode: ConsistencyMode) -> Self {
        Self {
            view,
            mode,
            saturations: 0,
        }
    }

    /// Saturations counted so far
    pub fn saturations(&self) -> u32 {
        self.saturations
    }

    /// Memory being scored
    pub fn view(&self) -> &MemoryView<'a> {
        &self.view
    }

    /// Clamp to the range of `data_type`, counting clamps
    fn saturate(&mut self, value: i64, data_type: DataType) -> i64 {
        let (min, max) = data_type.range().unwrap_or((i64::MIN, i64::MAX));
        if value < min || value > max {
            self.saturations += 1;
        }
        value.clamp(min, max)
    }

    /// Dot product of `products` with mode-specific accumulation
    fn accumulate(&mut self, products: impl Iterator<Item = i64>, chunk: Option<usize>) -> i64 {
        let Some(chunk) = chunk else {
            return products.sum();
        };
        let mut sum = 0i64;
        for (i, product) in products.enumerate() {
            sum += product;
            if (i + 1) % chunk == 0 {
                sum = self.saturate(sum, DataType::Int32);
            }
        }
        self.saturate(sum, DataType::Int32)
    }
}

/// Execute one layer
///
/// # Errors
///
/// Buffer and operand errors of the layer's kernel.
pub fn execute(layer: &Layer, buffers: &LayerBuffers, ctx: &mut KernelContext<'_>) -> Result<()> {
    match layer.kind() {
        LayerKind::Affine | LayerKind::AffineMultiBias => affine::affine(layer, buffers, ctx),
        LayerKind::Diagonal => affine::diagonal(layer, buffers, ctx),
        LayerKind::Recurrent => affine::recurrent(layer, buffers, ctx),
        LayerKind::Convolution1D | LayerKind::Convolution2D => {
            convolution::convolution(layer, buffers, ctx)
        }
        LayerKind::Copy => transfer::copy(layer, buffers, ctx),
        LayerKind::Interleave | LayerKind::Deinterleave => transfer::transpose(layer, buffers, ctx),
        LayerKind::Gmm => gmm::gmm(layer, buffers, ctx),
    }
}

/// Store an activated or saturated accumulator row
fn store_outputs(
    layer: &Layer,
    buffers: &LayerBuffers,
    ctx: &mut KernelContext<'_>,
    address: u64,
    accumulators: &[i64],
) -> Result<()> {
    let output_type = layer.required(OperandKind::Output)?.data_type;
    let values = match buffers.optional(OperandKind::Activation) {
        Some(pwl) => {
            let count = layer.required(OperandKind::Activation)?.element_count() as usize;
            let segments = ctx.view.read_pod::<PwlSegment>(pwl, count)?;
            accumulators
                .iter()
                .map(|&acc| {
                    let acc = ctx.saturate(acc, DataType::Int32);
                    let y = pwl::activate(&segments, acc);
                    ctx.saturate(y, output_type)
                })
                .collect::<Vec<_>>()
        }
        None => accumulators
            .iter()
            .map(|&acc| ctx.saturate(acc, output_type))
            .collect(),
    };
    ctx.view.write_ints(address, output_type, &values)
}


#[cfg(test)]
mod tests {
    use super::testing::Buffers;
    use super::*;

    #[test]
    fn test_view_round_trip_and_bounds() {
        let mut b = Buffers::new();
        let addr = b.ints(DataType::Int16, &[-3, 7, 32767]);
        let view = b.view();
        assert_eq!(view.read_ints(addr, DataType::Int16, 3).unwrap(), vec![-3, 7, 32767]);
        assert!(view.read_ints(addr + 2, DataType::Int32, 2).is_err());
        assert!(view.read(0x10, 1).is_err());
    }

    #[test]
    fn test_hardware_chunks_saturate_early() {
        let b = Buffers::new();
        let mut ctx = KernelContext::new(b.view(), ConsistencyMode::Generic);
        let products = [i64::from(i32::MAX), 10, -20];
        assert_eq!(ctx.accumulate(products.iter().copied(), None), i64::from(i32::MAX) - 10);
        assert_eq!(ctx.saturations(), 0);
        // Chunk of one: the running sum is clamped before the negative term.
        assert_eq!(
            ctx.accumulate(products.iter().copied(), Some(1)),
            i64::from(i32::MAX) - 20
        );
        assert_eq!(ctx.saturations(), 1);
    }

    #[test]
    fn test_hardware_chunk_size() {
        let mode = ConsistencyMode::Hardware(DeviceVersion::Gna3_0);
        assert_eq!(mode.chunk(1, 2), Some(12288));
        assert_eq!(mode.chunk(9, 2), None);
        assert_eq!(ConsistencyMode::Generic.chunk(1, 2), None);
    }
}
