// SPDX-License-Identifier: AGPL-3.0-only

//! Affine family kernels: fully connected, multi-bias, element-wise and
//! recurrent

use gna_model::{DataType, OperandKind};

use super::{selected_rows, store_outputs, CompoundBias, KernelContext, LayerBuffers, MemoryView, WeightScaleFactor};
use crate::descriptor::feedback_address;
use crate::error::{GnaError, Result};
use crate::layer::{Layer, LayerParams};

/// Per-row bias and weight multiplier
pub(super) struct RowBias {
    values: Vec<i64>,
    multipliers: Option<Vec<i64>>,
}

impl RowBias {
    pub(super) fn read(layer: &Layer, buffers: &LayerBuffers, view: &MemoryView<'_>, rows: usize) -> Result<Self> {
        let bias = layer.required(OperandKind::Bias)?;
        let address = buffers.address(OperandKind::Bias)?;
        let (stride, column) = match *layer.params() {
            LayerParams::MultiBias { index, count } => (count as usize, index as usize),
            _ => (1, 0),
        };
        let total = rows * stride;
        let (all, multipliers) = if bias.data_type == DataType::CompoundBias {
            let compound = view.read_pod::<CompoundBias>(address, total)?;
            (
                compound.iter().map(|c| i64::from(c.bias)).collect::<Vec<_>>(),
                Some(compound.iter().map(|c| i64::from(c.multiplier)).collect::<Vec<_>>()),
            )
        } else {
            (view.read_ints(address, bias.data_type, total)?, None)
        };
        let pick = |v: Vec<i64>| -> Vec<i64> { (0..rows).map(|o| v[o * stride + column]).collect() };
        let mut multipliers = multipliers.map(pick);
        if let Some(scales) = buffers.optional(OperandKind::WeightScaleFactors) {
            let scales = view.read_pod::<WeightScaleFactor>(scales, rows)?;
            multipliers = Some(scales.iter().map(|s| i64::from(s.multiplier)).collect());
        }
        Ok(Self {
            values: pick(all),
            multipliers,
        })
    }

    pub(super) fn value(&self, row: usize) -> i64 {
        self.values[row]
    }

    pub(super) fn multiplier(&self, row: usize) -> i64 {
        self.multipliers.as_ref().map_or(1, |m| m[row])
    }
}

pub(super) fn read_operand(layer: &Layer, buffers: &LayerBuffers, view: &MemoryView<'_>, kind: OperandKind) -> Result<Vec<i64>> {
    let operand = layer.required(kind)?;
    view.read_ints(
        buffers.address(kind)?,
        operand.data_type,
        operand.element_count() as usize,
    )
}

/// Fully connected affine, with a selected bias column for multi-bias
/// layers and an optional active list over output rows
pub(super) fn affine(layer: &Layer, buffers: &LayerBuffers, ctx: &mut KernelContext<'_>) -> Result<()> {
    let view = ctx.view;
    let grouping = layer.grouping() as usize;
    let inputs = layer.input_elements() as usize;
    let outputs = layer.output_elements();

    let x = read_operand(layer, buffers, &view, OperandKind::Input)?;
    let w = read_operand(layer, buffers, &view, OperandKind::Weights)?;
    let bias = RowBias::read(layer, buffers, &view, outputs as usize)?;
    let rows = selected_rows(&view, buffers.active_list(), outputs)?;
    let chunk = ctx.mode.chunk(layer.grouping(), layer.input_precision());

    let mut accumulators = Vec::with_capacity(grouping * rows.len());
    for vector in x.chunks_exact(inputs).take(grouping) {
        for &row in &rows {
            let m = bias.multiplier(row);
            let weights = &w[row * inputs..(row + 1) * inputs];
            let sum = ctx.accumulate(weights.iter().zip(vector).map(|(w, x)| w * m * x), chunk);
            accumulators.push(sum + bias.value(row));
        }
    }
    let output = buffers.address(OperandKind::Output)?;
    store_outputs(layer, buffers, ctx, output, &accumulators)
}

/// Element-wise affine `out[g][i] = w[i] * x[g][i] + b[i]`
pub(super) fn diagonal(layer: &Layer, buffers: &LayerBuffers, ctx: &mut KernelContext<'_>) -> Result<()> {
    let view = ctx.view;
    let elements = layer.output_elements() as usize;

    let x = read_operand(layer, buffers, &view, OperandKind::Input)?;
    let w = read_operand(layer, buffers, &view, OperandKind::Weights)?;
    let bias = RowBias::read(layer, buffers, &view, elements)?;

    let accumulators: Vec<i64> = x
        .chunks_exact(elements)
        .flat_map(|vector| {
            vector
                .iter()
                .enumerate()
                .map(|(i, x)| w[i] * bias.multiplier(i) * x + bias.value(i))
                .collect::<Vec<_>>()
        })
        .collect();
    let output = buffers.address(OperandKind::Output)?;
    store_outputs(layer, buffers, ctx, output, &accumulators)
}

/// Recurrent affine
///
/// Vectors are processed in order. Vector `t` is concatenated with output
/// row `t - delay`, which for the first `delay` vectors lies in the
/// feedback area just before the output buffer. Each output row is stored
/// before the next vector is computed.
pub(super) fn recurrent(layer: &Layer, buffers: &LayerBuffers, ctx: &mut KernelContext<'_>) -> Result<()> {
    let LayerParams::Recurrent { delay } = *layer.params() else {
        return Err(GnaError::model_invalid("recurrent layer without delay"));
    };
    let view = ctx.view;
    let inputs = layer.input_elements() as usize;
    let outputs = layer.output_elements() as usize;
    let output_type = layer.required(OperandKind::Output)?.data_type;
    let row_bytes = u64::from(layer.output_row_bytes());

    let x = read_operand(layer, buffers, &view, OperandKind::Input)?;
    let w = read_operand(layer, buffers, &view, OperandKind::Weights)?;
    let bias = RowBias::read(layer, buffers, &view, outputs)?;
    let chunk = ctx.mode.chunk(layer.grouping(), layer.input_precision());

    let output = buffers.address(OperandKind::Output)?;
    let feedback = feedback_address(output, delay, layer.output_row_bytes())?;
    let columns = inputs + outputs;

    for (t, vector) in x.chunks_exact(inputs).enumerate() {
        let t = t as u64;
        let previous = view.read_ints(feedback + t * row_bytes, output_type, outputs)?;
        let mut accumulators = Vec::with_capacity(outputs);
        for row in 0..outputs {
            let m = bias.multiplier(row);
            let weights = &w[row * columns..(row + 1) * columns];
            let products = weights
                .iter()
                .zip(vector.iter().chain(&previous))
                .map(|(w, x)| w * m * x);
            let sum = ctx.accumulate(products, chunk);
            accumulators.push(sum + bias.value(row));
        }
        store_outputs(layer, buffers, ctx, output + t * row_bytes, &accumulators)?;
    }
    Ok(())
}
