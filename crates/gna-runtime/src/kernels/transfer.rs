// SPDX-License-Identifier: AGPL-3.0-only

//! Data movement kernels: copy and transposition

use gna_model::OperandKind;

use super::affine::read_operand;
use super::{KernelContext, LayerBuffers};
use crate::error::{GnaError, Result};
use crate::layer::{Layer, LayerParams};

/// Copy the top-left `rows x columns` block, leaving the rest of the
/// output untouched
pub(super) fn copy(layer: &Layer, buffers: &LayerBuffers, ctx: &mut KernelContext<'_>) -> Result<()> {
    let LayerParams::Copy { rows, columns } = *layer.params() else {
        return Err(GnaError::model_invalid("copy layer without region"));
    };
    let view = ctx.view;
    let input = layer.required(OperandKind::Input)?;
    let output = layer.required(OperandKind::Output)?;
    let in_stride = input.dims[1] as usize;
    let out_stride = u64::from(output.dims[1] * output.data_type.size());
    let columns = columns as usize;

    let x = read_operand(layer, buffers, &view, OperandKind::Input)?;
    let base = buffers.address(OperandKind::Output)?;
    for (r, row) in x.chunks_exact(in_stride).take(rows as usize).enumerate() {
        view.write_ints(base + r as u64 * out_stride, output.data_type, &row[..columns])?;
    }
    Ok(())
}

/// `out[j][i] = in[i][j]`
pub(super) fn transpose(layer: &Layer, buffers: &LayerBuffers, ctx: &mut KernelContext<'_>) -> Result<()> {
    let view = ctx.view;
    let input = layer.required(OperandKind::Input)?;
    let (rows, columns) = (input.dims[0] as usize, input.dims[1] as usize);
    let x = read_operand(layer, buffers, &view, OperandKind::Input)?;
    let transposed: Vec<i64> = (0..columns)
        .flat_map(|j| (0..rows).map(move |i| (i, j)))
        .map(|(i, j)| x[i * columns + j])
        .collect();
    view.write_ints(buffers.address(OperandKind::Output)?, input.data_type, &transposed)
}
