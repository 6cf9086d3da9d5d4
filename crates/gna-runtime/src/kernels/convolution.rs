// SPDX-License-Identifier: AGPL-3.0-only

//! Fused convolution: convolve, pool, activate
//!
//! Input is `[height, width, channels]`, filters are
//! `[count, height, width, channels]` and the output is
//! `[height, width, count]`. Padding adds zeros on both sides. Convolution
//! and pooling results are saturated to 32 bits before activation.

use gna_model::{DataType, OperandKind, PoolingMode};

use super::affine::{read_operand, RowBias};
use super::{store_outputs, KernelContext, LayerBuffers};
use crate::error::{GnaError, Result};
use crate::layer::{ConvolutionGeometry, Layer, LayerParams};

pub(super) fn convolution(layer: &Layer, buffers: &LayerBuffers, ctx: &mut KernelContext<'_>) -> Result<()> {
    let LayerParams::Convolution(geometry) = *layer.params() else {
        return Err(GnaError::model_invalid("convolution layer without geometry"));
    };
    let view = ctx.view;
    let x = read_operand(layer, buffers, &view, OperandKind::Input)?;
    let w = read_operand(layer, buffers, &view, OperandKind::Weights)?;
    let bias = RowBias::read(layer, buffers, &view, geometry.filter_count as usize)?;
    let chunk = ctx.mode.chunk(1, layer.input_precision());

    let convolved = convolve(&geometry, &x, &w, &bias, chunk, ctx);
    let pooled = match geometry.parameters.pooling {
        None => convolved,
        Some(pooling) => pool(&geometry, pooling.mode, pooling.window, pooling.stride, &convolved, ctx),
    };
    let output = buffers.address(OperandKind::Output)?;
    store_outputs(layer, buffers, ctx, output, &pooled)
}

/// `[convolved height, convolved width, filters]`, saturated to 32 bits
fn convolve(
    g: &ConvolutionGeometry,
    x: &[i64],
    w: &[i64],
    bias: &RowBias,
    chunk: Option<usize>,
    ctx: &mut KernelContext<'_>,
) -> Vec<i64> {
    let [height, width, channels] = g.input.map(|d| d as usize);
    let [fh, fw] = g.filter.map(|d| d as usize);
    let [ch, cw] = g.convolved.map(|d| d as usize);
    let [sy, sx] = g.parameters.stride.map(|d| d as usize);
    let [py, px] = g.parameters.zero_padding.map(|d| d as usize);
    let filters = g.filter_count as usize;
    let filter_size = fh * fw * channels;

    let mut out = Vec::with_capacity(ch * cw * filters);
    for oy in 0..ch {
        for ox in 0..cw {
            for f in 0..filters {
                let kernel = &w[f * filter_size..(f + 1) * filter_size];
                let m = bias.multiplier(f);
                let products = (0..fh).flat_map(|ky| (0..fw).map(move |kx| (ky, kx))).flat_map(|(ky, kx)| {
                    let iy = (oy * sy + ky).checked_sub(py).filter(|&y| y < height);
                    let ix = (ox * sx + kx).checked_sub(px).filter(|&x| x < width);
                    (0..channels).map(move |c| match (iy, ix) {
                        (Some(iy), Some(ix)) => {
                            kernel[(ky * fw + kx) * channels + c] * m * x[(iy * width + ix) * channels + c]
                        }
                        _ => 0,
                    })
                });
                let sum = ctx.accumulate(products, chunk) + bias.value(f);
                out.push(ctx.saturate(sum, DataType::Int32));
            }
        }
    }
    out
}

fn pool(
    g: &ConvolutionGeometry,
    mode: PoolingMode,
    window: [u32; 2],
    stride: [u32; 2],
    convolved: &[i64],
    ctx: &mut KernelContext<'_>,
) -> Vec<i64> {
    let [_, cw] = g.convolved.map(|d| d as usize);
    let [oh, ow] = g.output.map(|d| d as usize);
    let [wh, ww] = window.map(|d| d as usize);
    let [sy, sx] = stride.map(|d| d as usize);
    let filters = g.filter_count as usize;

    let mut out = Vec::with_capacity(oh * ow * filters);
    for oy in 0..oh {
        for ox in 0..ow {
            for f in 0..filters {
                let values = (0..wh)
                    .flat_map(|ky| (0..ww).map(move |kx| (ky, kx)))
                    .map(|(ky, kx)| convolved[((oy * sy + ky) * cw + ox * sx + kx) * filters + f]);
                let value = match mode {
                    PoolingMode::Max => values.max().unwrap_or(0),
                    PoolingMode::Sum => {
                        let sum = values.sum();
                        ctx.saturate(sum, DataType::Int32)
                    }
                };
                out.push(value);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::super::testing::Buffers;
    use super::super::{execute, ConsistencyMode};
    use super::*;
    use crate::request_config::RequestConfiguration;
    use gna_model::{ConvolutionParameters, Operation, Pooling, Tensor};

    struct Fixture {
        b: Buffers,
        out: u64,
        layer: Layer,
    }

    fn fixture(
        input: &[u32],
        values: &[i64],
        filters: &[u32],
        weights: &[i64],
        output: &[u32],
        parameters: ConvolutionParameters,
    ) -> Fixture {
        let mut b = Buffers::new();
        let x = b.ints(DataType::Int16, values);
        let w = b.ints(DataType::Int16, weights);
        let bias = b.ints(DataType::Int32, &vec![0; filters[0] as usize]);
        let count: u32 = output.iter().product();
        let out = b.zeroed(count * 4);
        let op = Operation::convolution(
            Tensor::new(input, DataType::Int16).with_data(x),
            Tensor::new(output, DataType::Int32).with_data(out),
            Tensor::new(filters, DataType::Int16).with_data(w),
            Tensor::new(&[filters[0]], DataType::Int32).with_data(bias),
            parameters,
        );
        let layer = Layer::from_operation(0, &op).unwrap();
        Fixture { b, out, layer }
    }

    fn run(f: &Fixture) -> Vec<i64> {
        let config = RequestConfiguration::new(0, 0);
        let buffers = LayerBuffers::resolve(&f.layer, &config).unwrap();
        let mut ctx = KernelContext::new(f.b.view(), ConsistencyMode::Generic);
        execute(&f.layer, &buffers, &mut ctx).unwrap();
        let count = f.layer.output_elements() as usize;
        f.b.view().read_ints(f.out, DataType::Int32, count).unwrap()
    }

    #[test]
    fn test_one_dimensional() {
        let f = fixture(
            &[1, 1, 4, 1],
            &[1, 2, 3, 4],
            &[1, 1, 2, 1],
            &[1, 1],
            &[1, 1, 3, 1],
            ConvolutionParameters::default(),
        );
        assert_eq!(run(&f), vec![3, 5, 7]);
    }

    #[test]
    fn test_zero_padding() {
        let params = ConvolutionParameters {
            zero_padding: [0, 1],
            ..ConvolutionParameters::default()
        };
        let f = fixture(&[1, 1, 4, 1], &[1, 2, 3, 4], &[1, 1, 2, 1], &[1, 1], &[1, 1, 5, 1], params);
        assert_eq!(run(&f), vec![1, 3, 5, 7, 4]);
    }

    #[test]
    fn test_max_pooling() {
        let params = ConvolutionParameters {
            pooling: Some(Pooling {
                mode: PoolingMode::Max,
                window: [1, 2],
                stride: [1, 1],
            }),
            ..ConvolutionParameters::default()
        };
        let f = fixture(&[1, 1, 4, 1], &[1, 2, 3, 4], &[1, 1, 2, 1], &[1, 1], &[1, 1, 2, 1], params);
        assert_eq!(run(&f), vec![5, 7]);
    }

    #[test]
    fn test_two_dimensional_with_sum_pooling() {
        let values: Vec<i64> = (1..=9).collect();
        let plain = fixture(
            &[1, 3, 3, 1],
            &values,
            &[1, 2, 2, 1],
            &[1, 1, 1, 1],
            &[1, 2, 2, 1],
            ConvolutionParameters::default(),
        );
        assert_eq!(run(&plain), vec![12, 16, 24, 28]);

        let params = ConvolutionParameters {
            pooling: Some(Pooling {
                mode: PoolingMode::Sum,
                window: [2, 2],
                stride: [2, 2],
            }),
            ..ConvolutionParameters::default()
        };
        let pooled = fixture(&[1, 3, 3, 1], &values, &[1, 2, 2, 1], &[1, 1, 1, 1], &[1, 1, 1, 1], params);
        assert_eq!(run(&pooled), vec![80]);
    }

    #[test]
    fn test_channels_and_filters_interleave() {
        // Two channels, two filters picking one channel each.
        let f = fixture(
            &[1, 1, 2, 2],
            &[1, 10, 2, 20],
            &[2, 1, 1, 2],
            &[1, 0, 0, 1],
            &[1, 1, 2, 2],
            ConvolutionParameters::default(),
        );
        assert_eq!(run(&f), vec![1, 10, 2, 20]);
    }
}
