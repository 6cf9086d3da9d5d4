// SPDX-License-Identifier: AGPL-3.0-only

//! Gaussian mixture scoring
//!
//! The score of a state is the smallest weighted distance over its
//! mixtures: `gconst + sum((mean - x)^2 * inverse_covariance)`. Scores are
//! 32-bit and clamped to the layer's maximum score.

use gna_model::{DataType, OperandKind};

use super::affine::read_operand;
use super::{selected_rows, KernelContext, LayerBuffers};
use crate::error::{GnaError, Result};
use crate::layer::{Layer, LayerParams};

pub(super) fn gmm(layer: &Layer, buffers: &LayerBuffers, ctx: &mut KernelContext<'_>) -> Result<()> {
    let LayerParams::Gmm {
        states,
        mixtures,
        length,
        maximum_score,
    } = *layer.params()
    else {
        return Err(GnaError::model_invalid("GMM layer without dimensions"));
    };
    let view = ctx.view;
    let (mixtures, length) = (mixtures as usize, length as usize);

    let x = read_operand(layer, buffers, &view, OperandKind::Input)?;
    let means = read_operand(layer, buffers, &view, OperandKind::Means)?;
    let variances = read_operand(layer, buffers, &view, OperandKind::InverseCovariances)?;
    let constants = read_operand(layer, buffers, &view, OperandKind::GaussianConstants)?;
    let selected = selected_rows(&view, buffers.active_list(), states)?;

    let mut scores = Vec::with_capacity(layer.grouping() as usize * selected.len());
    for vector in x.chunks_exact(length).take(layer.grouping() as usize) {
        for &state in &selected {
            let best = (0..mixtures)
                .map(|m| {
                    let at = (state * mixtures + m) * length;
                    let distance: i64 = vector
                        .iter()
                        .zip(&means[at..at + length])
                        .zip(&variances[at..at + length])
                        .map(|((x, mean), ivar)| (mean - x) * (mean - x) * ivar)
                        .sum();
                    constants[state * mixtures + m] + distance
                })
                .min()
                .unwrap_or(0);
            let score = ctx.saturate(best, DataType::Uint32);
            scores.push(score.min(i64::from(maximum_score)));
        }
    }
    view.write_ints(buffers.address(OperandKind::Output)?, DataType::Uint32, &scores)
}

#[cfg(test)]
mod tests {
    use super::super::testing::Buffers;
    use super::super::{execute, ConsistencyMode};
    use super::*;
    use crate::request_config::RequestConfiguration;
    use gna_model::{Operation, Tensor};

    struct Fixture {
        b: Buffers,
        out: u64,
        layer: Layer,
    }

    /// Two states of two mixtures over a two-element feature vector
    fn fixture(features: &[i64], maximum_score: u32) -> Fixture {
        let mut b = Buffers::new();
        let x = b.ints(DataType::Uint8, features);
        let means = b.ints(DataType::Uint8, &[0, 0, 10, 10, 5, 5, 200, 200]);
        let ivars = b.ints(DataType::Uint8, &[1, 1, 1, 1, 2, 2, 255, 255]);
        let consts = b.ints(DataType::Uint32, &[0, 3, 1, u32::MAX.into()]);
        let out = b.zeroed(8);
        let op = Operation::gmm(
            Tensor::new(&[1, 2], DataType::Uint8).with_data(x),
            Tensor::new(&[1, 2], DataType::Uint32).with_data(out),
            Tensor::new(&[2, 2, 2], DataType::Uint8).with_data(means),
            Tensor::new(&[2, 2, 2], DataType::Uint8).with_data(ivars),
            Tensor::new(&[2, 2], DataType::Uint32).with_data(consts),
            maximum_score,
        );
        let layer = Layer::from_operation(0, &op).unwrap();
        Fixture { b, out, layer }
    }

    fn run(f: &Fixture, config: &RequestConfiguration) -> (Vec<i64>, u32) {
        let buffers = LayerBuffers::resolve(&f.layer, config).unwrap();
        let mut ctx = KernelContext::new(f.b.view(), ConsistencyMode::Generic);
        execute(&f.layer, &buffers, &mut ctx).unwrap();
        let scores = f.b.view().read_ints(f.out, DataType::Uint32, 2).unwrap();
        (scores, ctx.saturations())
    }

    #[test]
    fn test_scores_take_best_mixture() {
        let f = fixture(&[9, 9], u32::MAX);
        let (scores, saturations) = run(&f, &RequestConfiguration::new(0, 0));
        // State 0: min(0 + 81 + 81, 3 + 1 + 1); state 1: min(1 + 32 + 32, huge).
        assert_eq!(scores, vec![5, 65]);
        assert_eq!(saturations, 0);
    }

    #[test]
    fn test_maximum_score_clamps() {
        let f = fixture(&[9, 9], 10);
        let (scores, _) = run(&f, &RequestConfiguration::new(0, 0));
        assert_eq!(scores, vec![5, 10]);
    }

    #[test]
    fn test_active_list_selects_states() {
        let mut f = fixture(&[9, 9], u32::MAX);
        let list = f.b.ints(DataType::Uint32, &[1]);
        let mut config = RequestConfiguration::new(0, 0);
        config
            .set_active_list(&f.layer, list, 1, f.b.memory(list))
            .unwrap();
        let (scores, _) = run(&f, &config);
        assert_eq!(scores[0], 65);
    }
}
