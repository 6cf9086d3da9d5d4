// SPDX-License-Identifier: AGPL-3.0-only

//! Model validation tests
//!
//! Builds small but complete models the way a caller would.

use gna_model::{
    ConvolutionParameters, DataType, Model, ModelError, OperandKind, Operation, Pooling,
    PoolingMode, Tensor,
};

fn pwl(segments: u32) -> Tensor {
    Tensor::new(&[segments], DataType::PwlSegment)
}

#[test]
fn test_two_layer_network() {
    let hidden = Operation::fully_connected_affine(
        Tensor::new(&[4, 64], DataType::Int16),
        Tensor::new(&[4, 32], DataType::Int16),
        Tensor::new(&[32, 64], DataType::Int8),
        Tensor::new(&[32], DataType::CompoundBias),
    )
    .with_activation(pwl(8));
    let out = Operation::element_wise_affine(
        Tensor::new(&[4, 32], DataType::Int16),
        Tensor::new(&[4, 32], DataType::Int32),
        Tensor::new(&[32], DataType::Int16),
        Tensor::new(&[32], DataType::Int32),
    );
    let model = Model::new(vec![hidden, out]).expect("valid model");
    assert_eq!(model.operation_count(), 2);
}

#[test]
fn test_conv2d_with_sum_pooling() {
    let params = ConvolutionParameters {
        stride: [1, 1],
        zero_padding: [1, 1],
        pooling: Some(Pooling {
            mode: PoolingMode::Sum,
            window: [2, 2],
            stride: [2, 2],
        }),
    };
    let op = Operation::convolution(
        Tensor::new(&[1, 8, 8, 2], DataType::Int8),
        Tensor::new(&[1, 4, 4, 4], DataType::Int16),
        Tensor::new(&[4, 3, 3, 2], DataType::Int8),
        Tensor::new(&[4], DataType::Int32),
        params,
    )
    .with_activation(pwl(4));
    assert!(Model::new(vec![op]).is_ok());
}

#[test]
fn test_wrong_output_shape_reports_operation() {
    let op = Operation::transposition(
        Tensor::new(&[4, 10], DataType::Int16),
        Tensor::new(&[4, 10], DataType::Int16),
    );
    let err = Model::new(vec![op]).unwrap_err();
    let ModelError::Operation { index, source } = err else {
        panic!("expected operation error");
    };
    assert_eq!(index, 0);
    assert!(matches!(
        *source,
        ModelError::InvalidShape { operand: OperandKind::Output, .. }
    ));
}
