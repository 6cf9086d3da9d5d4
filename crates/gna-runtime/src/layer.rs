// SPDX-License-Identifier: AGPL-3.0-only

//! Compiled layers
//!
//! A [`Layer`] is the runtime view of one model operation: its native kind,
//! resolved operand sizes and addresses, grouping and element counts. Layers
//! are derived once when a model is compiled and never change afterwards.

use std::collections::BTreeMap;

use gna_chip::limits::MAX_GROUPING;
use gna_chip::BUFFER_ALIGNMENT;
use gna_model::{
    ConvolutionParameters, DataType, OperandKind, Operation, OperationType, Parameters, PoolingMode,
    Tensor,
};

use crate::error::{GnaError, Result};

/// Native operation a layer maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LayerKind {
    /// Fully connected affine
    Affine,
    /// Affine with a selected bias vector
    AffineMultiBias,
    /// Element-wise affine
    Diagonal,
    /// Recurrent affine
    Recurrent,
    /// Convolution over a single row with one channel
    Convolution1D,
    /// General fused convolution
    Convolution2D,
    /// Sub-matrix copy
    Copy,
    /// Row-major to interleaved transposition
    Interleave,
    /// Interleaved to row-major transposition
    Deinterleave,
    /// Gaussian mixture scoring
    Gmm,
}

impl LayerKind {
    /// True for kinds with weights, bias and an optional activation
    pub fn is_affine_family(self) -> bool {
        matches!(
            self,
            Self::Affine
                | Self::AffineMultiBias
                | Self::Diagonal
                | Self::Recurrent
                | Self::Convolution1D
                | Self::Convolution2D
        )
    }
}

/// One resolved operand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperandConfig {
    /// Operand slot
    pub kind: OperandKind,
    /// Element type
    pub data_type: DataType,
    /// Dimensions
    pub dims: Vec<u32>,
    /// Address given in the model, if any
    pub address: Option<u64>,
    /// Size in bytes
    pub size: u32,
}

impl OperandConfig {
    fn from_tensor(kind: OperandKind, tensor: &Tensor) -> Result<Self> {
        let size = u32::try_from(tensor.size()).map_err(|_| GnaError::MemorySizeInvalid {
            size: tensor.size(),
        })?;
        if let Some(address) = tensor.data {
            check_buffer_alignment(address)?;
        }
        Ok(Self {
            kind,
            data_type: tensor.data_type,
            dims: tensor.shape.dims().to_vec(),
            address: tensor.data,
            size,
        })
    }

    /// Elements in the operand
    pub fn element_count(&self) -> u32 {
        self.dims.iter().product()
    }
}

/// Check that a buffer bound to a descriptor field is suitably aligned
///
/// # Errors
///
/// [`GnaError::MemoryAlignmentInvalid`] unless `address` is a multiple of
/// [`BUFFER_ALIGNMENT`].
pub fn check_buffer_alignment(address: u64) -> Result<()> {
    if address % u64::from(BUFFER_ALIGNMENT) == 0 {
        Ok(())
    } else {
        Err(GnaError::MemoryAlignmentInvalid {
            address,
            alignment: BUFFER_ALIGNMENT,
        })
    }
}

/// Element types a layer uses, checked against the per-generation tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataConfig {
    /// Input element type
    pub input: DataType,
    /// Weight element type, absent for copy and transposition
    pub weights: Option<DataType>,
    /// Bias element type
    pub bias: Option<DataType>,
    /// Output element type
    pub output: DataType,
    /// True when a PWL activation is attached
    pub activation: bool,
}

/// Geometry of a fused convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvolutionGeometry {
    /// Input `[height, width, channels]`
    pub input: [u32; 3],
    /// Filter count
    pub filter_count: u32,
    /// Filter `[height, width]`
    pub filter: [u32; 2],
    /// Convolution output `[height, width]` before pooling
    pub convolved: [u32; 2],
    /// Layer output `[height, width]`
    pub output: [u32; 2],
    /// Model parameters
    pub parameters: ConvolutionParameters,
}

impl ConvolutionGeometry {
    /// Pooling mode code written to the descriptor (0 none, 1 max, 2 sum)
    pub fn pooling_code(&self) -> u32 {
        match self.parameters.pooling.map(|p| p.mode) {
            None => 0,
            Some(PoolingMode::Max) => 1,
            Some(PoolingMode::Sum) => 2,
        }
    }
}

/// Kind-specific layer parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerParams {
    /// No parameters
    None,
    /// Selected bias column of a `[out, count]` bias matrix
    MultiBias {
        /// Selected column
        index: u32,
        /// Number of columns
        count: u32,
    },
    /// Feedback delay in vectors
    Recurrent {
        /// Delay, at least 1
        delay: u32,
    },
    /// Convolution geometry
    Convolution(ConvolutionGeometry),
    /// Copied region
    Copy {
        /// Rows copied
        rows: u32,
        /// Columns copied
        columns: u32,
    },
    /// GMM dimensions
    Gmm {
        /// States
        states: u32,
        /// Mixtures per state
        mixtures: u32,
        /// Feature vector length
        length: u32,
        /// Score clamp
        maximum_score: u32,
    },
}

/// Compiled layer
#[derive(Debug, Clone)]
pub struct Layer {
    index: u32,
    kind: LayerKind,
    operands: BTreeMap<OperandKind, OperandConfig>,
    grouping: u32,
    input_elements: u32,
    output_elements: u32,
    params: LayerParams,
}

impl Layer {
    /// Derive the runtime layer of a validated operation
    ///
    /// # Errors
    ///
    /// [`GnaError::MemoryAlignmentInvalid`] for a misaligned operand address,
    /// [`GnaError::MemorySizeInvalid`] for operands beyond 4 GiB and
    /// [`GnaError::ModelInvalid`] for parameters the operation type does not
    /// accept.
    pub fn from_operation(index: u32, operation: &Operation) -> Result<Self> {
        let operands = operation
            .operands
            .iter()
            .map(|(kind, tensor)| Ok((*kind, OperandConfig::from_tensor(*kind, tensor)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        let dims = |kind: OperandKind| {
            operands
                .get(&kind)
                .map(|o| o.dims.clone())
                .ok_or_else(|| GnaError::operand_invalid(kind, "missing"))
        };
        let input = dims(OperandKind::Input)?;
        let output = dims(OperandKind::Output)?;

        let (kind, grouping, input_elements, output_elements, params) =
            match (operation.operation_type, operation.parameters) {
                (OperationType::FullyConnectedAffine, Parameters::None) => {
                    (LayerKind::Affine, input[0], input[1], output[1], LayerParams::None)
                }
                (OperationType::FullyConnectedAffine, Parameters::Affine { bias_vector_index }) => {
                    let count = dims(OperandKind::Bias)?.get(1).copied().unwrap_or(1);
                    (
                        LayerKind::AffineMultiBias,
                        input[0],
                        input[1],
                        output[1],
                        LayerParams::MultiBias {
                            index: bias_vector_index,
                            count,
                        },
                    )
                }
                (OperationType::ElementWiseAffine, _) => {
                    (LayerKind::Diagonal, input[0], input[1], output[1], LayerParams::None)
                }
                (OperationType::RecurrentAffine, Parameters::Recurrent { delay }) => (
                    LayerKind::Recurrent,
                    input[0],
                    input[1],
                    output[1],
                    LayerParams::Recurrent { delay },
                ),
                (OperationType::Convolution, Parameters::Convolution(parameters)) => {
                    let geometry = convolution_geometry(&input, &dims(OperandKind::Weights)?, parameters)?;
                    let kind = if geometry.input[0] == 1 && geometry.input[2] == 1 {
                        LayerKind::Convolution1D
                    } else {
                        LayerKind::Convolution2D
                    };
                    (
                        kind,
                        1,
                        input.iter().product(),
                        output.iter().product(),
                        LayerParams::Convolution(geometry),
                    )
                }
                (OperationType::Copy, Parameters::Copy { rows, columns }) => (
                    LayerKind::Copy,
                    input[0],
                    input[1],
                    output[1],
                    LayerParams::Copy { rows, columns },
                ),
                (OperationType::Transposition, _) => {
                    if input[0] <= MAX_GROUPING {
                        (LayerKind::Interleave, input[0], input[1], input[1], LayerParams::None)
                    } else {
                        (LayerKind::Deinterleave, input[1], input[0], input[0], LayerParams::None)
                    }
                }
                (OperationType::Gmm, Parameters::Gmm { maximum_score }) => {
                    let means = dims(OperandKind::Means)?;
                    (
                        LayerKind::Gmm,
                        input[0],
                        input[1],
                        output[1],
                        LayerParams::Gmm {
                            states: means[0],
                            mixtures: means[1],
                            length: means[2],
                            maximum_score,
                        },
                    )
                }
                (operation_type, parameters) => {
                    return Err(GnaError::model_invalid(format!(
                        "{operation_type:?} does not take {parameters:?}"
                    )))
                }
            };

        Ok(Self {
            index,
            kind,
            operands,
            grouping,
            input_elements,
            output_elements,
            params,
        })
    }

    /// Position in the model
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Native kind
    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    /// Vectors processed together
    pub fn grouping(&self) -> u32 {
        self.grouping
    }

    /// Input elements per vector
    pub fn input_elements(&self) -> u32 {
        self.input_elements
    }

    /// Output elements per vector
    pub fn output_elements(&self) -> u32 {
        self.output_elements
    }

    /// Kind-specific parameters
    pub fn params(&self) -> &LayerParams {
        &self.params
    }

    /// Operand by slot
    pub fn operand(&self, kind: OperandKind) -> Option<&OperandConfig> {
        self.operands.get(&kind)
    }

    /// Operand by slot, failing when absent
    ///
    /// # Errors
    ///
    /// [`GnaError::OperandInvalid`] when the layer has no such operand.
    pub fn required(&self, kind: OperandKind) -> Result<&OperandConfig> {
        self.operand(kind)
            .ok_or_else(|| GnaError::operand_invalid(kind, format!("not used by {:?}", self.kind)))
    }

    /// All operands
    pub fn operands(&self) -> impl Iterator<Item = &OperandConfig> {
        self.operands.values()
    }

    /// True when a PWL activation is attached
    pub fn has_activation(&self) -> bool {
        self.operands.contains_key(&OperandKind::Activation)
    }

    /// Bytes per input element
    pub fn input_precision(&self) -> u32 {
        self.operand(OperandKind::Input).map_or(2, |o| o.data_type.size())
    }

    /// Bytes of one output vector
    pub fn output_row_bytes(&self) -> u32 {
        self.operand(OperandKind::Output)
            .map_or(0, |o| self.output_elements * o.data_type.size())
    }

    /// Element types used by the layer
    pub fn data_config(&self) -> DataConfig {
        let data_type = |kind| self.operand(kind).map(|o: &OperandConfig| o.data_type);
        DataConfig {
            input: data_type(OperandKind::Input).unwrap_or(DataType::Int16),
            weights: data_type(OperandKind::Weights),
            bias: data_type(OperandKind::Bias),
            output: data_type(OperandKind::Output).unwrap_or(DataType::Int32),
            activation: self.has_activation(),
        }
    }
}

fn convolution_geometry(
    input: &[u32],
    filters: &[u32],
    parameters: ConvolutionParameters,
) -> Result<ConvolutionGeometry> {
    let plane = [input[1], input[2]];
    let filter = [filters[1], filters[2]];
    let convolved = parameters
        .convolved_dims(plane, filter)
        .ok_or_else(|| GnaError::model_invalid("filter does not fit the input"))?;
    let output = parameters
        .output_dims(plane, filter)
        .ok_or_else(|| GnaError::model_invalid("pooling window does not fit"))?;
    Ok(ConvolutionGeometry {
        input: [input[1], input[2], input[3]],
        filter_count: filters[0],
        filter,
        convolved,
        output,
        parameters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gna_model::{Pooling, Tensor};

    fn affine() -> Operation {
        Operation::fully_connected_affine(
            Tensor::new(&[4, 16], DataType::Int16),
            Tensor::new(&[4, 8], DataType::Int32),
            Tensor::new(&[8, 16], DataType::Int16),
            Tensor::new(&[8], DataType::Int32),
        )
    }

    #[test]
    fn test_affine_layer() {
        let layer = Layer::from_operation(2, &affine()).unwrap();
        assert_eq!(layer.index(), 2);
        assert_eq!(layer.kind(), LayerKind::Affine);
        assert_eq!(layer.grouping(), 4);
        assert_eq!(layer.input_elements(), 16);
        assert_eq!(layer.output_elements(), 8);
        assert_eq!(layer.output_row_bytes(), 32);
        assert_eq!(layer.required(OperandKind::Weights).unwrap().size, 256);
        assert!(layer.required(OperandKind::Means).is_err());
    }

    #[test]
    fn test_multibias_layer() {
        let op = Operation::fully_connected_affine(
            Tensor::new(&[1, 16], DataType::Int16),
            Tensor::new(&[1, 8], DataType::Int32),
            Tensor::new(&[8, 16], DataType::Int16),
            Tensor::new(&[8, 3], DataType::Int32),
        )
        .with_bias_vector(2);
        let layer = Layer::from_operation(0, &op).unwrap();
        assert_eq!(layer.kind(), LayerKind::AffineMultiBias);
        assert_eq!(*layer.params(), LayerParams::MultiBias { index: 2, count: 3 });
    }

    #[test]
    fn test_misaligned_operand() {
        let mut op = affine();
        op.operands.insert(
            OperandKind::Input,
            Tensor::new(&[4, 16], DataType::Int16).with_data(0x1000 + 8),
        );
        assert!(matches!(
            Layer::from_operation(0, &op),
            Err(GnaError::MemoryAlignmentInvalid { alignment: 64, .. })
        ));
    }

    #[test]
    fn test_convolution_kinds() {
        let params = ConvolutionParameters {
            stride: [1, 1],
            zero_padding: [0, 0],
            pooling: None,
        };
        let one_d = Operation::convolution(
            Tensor::new(&[1, 1, 16, 1], DataType::Int16),
            Tensor::new(&[1, 1, 13, 2], DataType::Int32),
            Tensor::new(&[2, 1, 4, 1], DataType::Int16),
            Tensor::new(&[2], DataType::Int32),
            params,
        );
        let layer = Layer::from_operation(0, &one_d).unwrap();
        assert_eq!(layer.kind(), LayerKind::Convolution1D);
        assert_eq!(layer.input_elements(), 16);
        assert_eq!(layer.output_elements(), 26);

        let pooled = ConvolutionParameters {
            pooling: Some(Pooling {
                mode: PoolingMode::Max,
                window: [2, 2],
                stride: [2, 2],
            }),
            ..params
        };
        let two_d = Operation::convolution(
            Tensor::new(&[1, 4, 4, 2], DataType::Int16),
            Tensor::new(&[1, 1, 1, 3], DataType::Int32),
            Tensor::new(&[3, 3, 3, 2], DataType::Int16),
            Tensor::new(&[3], DataType::Int32),
            pooled,
        );
        let layer = Layer::from_operation(0, &two_d).unwrap();
        assert_eq!(layer.kind(), LayerKind::Convolution2D);
        let LayerParams::Convolution(g) = layer.params() else {
            panic!("expected convolution parameters");
        };
        assert_eq!(g.convolved, [2, 2]);
        assert_eq!(g.output, [1, 1]);
        assert_eq!(g.pooling_code(), 1);
    }

    #[test]
    fn test_transposition_direction() {
        let small = Operation::transposition(
            Tensor::new(&[4, 100], DataType::Int16),
            Tensor::new(&[100, 4], DataType::Int16),
        );
        let layer = Layer::from_operation(0, &small).unwrap();
        assert_eq!(layer.kind(), LayerKind::Interleave);
        assert_eq!(layer.grouping(), 4);

        let tall = Operation::transposition(
            Tensor::new(&[100, 4], DataType::Int16),
            Tensor::new(&[4, 100], DataType::Int16),
        );
        let layer = Layer::from_operation(0, &tall).unwrap();
        assert_eq!(layer.kind(), LayerKind::Deinterleave);
        assert_eq!(layer.grouping(), 4);
        assert_eq!(layer.input_elements(), 100);
    }
}
