// SPDX-License-Identifier: AGPL-3.0-only

//! Operations and their operands
//!
//! Shape conventions (outermost dimension first):
//!
//! | Operation | Input | Output | Weights | Bias |
//! |-----------|-------|--------|---------|------|
//! | FullyConnectedAffine | `[g, in]` | `[g, out]` | `[out, in]` | `[out]` or `[out, k]` |
//! | ElementWiseAffine | `[g, n]` | `[g, n]` | `[n]` | `[n]` |
//! | RecurrentAffine | `[g, in]` | `[g, out]` | `[out, in + out]` | `[out]` |
//! | Convolution | `[1, h, w, c]` | `[1, oh, ow, f]` | `[f, fh, fw, c]` | `[f]` |
//! | Copy | `[r, in]` | `[r, out]` | | |
//! | Transposition | `[a, b]` | `[b, a]` | | |
//! | Gmm | `[g, len]` | `[g, states]` | means / inverse covariances `[states, mix, len]`, constants `[states, mix]` | |
//!
//! `g` is the grouping, the number of vectors scored together (1..=8).

use std::collections::BTreeMap;

use crate::{DataType, ModelError, Result, Tensor};

/// Largest grouping accepted by grouped operations
pub const MAX_GROUPING: u32 = 8;

/// Operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    /// Fully connected affine, optionally with a selectable bias vector
    FullyConnectedAffine,
    /// Element-wise (diagonal) affine
    ElementWiseAffine,
    /// Recurrent affine with output feedback
    RecurrentAffine,
    /// Fused convolution with optional pooling
    Convolution,
    /// Copy of a sub-matrix
    Copy,
    /// Matrix transposition
    Transposition,
    /// Gaussian mixture model scoring
    Gmm,
}

/// Operand slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperandKind {
    /// Input activations
    Input,
    /// Output activations
    Output,
    /// Weights or convolution filters
    Weights,
    /// Bias
    Bias,
    /// PWL activation segments
    Activation,
    /// Per-row weight scale factors of a multi-bias affine
    WeightScaleFactors,
    /// GMM means
    Means,
    /// GMM inverse covariances
    InverseCovariances,
    /// GMM gaussian constants
    GaussianConstants,
}

/// Pooling kind of a fused convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolingMode {
    /// Maximum over the window
    Max,
    /// Saturating sum over the window
    Sum,
}

/// Pooling applied after convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pooling {
    /// Pooling kind
    pub mode: PoolingMode,
    /// Window `[height, width]`
    pub window: [u32; 2],
    /// Stride `[height, width]`
    pub stride: [u32; 2],
}

/// Convolution parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConvolutionParameters {
    /// Stride `[height, width]`
    pub stride: [u32; 2],
    /// Zero padding `[height, width]`
    pub zero_padding: [u32; 2],
    /// Optional fused pooling
    pub pooling: Option<Pooling>,
}

impl Default for ConvolutionParameters {
    fn default() -> Self {
        Self {
            stride: [1, 1],
            zero_padding: [0, 0],
            pooling: None,
        }
    }
}

impl ConvolutionParameters {
    /// Spatial size after convolution (before pooling) for an input and
    /// filter size, or `None` when the filter does not fit.
    pub fn convolved_dims(&self, input: [u32; 2], filter: [u32; 2]) -> Option<[u32; 2]> {
        let mut out = [0; 2];
        for i in 0..2 {
            let padded = input[i] + 2 * self.zero_padding[i];
            if self.stride[i] == 0 || filter[i] == 0 || filter[i] > padded {
                return None;
            }
            out[i] = (padded - filter[i]) / self.stride[i] + 1;
        }
        Some(out)
    }

    /// Spatial size of the final output, after optional pooling.
    pub fn output_dims(&self, input: [u32; 2], filter: [u32; 2]) -> Option<[u32; 2]> {
        let conv = self.convolved_dims(input, filter)?;
        let Some(pool) = self.pooling else {
            return Some(conv);
        };
        let mut out = [0; 2];
        for i in 0..2 {
            if pool.stride[i] == 0 || pool.window[i] == 0 || pool.window[i] > conv[i] {
                return None;
            }
            out[i] = (conv[i] - pool.window[i]) / pool.stride[i] + 1;
        }
        Some(out)
    }
}

/// Type-specific parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parameters {
    /// No parameters
    None,
    /// Bias vector selection of a multi-bias affine
    Affine {
        /// Column of the `[out, k]` bias tensor to use
        bias_vector_index: u32,
    },
    /// Recurrent feedback delay in vectors
    Recurrent {
        /// Delay, at least 1
        delay: u32,
    },
    /// Convolution parameters
    Convolution(ConvolutionParameters),
    /// Copied region
    Copy {
        /// Rows to copy
        rows: u32,
        /// Columns to copy
        columns: u32,
    },
    /// GMM score saturation limit
    Gmm {
        /// Scores are clamped to this value
        maximum_score: u32,
    },
}

/// One operation of a model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// Operation type
    pub operation_type: OperationType,
    /// Operands by slot
    pub operands: BTreeMap<OperandKind, Tensor>,
    /// Type-specific parameters
    pub parameters: Parameters,
}

impl Operation {
    fn with_operands(
        operation_type: OperationType,
        operands: impl IntoIterator<Item = (OperandKind, Tensor)>,
        parameters: Parameters,
    ) -> Self {
        Self {
            operation_type,
            operands: operands.into_iter().collect(),
            parameters,
        }
    }

    /// Fully connected affine `output = weights · input + bias`
    pub fn fully_connected_affine(input: Tensor, output: Tensor, weights: Tensor, bias: Tensor) -> Self {
        Self::with_operands(
            OperationType::FullyConnectedAffine,
            [
                (OperandKind::Input, input),
                (OperandKind::Output, output),
                (OperandKind::Weights, weights),
                (OperandKind::Bias, bias),
            ],
            Parameters::None,
        )
    }

    /// Element-wise affine `output[i] = weights[i] * input[i] + bias[i]`
    pub fn element_wise_affine(input: Tensor, output: Tensor, weights: Tensor, bias: Tensor) -> Self {
        Self::with_operands(
            OperationType::ElementWiseAffine,
            [
                (OperandKind::Input, input),
                (OperandKind::Output, output),
                (OperandKind::Weights, weights),
                (OperandKind::Bias, bias),
            ],
            Parameters::None,
        )
    }

    /// Recurrent affine; the activation is mandatory
    pub fn recurrent_affine(
        input: Tensor,
        output: Tensor,
        weights: Tensor,
        bias: Tensor,
        activation: Tensor,
        delay: u32,
    ) -> Self {
        Self::with_operands(
            OperationType::RecurrentAffine,
            [
                (OperandKind::Input, input),
                (OperandKind::Output, output),
                (OperandKind::Weights, weights),
                (OperandKind::Bias, bias),
                (OperandKind::Activation, activation),
            ],
            Parameters::Recurrent { delay },
        )
    }

    /// Fused convolution
    pub fn convolution(
        input: Tensor,
        output: Tensor,
        filters: Tensor,
        bias: Tensor,
        parameters: ConvolutionParameters,
    ) -> Self {
        Self::with_operands(
            OperationType::Convolution,
            [
                (OperandKind::Input, input),
                (OperandKind::Output, output),
                (OperandKind::Weights, filters),
                (OperandKind::Bias, bias),
            ],
            Parameters::Convolution(parameters),
        )
    }

    /// Copy `rows × columns` from the top-left of input to output
    pub fn copy(input: Tensor, output: Tensor, rows: u32, columns: u32) -> Self {
        Self::with_operands(
            OperationType::Copy,
            [(OperandKind::Input, input), (OperandKind::Output, output)],
            Parameters::Copy { rows, columns },
        )
    }

    /// Transposition of a matrix
    pub fn transposition(input: Tensor, output: Tensor) -> Self {
        Self::with_operands(
            OperationType::Transposition,
            [(OperandKind::Input, input), (OperandKind::Output, output)],
            Parameters::None,
        )
    }

    /// Gaussian mixture scoring
    pub fn gmm(
        input: Tensor,
        output: Tensor,
        means: Tensor,
        inverse_covariances: Tensor,
        constants: Tensor,
        maximum_score: u32,
    ) -> Self {
        Self::with_operands(
            OperationType::Gmm,
            [
                (OperandKind::Input, input),
                (OperandKind::Output, output),
                (OperandKind::Means, means),
                (OperandKind::InverseCovariances, inverse_covariances),
                (OperandKind::GaussianConstants, constants),
            ],
            Parameters::Gmm { maximum_score },
        )
    }

    /// Attach a PWL activation
    #[must_use]
    pub fn with_activation(mut self, activation: Tensor) -> Self {
        self.operands.insert(OperandKind::Activation, activation);
        self
    }

    /// Attach per-row weight scale factors
    #[must_use]
    pub fn with_weight_scale_factors(mut self, scales: Tensor) -> Self {
        self.operands.insert(OperandKind::WeightScaleFactors, scales);
        self
    }

    /// Select the bias vector of a multi-bias affine
    #[must_use]
    pub fn with_bias_vector(mut self, bias_vector_index: u32) -> Self {
        self.parameters = Parameters::Affine { bias_vector_index };
        self
    }

    /// Operand by slot
    pub fn operand(&self, kind: OperandKind) -> Option<&Tensor> {
        self.operands.get(&kind)
    }

    fn required(&self, kind: OperandKind) -> Result<&Tensor> {
        self.operand(kind).ok_or(ModelError::MissingOperand {
            operation: self.operation_type,
            operand: kind,
        })
    }

    fn allowed_operands(&self) -> &'static [OperandKind] {
        use OperandKind as K;
        match self.operation_type {
            OperationType::FullyConnectedAffine => &[
                K::Input,
                K::Output,
                K::Weights,
                K::Bias,
                K::Activation,
                K::WeightScaleFactors,
            ],
            OperationType::ElementWiseAffine
            | OperationType::RecurrentAffine
            | OperationType::Convolution => {
                &[K::Input, K::Output, K::Weights, K::Bias, K::Activation]
            }
            OperationType::Copy | OperationType::Transposition => &[K::Input, K::Output],
            OperationType::Gmm => &[
                K::Input,
                K::Output,
                K::Means,
                K::InverseCovariances,
                K::GaussianConstants,
            ],
        }
    }

    /// Validate operands, shapes, data types and parameters
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found.
    pub fn validate(&self) -> Result<()> {
        let allowed = self.allowed_operands();
        for (kind, tensor) in &self.operands {
            if !allowed.contains(kind) {
                return Err(ModelError::UnexpectedOperand {
                    operation: self.operation_type,
                    operand: *kind,
                });
            }
            if !tensor.shape.is_valid() {
                return Err(ModelError::invalid_shape(
                    *kind,
                    format!("{} is empty or has a zero dimension", tensor.shape),
                ));
            }
            check_data_type(self.operation_type, *kind, tensor.data_type)?;
        }
        if let Some(activation) = self.operand(OperandKind::Activation) {
            expect_rank(OperandKind::Activation, activation, 1)?;
        }
        match self.operation_type {
            OperationType::FullyConnectedAffine => self.validate_affine(),
            OperationType::ElementWiseAffine => self.validate_diagonal(),
            OperationType::RecurrentAffine => self.validate_recurrent(),
            OperationType::Convolution => self.validate_convolution(),
            OperationType::Copy => self.validate_copy(),
            OperationType::Transposition => self.validate_transposition(),
            OperationType::Gmm => self.validate_gmm(),
        }
    }

    fn grouped_io(&self) -> Result<(u32, u32, u32)> {
        let input = self.required(OperandKind::Input)?;
        let output = self.required(OperandKind::Output)?;
        expect_rank(OperandKind::Input, input, 2)?;
        expect_rank(OperandKind::Output, output, 2)?;
        let grouping = input.shape.dim(0);
        if grouping > MAX_GROUPING {
            return Err(ModelError::invalid_shape(
                OperandKind::Input,
                format!("grouping {grouping} exceeds {MAX_GROUPING}"),
            ));
        }
        if output.shape.dim(0) != grouping {
            return Err(ModelError::invalid_shape(
                OperandKind::Output,
                format!("expected {grouping} vectors, got {}", output.shape.dim(0)),
            ));
        }
        Ok((grouping, input.shape.dim(1), output.shape.dim(1)))
    }

    fn validate_affine(&self) -> Result<()> {
        let (_, inputs, outputs) = self.grouped_io()?;
        let weights = self.required(OperandKind::Weights)?;
        expect_dims(OperandKind::Weights, weights, &[outputs, inputs])?;
        let bias = self.required(OperandKind::Bias)?;
        match (bias.shape.rank(), self.parameters) {
            (1, Parameters::None) => expect_dims(OperandKind::Bias, bias, &[outputs]),
            (2, Parameters::Affine { bias_vector_index }) => {
                if bias.shape.dim(0) != outputs {
                    return Err(ModelError::invalid_shape(
                        OperandKind::Bias,
                        format!("expected {outputs} rows"),
                    ));
                }
                if bias_vector_index >= bias.shape.dim(1) {
                    return Err(ModelError::invalid_parameters(format!(
                        "bias vector {bias_vector_index} out of {}",
                        bias.shape.dim(1)
                    )));
                }
                if let Some(scales) = self.operand(OperandKind::WeightScaleFactors) {
                    expect_dims(OperandKind::WeightScaleFactors, scales, &[outputs])?;
                }
                Ok(())
            }
            (2, _) => Err(ModelError::invalid_parameters(
                "a bias matrix requires a bias vector index",
            )),
            _ => Err(ModelError::invalid_shape(
                OperandKind::Bias,
                "expected rank 1, or rank 2 with a bias vector index",
            )),
        }
    }

    fn validate_diagonal(&self) -> Result<()> {
        let (_, inputs, outputs) = self.grouped_io()?;
        if inputs != outputs {
            return Err(ModelError::invalid_shape(
                OperandKind::Output,
                "element-wise affine keeps the vector length",
            ));
        }
        expect_dims(OperandKind::Weights, self.required(OperandKind::Weights)?, &[outputs])?;
        expect_dims(OperandKind::Bias, self.required(OperandKind::Bias)?, &[outputs])
    }

    fn validate_recurrent(&self) -> Result<()> {
        let (grouping, inputs, outputs) = self.grouped_io()?;
        self.required(OperandKind::Activation)?;
        expect_dims(
            OperandKind::Weights,
            self.required(OperandKind::Weights)?,
            &[outputs, inputs + outputs],
        )?;
        expect_dims(OperandKind::Bias, self.required(OperandKind::Bias)?, &[outputs])?;
        match self.parameters {
            Parameters::Recurrent { delay } if delay >= 1 && delay <= grouping => Ok(()),
            Parameters::Recurrent { delay } => Err(ModelError::invalid_parameters(format!(
                "delay {delay} must be within 1..={grouping}"
            ))),
            _ => Err(ModelError::invalid_parameters("recurrent delay missing")),
        }
    }

    fn validate_convolution(&self) -> Result<()> {
        let Parameters::Convolution(params) = self.parameters else {
            return Err(ModelError::invalid_parameters("convolution parameters missing"));
        };
        let input = self.required(OperandKind::Input)?;
        let filters = self.required(OperandKind::Weights)?;
        let output = self.required(OperandKind::Output)?;
        expect_rank(OperandKind::Input, input, 4)?;
        expect_rank(OperandKind::Weights, filters, 4)?;
        if input.shape.dim(0) != 1 {
            return Err(ModelError::invalid_shape(OperandKind::Input, "batch must be 1"));
        }
        let channels = input.shape.dim(3);
        if filters.shape.dim(3) != channels {
            return Err(ModelError::invalid_shape(
                OperandKind::Weights,
                format!("filter depth must equal {channels} input channels"),
            ));
        }
        let filter_count = filters.shape.dim(0);
        expect_dims(OperandKind::Bias, self.required(OperandKind::Bias)?, &[filter_count])?;
        let dims = params
            .output_dims(
                [input.shape.dim(1), input.shape.dim(2)],
                [filters.shape.dim(1), filters.shape.dim(2)],
            )
            .ok_or_else(|| ModelError::invalid_parameters("filter or pooling window does not fit"))?;
        expect_dims(OperandKind::Output, output, &[1, dims[0], dims[1], filter_count])
    }

    fn validate_copy(&self) -> Result<()> {
        let input = self.required(OperandKind::Input)?;
        let output = self.required(OperandKind::Output)?;
        expect_rank(OperandKind::Input, input, 2)?;
        expect_rank(OperandKind::Output, output, 2)?;
        if input.data_type != output.data_type {
            return Err(ModelError::InvalidDataType {
                operand: OperandKind::Output,
                data_type: output.data_type,
            });
        }
        let Parameters::Copy { rows, columns } = self.parameters else {
            return Err(ModelError::invalid_parameters("copy region missing"));
        };
        let fits = rows >= 1
            && columns >= 1
            && rows <= input.shape.dim(0).min(output.shape.dim(0))
            && columns <= input.shape.dim(1).min(output.shape.dim(1))
            && rows <= MAX_GROUPING;
        if fits {
            Ok(())
        } else {
            Err(ModelError::invalid_parameters(format!(
                "copy region {rows}x{columns} does not fit input {} / output {}",
                input.shape, output.shape
            )))
        }
    }

    fn validate_transposition(&self) -> Result<()> {
        let input = self.required(OperandKind::Input)?;
        let output = self.required(OperandKind::Output)?;
        expect_rank(OperandKind::Input, input, 2)?;
        let (rows, columns) = (input.shape.dim(0), input.shape.dim(1));
        expect_dims(OperandKind::Output, output, &[columns, rows])?;
        if input.data_type != output.data_type {
            return Err(ModelError::InvalidDataType {
                operand: OperandKind::Output,
                data_type: output.data_type,
            });
        }
        if rows > MAX_GROUPING && columns > MAX_GROUPING {
            return Err(ModelError::invalid_shape(
                OperandKind::Input,
                format!("one side must be at most {MAX_GROUPING}"),
            ));
        }
        Ok(())
    }

    fn validate_gmm(&self) -> Result<()> {
        let (_, length, states) = self.grouped_io()?;
        let means = self.required(OperandKind::Means)?;
        expect_rank(OperandKind::Means, means, 3)?;
        let mixtures = means.shape.dim(1);
        expect_dims(OperandKind::Means, means, &[states, mixtures, length])?;
        expect_dims(
            OperandKind::InverseCovariances,
            self.required(OperandKind::InverseCovariances)?,
            &[states, mixtures, length],
        )?;
        expect_dims(
            OperandKind::GaussianConstants,
            self.required(OperandKind::GaussianConstants)?,
            &[states, mixtures],
        )?;
        match self.parameters {
            Parameters::Gmm { maximum_score } if maximum_score > 0 => Ok(()),
            _ => Err(ModelError::invalid_parameters("GMM maximum score must be non-zero")),
        }
    }
}

fn expect_rank(operand: OperandKind, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.shape.rank() == rank {
        Ok(())
    } else {
        Err(ModelError::invalid_shape(
            operand,
            format!("expected rank {rank}, got {}", tensor.shape),
        ))
    }
}

fn expect_dims(operand: OperandKind, tensor: &Tensor, dims: &[u32]) -> Result<()> {
    if tensor.shape.dims() == dims {
        Ok(())
    } else {
        Err(ModelError::invalid_shape(
            operand,
            format!("expected {dims:?}, got {}", tensor.shape),
        ))
    }
}

fn check_data_type(operation: OperationType, operand: OperandKind, data_type: DataType) -> Result<()> {
    use DataType as D;
    let gmm = operation == OperationType::Gmm;
    let ok = match operand {
        OperandKind::Input if gmm => data_type == D::Uint8,
        OperandKind::Output if gmm => data_type == D::Uint32,
        OperandKind::Input => matches!(data_type, D::Int8 | D::Int16),
        OperandKind::Output => matches!(data_type, D::Int8 | D::Int16 | D::Int32),
        OperandKind::Weights => matches!(data_type, D::Int8 | D::Int16),
        OperandKind::Bias => matches!(data_type, D::Int8 | D::Int16 | D::Int32 | D::CompoundBias),
        OperandKind::Activation => data_type == D::PwlSegment,
        OperandKind::WeightScaleFactors => data_type == D::WeightScaleFactor,
        OperandKind::Means => data_type == D::Uint8,
        OperandKind::InverseCovariances => matches!(data_type, D::Uint8 | D::Uint16),
        OperandKind::GaussianConstants => data_type == D::Uint32,
    };
    if ok {
        Ok(())
    } else {
        Err(ModelError::InvalidDataType { operand, data_type })
    }
}
