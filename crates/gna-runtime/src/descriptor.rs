// SPDX-License-Identifier: AGPL-3.0-only

//! Descriptor encoding
//!
//! Encoders turn a compiled [`Layer`] into its 128-byte layer descriptor (and
//! GMM descriptor) inside a descriptor image. The encoder is looked up by
//! descriptor generation and layer kind; a missing entry means the runtime
//! cannot drive that operation on the generation at all.
//!
//! Fields are written through [`encode_field`], which range-checks the value
//! and merges bit fields into their shared storage. Every encoder returns a
//! [`HardwareLayer`] recording where the request-time fields live so patches
//! can be generated without re-encoding.

use std::collections::BTreeMap;

use gna_chip::descriptor::{element_size_code, gmm_field, layer_field, op_code};
use gna_chip::{Field, FieldLayout, Generation, GmmField, MemoryTag, NnOp};
use gna_model::OperandKind;

use crate::address::{AddressTranslation, BufferOffset};
use crate::capabilities::HardwareCapabilities;
use crate::error::{GnaError, Result};
use crate::layer::{Layer, LayerKind, LayerParams};

/// Write `value` into the field at absolute image offset `at`
///
/// Bit fields keep the other bits of their storage unit. Returns `at`.
///
/// # Errors
///
/// [`GnaError::ParameterOutOfRange`] when the value does not fit the field or
/// the field lies outside the image.
pub fn encode_field(
    image: &mut [u8],
    at: u32,
    layout: FieldLayout,
    value: u32,
    name: impl std::fmt::Debug,
) -> Result<u32> {
    let out_of_range = || GnaError::ParameterOutOfRange {
        field: format!("{name:?}"),
        value: u64::from(value),
    };
    if value > layout.max_value() {
        return Err(out_of_range());
    }
    let start = at as usize;
    let storage = image
        .get_mut(start..start + usize::from(layout.size))
        .ok_or_else(out_of_range)?;
    let mut word = [0u8; 4];
    word[..storage.len()].copy_from_slice(storage);
    let current = u32::from_le_bytes(word);
    let mask = layout.max_value() << layout.bit_offset;
    let merged = (current & !mask) | (value << layout.bit_offset);
    storage.copy_from_slice(&merged.to_le_bytes()[..storage.len()]);
    Ok(at)
}

/// Read the field at absolute image offset `at`
pub fn decode_field(image: &[u8], at: u32, layout: FieldLayout) -> Option<u32> {
    let start = at as usize;
    let storage = image.get(start..start + usize::from(layout.size))?;
    let mut word = [0u8; 4];
    word[..storage.len()].copy_from_slice(storage);
    Some((u32::from_le_bytes(word) >> layout.bit_offset) & layout.max_value())
}

/// Buffer field of an exported model that the host relocates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalBufferField {
    /// Layer owning the field
    pub layer_index: u32,
    /// Absolute offset of the field in the descriptor image
    pub location: u32,
    /// External tag of the buffer
    pub tag: MemoryTag,
    /// Offset written to the field, relative to the external buffer group
    pub offset: u32,
}

/// Locations shared by every hardware layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerFields {
    /// Model layer index
    pub layer_index: u32,
    /// Native kind
    pub kind: LayerKind,
    /// Start of the layer's descriptor in descriptor memory
    pub descriptor_offset: u32,
    buffers: BTreeMap<OperandKind, u32>,
}

/// Active-list fields of a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveListFields {
    /// Location of the list pointer
    pub buffer: u32,
    /// Location of the element count
    pub count: u32,
    /// Storage size of the element count
    pub count_size: u8,
}

/// GMM specifics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GmmFields {
    /// Start of the GMM descriptor
    pub gmm_offset: u32,
    /// Stand-alone GMM mode instead of a descriptor-list layer
    pub legacy: bool,
    /// Location of the op-type byte in the layer descriptor
    pub op_type: Option<u32>,
    /// Active-list pointer and length in the GMM descriptor
    pub active_list: ActiveListFields,
    /// Location of the GMM flags byte
    pub flags: u32,
    /// Flags as encoded, without active list
    pub flags_base: u8,
    /// Location of the score buffer length
    pub score_length: u32,
    /// Vectors scored together
    pub grouping: u32,
}

/// Encoded layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareLayer {
    /// Affine and multi-bias affine
    Affine {
        /// Common locations
        fields: LayerFields,
        /// Op-type byte
        op_type: u32,
        /// Active-list fields; plain affine only
        active_list: Option<ActiveListFields>,
    },
    /// Element-wise affine
    Diagonal {
        /// Common locations
        fields: LayerFields,
    },
    /// Recurrent affine
    Recurrent {
        /// Common locations
        fields: LayerFields,
        /// Feedback pointer location
        feedback: u32,
        /// Feedback delay in vectors
        delay: u32,
        /// Bytes of one output vector
        output_row_bytes: u32,
    },
    /// 1-D or 2-D convolution
    Convolution {
        /// Common locations
        fields: LayerFields,
    },
    /// Copy, interleave and deinterleave
    Transfer {
        /// Common locations
        fields: LayerFields,
    },
    /// Gaussian mixture scoring
    Gmm {
        /// Common locations
        fields: LayerFields,
        /// GMM specifics
        gmm: GmmFields,
    },
}

impl HardwareLayer {
    /// Common locations
    pub fn fields(&self) -> &LayerFields {
        match self {
            Self::Affine { fields, .. }
            | Self::Diagonal { fields }
            | Self::Recurrent { fields, .. }
            | Self::Convolution { fields }
            | Self::Transfer { fields }
            | Self::Gmm { fields, .. } => fields,
        }
    }

    /// Model layer index
    pub fn layer_index(&self) -> u32 {
        self.fields().layer_index
    }

    /// Native kind
    pub fn kind(&self) -> LayerKind {
        self.fields().kind
    }

    /// Offset handed to the device to start at this layer
    pub fn descriptor_offset(&self) -> u32 {
        self.fields().descriptor_offset
    }

    /// Location of the buffer field for an operand slot
    pub fn buffer_location(&self, operand: OperandKind) -> Option<u32> {
        self.fields().buffers.get(&operand).copied()
    }

    /// GMM specifics, for GMM layers
    pub fn gmm(&self) -> Option<&GmmFields> {
        match self {
            Self::Gmm { gmm, .. } => Some(gmm),
            _ => None,
        }
    }
}

/// State shared by the encoders of one descriptor image
pub(crate) struct EncodeContext<'a> {
    pub image: &'a mut [u8],
    pub capabilities: &'a HardwareCapabilities,
    pub translation: &'a AddressTranslation,
    pub externals: &'a mut Vec<ExternalBufferField>,
    /// Layer descriptor start; `None` for stand-alone GMM layers
    pub descriptor_offset: Option<u32>,
    /// GMM descriptor start of GMM layers
    pub gmm_offset: Option<u32>,
}

impl EncodeContext<'_> {
    fn generation(&self) -> Generation {
        self.capabilities.generation()
    }

    fn layout(&self, field: Field) -> Result<(u32, FieldLayout)> {
        let generation = self.generation();
        let base = self.descriptor_offset.ok_or_else(|| GnaError::HardwareModuleUnavailable {
            reason: format!("{field:?} needs a layer descriptor"),
        })?;
        let layout = layer_field(generation, field).ok_or_else(|| {
            GnaError::HardwareModuleUnavailable {
                reason: format!("{generation:?} descriptors have no {field:?}"),
            }
        })?;
        Ok((base + u32::from(layout.offset), layout))
    }

    fn gmm_layout(&self, field: GmmField) -> Result<(u32, FieldLayout)> {
        let base = self.gmm_offset.ok_or_else(|| GnaError::HardwareModuleUnavailable {
            reason: format!("{field:?} needs a GMM descriptor"),
        })?;
        let layout = gmm_field(field);
        Ok((base + u32::from(layout.offset), layout))
    }

    fn set(&mut self, field: Field, value: u32) -> Result<u32> {
        let (at, layout) = self.layout(field)?;
        encode_field(self.image, at, layout, value, field)
    }

    fn set_gmm(&mut self, field: GmmField, value: u32) -> Result<u32> {
        let (at, layout) = self.gmm_layout(field)?;
        encode_field(self.image, at, layout, value, field)
    }

    /// Write the translated address of a buffer into a 4-byte field
    fn write_buffer(&mut self, layer_index: u32, at: u32, address: u64) -> Result<()> {
        let offset = self.translation.translate(address, None)?;
        let layout = FieldLayout::scalar(0, 4);
        encode_field(self.image, at, layout, offset.value(), "buffer")?;
        if let BufferOffset::External { tag, offset } = offset {
            self.externals.push(ExternalBufferField {
                layer_index,
                location: at,
                tag,
                offset,
            });
        }
        Ok(())
    }

    fn bind(
        &mut self,
        layer: &Layer,
        fields: &mut LayerFields,
        operand: OperandKind,
        field: Field,
    ) -> Result<()> {
        let (at, _) = self.layout(field)?;
        if let Some(address) = layer.operand(operand).and_then(|o| o.address) {
            self.write_buffer(layer.index(), at, address)?;
        }
        fields.buffers.insert(operand, at);
        Ok(())
    }

    fn bind_gmm(
        &mut self,
        layer: &Layer,
        fields: &mut LayerFields,
        operand: OperandKind,
        field: GmmField,
    ) -> Result<()> {
        let (at, _) = self.gmm_layout(field)?;
        if let Some(address) = layer.operand(operand).and_then(|o| o.address) {
            self.write_buffer(layer.index(), at, address)?;
        }
        fields.buffers.insert(operand, at);
        Ok(())
    }

    fn active_list(&self) -> Result<ActiveListFields> {
        let (buffer, _) = self.layout(Field::ActiveListBuffer)?;
        let (count, layout) = self.layout(Field::ActiveListElementCount)?;
        Ok(ActiveListFields {
            buffer,
            count,
            count_size: layout.size,
        })
    }
}

pub(crate) type Encoder = fn(&Layer, &mut EncodeContext<'_>) -> Result<HardwareLayer>;

/// Encoder for a layer kind on a generation
pub(crate) fn encoder(generation: Generation, kind: LayerKind) -> Option<Encoder> {
    use LayerKind as K;
    let encode: Encoder = match (generation, kind) {
        (_, K::Gmm) => encode_gmm,
        (Generation::Gmm, _) | (Generation::Gen1, K::AffineMultiBias) => return None,
        (Generation::Gen1 | Generation::Gen2, K::Convolution2D) => return None,
        (_, K::Affine | K::AffineMultiBias) => encode_affine,
        (_, K::Diagonal) => encode_diagonal,
        (_, K::Recurrent) => encode_recurrent,
        (_, K::Convolution1D | K::Convolution2D) => encode_convolution,
        (_, K::Copy | K::Interleave | K::Deinterleave) => encode_transfer,
    };
    Some(encode)
}

fn precision_code(generation: Generation, field: Field, bytes: u32) -> Result<u32> {
    element_size_code(generation, field, bytes).ok_or_else(|| GnaError::ParameterOutOfRange {
        field: format!("{field:?}"),
        value: u64::from(bytes),
    })
}

/// Fields every neural-network layer descriptor carries
fn header(layer: &Layer, ctx: &mut EncodeContext<'_>, op: NnOp, grouping: u32) -> Result<LayerFields> {
    let generation = ctx.generation();
    let code = op_code(generation, op).ok_or_else(|| GnaError::HardwareModuleUnavailable {
        reason: format!("{generation:?} has no {op:?} operation"),
    })?;
    let descriptor_offset = ctx.set(Field::OpType, u32::from(code))?;
    let mut fields = LayerFields {
        layer_index: layer.index(),
        kind: layer.kind(),
        descriptor_offset,
        buffers: BTreeMap::new(),
    };
    ctx.set(Field::InputElementCount, layer.input_elements())?;
    ctx.set(Field::OutputElementCount, layer.output_elements())?;
    ctx.set(Field::Grouping, grouping)?;

    let size = |kind| layer.operand(kind).map(|o| o.data_type.size());
    if let Some(bytes) = size(OperandKind::Weights) {
        ctx.set(Field::WeightElementSize, precision_code(generation, Field::WeightElementSize, bytes)?)?;
    }
    if generation == Generation::Gen3 {
        let precisions = [
            (OperandKind::Input, Field::InputElementSize),
            (OperandKind::Bias, Field::BiasElementSize),
            (OperandKind::Output, Field::OutputElementSize),
        ];
        for (operand, field) in precisions {
            if let Some(bytes) = size(operand) {
                ctx.set(field, precision_code(generation, field, bytes)?)?;
            }
        }
    }

    ctx.bind(layer, &mut fields, OperandKind::Input, Field::InputBuffer)?;
    ctx.bind(layer, &mut fields, OperandKind::Output, Field::OutputBuffer)?;
    if let Some(pwl) = layer.operand(OperandKind::Activation) {
        ctx.set(Field::ActivationEnabled, 1)?;
        ctx.set(Field::PwlSegmentCount, pwl.element_count())?;
        ctx.bind(layer, &mut fields, OperandKind::Activation, Field::PwlSegmentBuffer)?;
    }
    Ok(fields)
}

/// Input-buffer iterations of affine-family layers
fn iterations(layer: &Layer, ctx: &mut EncodeContext<'_>) -> Result<u32> {
    let per_iteration = ctx
        .capabilities
        .buffer_elements(layer.grouping(), layer.input_precision());
    if per_iteration == 0 {
        return Err(GnaError::ParameterOutOfRange {
            field: "Grouping".into(),
            value: u64::from(layer.grouping()),
        });
    }
    let inputs = layer.input_elements();
    let count = inputs.div_ceil(per_iteration);
    ctx.set(Field::IterationCount, count)?;
    ctx.set(
        Field::LastIterationElementCount,
        inputs - (count - 1) * per_iteration,
    )?;
    Ok(per_iteration)
}

fn weights_and_bias(layer: &Layer, ctx: &mut EncodeContext<'_>, fields: &mut LayerFields) -> Result<()> {
    ctx.bind(layer, fields, OperandKind::Weights, Field::WeightBuffer)?;
    ctx.bind(layer, fields, OperandKind::Bias, Field::BiasBuffer)
}

fn encode_affine(layer: &Layer, ctx: &mut EncodeContext<'_>) -> Result<HardwareLayer> {
    let multibias = layer.kind() == LayerKind::AffineMultiBias;
    let op = if multibias { NnOp::AffineMultiBias } else { NnOp::Affine };
    let mut fields = header(layer, ctx, op, layer.grouping())?;
    iterations(layer, ctx)?;
    weights_and_bias(layer, ctx, &mut fields)?;
    if let LayerParams::MultiBias { index, count } = *layer.params() {
        ctx.set(Field::BiasVectorCount, count)?;
        ctx.set(Field::BiasVectorIndex, index)?;
        if layer.operand(OperandKind::WeightScaleFactors).is_some() {
            ctx.bind(layer, &mut fields, OperandKind::WeightScaleFactors, Field::WeightScaleBuffer)?;
        }
    }
    let active_list = if multibias { None } else { Some(ctx.active_list()?) };
    Ok(HardwareLayer::Affine {
        op_type: fields.descriptor_offset,
        fields,
        active_list,
    })
}

fn encode_diagonal(layer: &Layer, ctx: &mut EncodeContext<'_>) -> Result<HardwareLayer> {
    let mut fields = header(layer, ctx, NnOp::Diagonal, layer.grouping())?;
    iterations(layer, ctx)?;
    weights_and_bias(layer, ctx, &mut fields)?;
    Ok(HardwareLayer::Diagonal { fields })
}

fn encode_recurrent(layer: &Layer, ctx: &mut EncodeContext<'_>) -> Result<HardwareLayer> {
    let LayerParams::Recurrent { delay } = *layer.params() else {
        return Err(GnaError::model_invalid("recurrent layer without delay"));
    };
    let mut fields = header(layer, ctx, NnOp::Recurrent, layer.grouping())?;
    let per_iteration = iterations(layer, ctx)?;
    weights_and_bias(layer, ctx, &mut fields)?;

    let outputs = layer.output_elements();
    let feedback_iterations = outputs.div_ceil(per_iteration);
    ctx.set(Field::FeedbackIterationCount, feedback_iterations)?;
    ctx.set(Field::FeedbackFirstElementCount, outputs.min(per_iteration))?;
    ctx.set(
        Field::FeedbackLastElementCount,
        outputs - (feedback_iterations - 1) * per_iteration,
    )?;

    let output_row_bytes = layer.output_row_bytes();
    let (feedback, _) = ctx.layout(Field::FeedbackBuffer)?;
    if let Some(output) = layer.operand(OperandKind::Output).and_then(|o| o.address) {
        let address = feedback_address(output, delay, output_row_bytes)?;
        ctx.write_buffer(layer.index(), feedback, address)?;
    }
    Ok(HardwareLayer::Recurrent {
        fields,
        feedback,
        delay,
        output_row_bytes,
    })
}

/// Feedback rows start `delay` output vectors before the output buffer
pub fn feedback_address(output: u64, delay: u32, output_row_bytes: u32) -> Result<u64> {
    output
        .checked_sub(u64::from(delay) * u64::from(output_row_bytes))
        .ok_or_else(|| GnaError::buffer_invalid(output, "no room for recurrent feedback rows"))
}

fn encode_convolution(layer: &Layer, ctx: &mut EncodeContext<'_>) -> Result<HardwareLayer> {
    let LayerParams::Convolution(geometry) = *layer.params() else {
        return Err(GnaError::model_invalid("convolution layer without geometry"));
    };
    let two_d = layer.kind() == LayerKind::Convolution2D;
    let op = if two_d { NnOp::Convolution2D } else { NnOp::Convolution1D };
    let mut fields = header(layer, ctx, op, 1)?;
    iterations(layer, ctx)?;
    weights_and_bias(layer, ctx, &mut fields)?;

    let parameters = geometry.parameters;
    ctx.set(Field::FilterCount, geometry.filter_count)?;
    ctx.set(Field::FilterSize, geometry.filter[1])?;
    ctx.set(Field::FeatureStride, parameters.stride[1])?;
    if let Some(pooling) = parameters.pooling {
        ctx.set(Field::PoolingMode, geometry.pooling_code())?;
        ctx.set(Field::PoolSize, pooling.window[1])?;
        ctx.set(Field::PoolStride, pooling.stride[1])?;
    }
    if two_d {
        ctx.set(Field::FilterHeight, geometry.filter[0])?;
        ctx.set(Field::StrideHeight, parameters.stride[0])?;
        ctx.set(Field::InputHeight, geometry.input[0])?;
        ctx.set(Field::InputWidth, geometry.input[1])?;
        ctx.set(Field::InputDepth, geometry.input[2])?;
        ctx.set(Field::PaddingHeight, parameters.zero_padding[0])?;
        ctx.set(Field::PaddingWidth, parameters.zero_padding[1])?;
    }
    Ok(HardwareLayer::Convolution { fields })
}

fn encode_transfer(layer: &Layer, ctx: &mut EncodeContext<'_>) -> Result<HardwareLayer> {
    let (op, grouping) = match (layer.kind(), *layer.params()) {
        (LayerKind::Copy, LayerParams::Copy { rows, .. }) => (NnOp::Copy, rows),
        (LayerKind::Interleave, _) => (NnOp::Interleave, layer.grouping()),
        (LayerKind::Deinterleave, _) => (NnOp::Deinterleave, layer.grouping()),
        (kind, _) => return Err(GnaError::model_invalid(format!("{kind:?} is not a transfer"))),
    };
    let fields = header(layer, ctx, op, grouping)?;
    if let LayerParams::Copy { columns, .. } = *layer.params() {
        ctx.set(Field::CopyElementCount, columns)?;
    }
    Ok(HardwareLayer::Transfer { fields })
}

fn encode_gmm(layer: &Layer, ctx: &mut EncodeContext<'_>) -> Result<HardwareLayer> {
    let LayerParams::Gmm {
        states,
        mixtures,
        length,
        maximum_score,
    } = *layer.params()
    else {
        return Err(GnaError::model_invalid("GMM layer without dimensions"));
    };
    let gmm_offset = ctx.gmm_offset.ok_or_else(|| GnaError::HardwareModuleUnavailable {
        reason: "GMM layer without a GMM descriptor".into(),
    })?;
    let legacy = ctx.descriptor_offset.is_none();
    let grouping = layer.grouping();

    let (mut fields, op_type) = if legacy {
        let fields = LayerFields {
            layer_index: layer.index(),
            kind: layer.kind(),
            descriptor_offset: gmm_offset,
            buffers: BTreeMap::new(),
        };
        (fields, None)
    } else {
        let generation = ctx.generation();
        let code = op_code(generation, NnOp::Gmm).ok_or_else(|| GnaError::HardwareModuleUnavailable {
            reason: format!("{generation:?} has no GMM layer"),
        })?;
        let descriptor_offset = ctx.set(Field::OpType, u32::from(code))?;
        ctx.set(Field::InputElementCount, length)?;
        ctx.set(Field::OutputElementCount, states)?;
        ctx.set(Field::Grouping, grouping)?;
        ctx.set(Field::GmmDescriptorBuffer, gmm_offset)?;
        let fields = LayerFields {
            layer_index: layer.index(),
            kind: layer.kind(),
            descriptor_offset,
            buffers: BTreeMap::new(),
        };
        (fields, Some(descriptor_offset))
    };

    let covariance_bytes = layer
        .required(OperandKind::InverseCovariances)?
        .data_type
        .size();
    ctx.set_gmm(GmmField::FeatureVectorStride, length)?;
    ctx.set_gmm(GmmField::InverseCovarianceSize, u32::from(covariance_bytes == 2))?;
    ctx.set_gmm(GmmField::VectorCount, grouping)?;
    ctx.set_gmm(GmmField::StateCount, states)?;
    ctx.set_gmm(GmmField::MixtureComponentCount, mixtures)?;
    ctx.set_gmm(GmmField::FeatureVectorLength, length)?;
    let score_length = ctx.set_gmm(GmmField::ScoreBufferLength, states * grouping * 4)?;
    ctx.set_gmm(GmmField::MeanSetSize, mixtures * length)?;
    ctx.set_gmm(GmmField::InverseCovarianceSetSize, mixtures * length * covariance_bytes)?;
    ctx.set_gmm(GmmField::ConstantSetSize, mixtures * 4)?;
    ctx.set_gmm(GmmField::MaximumScore, maximum_score)?;

    let buffers = [
        (OperandKind::Input, GmmField::FeatureVectorBuffer),
        (OperandKind::Output, GmmField::ScoreBuffer),
        (OperandKind::Means, GmmField::MeanBuffer),
        (OperandKind::InverseCovariances, GmmField::InverseCovarianceBuffer),
        (OperandKind::GaussianConstants, GmmField::ConstantBuffer),
    ];
    for (operand, field) in buffers {
        ctx.bind_gmm(layer, &mut fields, operand, field)?;
    }

    let (flags, flags_layout) = ctx.gmm_layout(GmmField::ActiveListEnabled)?;
    let flags_base = ctx.image.get(flags as usize).copied().unwrap_or_default()
        & !(1 << flags_layout.bit_offset);
    let (buffer, _) = ctx.gmm_layout(GmmField::ActiveListBuffer)?;
    let (count, count_layout) = ctx.gmm_layout(GmmField::ActiveListLength)?;
    Ok(HardwareLayer::Gmm {
        fields,
        gmm: GmmFields {
            gmm_offset,
            legacy,
            op_type,
            active_list: ActiveListFields {
                buffer,
                count,
                count_size: count_layout.size,
            },
            flags,
            flags_base,
            score_length,
            grouping,
        },
    })
}
