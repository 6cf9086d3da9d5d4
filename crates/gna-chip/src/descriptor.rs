// SPDX-License-Identifier: AGPL-3.0-only

//! Layer and GMM descriptor formats.
//!
//! Every hardware-eligible layer owns one 128-byte layer descriptor. GMM
//! layers additionally own a 128-byte GMM descriptor in a second block that
//! follows all layer descriptors.
//!
//! A field is located by byte offset and storage size, optionally narrowed to
//! a bit range inside that storage. Buffer fields are four bytes wide and
//! hold translated offsets, never host addresses.
//!
//! ```text
//! Gen1/Gen2 layer descriptor               Gen3 layer descriptor
//! 0x00 op            0x20 input            0x00 op            0x40 input
//! 0x01 flags         0x24 output           0x01 flags         0x44 output
//! 0x02 in elems      0x28 output sum       0x02 precision     0x48 output sum
//! 0x04 out elems     0x2C feedback         0x04 in elems      0x4C feedback
//! 0x06 grouping      0x30 weights          0x06 out elems     0x50 weights
//! 0x07 iterations    0x34 bias             0x08 grouping      0x54 bias
//! ...                0x38 active list      ...                0x58 active list
//!                    0x3C pwl segments     0x20 2-D shape     0x5C pwl segments
//!                    0x40 weight scales                       0x60 weight scales
//!                    0x44 gmm descriptor                      0x64 gmm descriptor
//! ```

use crate::version::Generation;

/// Size of one layer descriptor in bytes.
pub const LAYER_DESCRIPTOR_SIZE: u32 = 128;

/// Size of one GMM descriptor in bytes.
pub const GMM_DESCRIPTOR_SIZE: u32 = 128;

/// Location of a field inside a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLayout {
    /// Byte offset from the start of the descriptor.
    pub offset: u16,
    /// Storage size in bytes (1, 2 or 4).
    pub size: u8,
    /// First bit inside the storage.
    pub bit_offset: u8,
    /// Number of bits; equals `size * 8` for plain scalar fields.
    pub bit_width: u8,
}

impl FieldLayout {
    /// Whole-storage scalar field.
    pub const fn scalar(offset: u16, size: u8) -> Self {
        Self {
            offset,
            size,
            bit_offset: 0,
            bit_width: size * 8,
        }
    }

    /// Bit range inside a storage unit.
    pub const fn bits(offset: u16, size: u8, bit_offset: u8, bit_width: u8) -> Self {
        Self {
            offset,
            size,
            bit_offset,
            bit_width,
        }
    }

    /// True when the field shares its storage with other fields.
    pub const fn is_packed(&self) -> bool {
        self.bit_width < self.size * 8
    }

    /// Largest value the field can hold.
    pub const fn max_value(&self) -> u32 {
        if self.bit_width >= 32 {
            u32::MAX
        } else {
            (1 << self.bit_width) - 1
        }
    }
}

/// Layer descriptor fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    /// Native operation code, see [`op_code`].
    OpType,
    /// PWL activation enabled.
    ActivationEnabled,
    /// Pooling mode of fused convolution (0 none, 1 max, 2 sum).
    PoolingMode,
    /// Weight element size selector, see [`element_size_code`].
    WeightElementSize,
    /// Input element size selector (Gen3).
    InputElementSize,
    /// Bias element size selector (Gen3).
    BiasElementSize,
    /// Output element size selector (Gen3).
    OutputElementSize,
    /// Input elements per vector.
    InputElementCount,
    /// Output elements per vector.
    OutputElementCount,
    /// Number of vectors scored together.
    Grouping,
    /// Input-buffer iterations.
    IterationCount,
    /// Elements in the last input-buffer iteration.
    LastIterationElementCount,
    /// Feedback iterations of a recurrent layer.
    FeedbackIterationCount,
    /// Feedback elements in the first iteration.
    FeedbackFirstElementCount,
    /// Feedback elements in the last iteration.
    FeedbackLastElementCount,
    /// PWL segment count.
    PwlSegmentCount,
    /// Active-list element count.
    ActiveListElementCount,
    /// Copy column count.
    CopyElementCount,
    /// Convolution filter count.
    FilterCount,
    /// Convolution filter size (1-D) or width (2-D).
    FilterSize,
    /// Convolution filter height (Gen3).
    FilterHeight,
    /// Feature-map stride (1-D) or horizontal stride (2-D).
    FeatureStride,
    /// Vertical stride (Gen3).
    StrideHeight,
    /// Input height (Gen3).
    InputHeight,
    /// Input width (Gen3).
    InputWidth,
    /// Input channels (Gen3).
    InputDepth,
    /// Horizontal zero padding (Gen3).
    PaddingWidth,
    /// Vertical zero padding (Gen3).
    PaddingHeight,
    /// Pooling window size.
    PoolSize,
    /// Pooling stride.
    PoolStride,
    /// Bias vector count of a multi-bias affine.
    BiasVectorCount,
    /// Selected bias vector of a multi-bias affine.
    BiasVectorIndex,
    /// Input buffer.
    InputBuffer,
    /// Activated output buffer.
    OutputBuffer,
    /// Intermediate sum buffer.
    OutputSumBuffer,
    /// Recurrent feedback buffer.
    FeedbackBuffer,
    /// Weights or filters.
    WeightBuffer,
    /// Bias buffer.
    BiasBuffer,
    /// Active-list buffer.
    ActiveListBuffer,
    /// PWL segment buffer.
    PwlSegmentBuffer,
    /// Weight scale factors of a multi-bias affine.
    WeightScaleBuffer,
    /// Offset of the layer's GMM descriptor.
    GmmDescriptorBuffer,
}

/// GMM descriptor fields. The GMM descriptor layout is shared by all
/// generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GmmField {
    /// Feature vector buffer.
    FeatureVectorBuffer,
    /// Byte stride between feature vectors.
    FeatureVectorStride,
    /// Read elimination of repeated means.
    ReadElimination,
    /// Inverse covariance element size (0 one byte, 1 two bytes).
    InverseCovarianceSize,
    /// Active list enabled.
    ActiveListEnabled,
    /// Vectors scored together.
    VectorCount,
    /// Number of GMM states.
    StateCount,
    /// Mixture components per state.
    MixtureComponentCount,
    /// Feature vector length.
    FeatureVectorLength,
    /// Score buffer length in bytes.
    ScoreBufferLength,
    /// Score output buffer.
    ScoreBuffer,
    /// Means buffer.
    MeanBuffer,
    /// Byte size of one state's means.
    MeanSetSize,
    /// Inverse covariance buffer.
    InverseCovarianceBuffer,
    /// Byte size of one state's inverse covariances.
    InverseCovarianceSetSize,
    /// Gaussian constants buffer.
    ConstantBuffer,
    /// Byte size of one state's constants.
    ConstantSetSize,
    /// Active list buffer.
    ActiveListBuffer,
    /// Active list length.
    ActiveListLength,
    /// Score saturation limit.
    MaximumScore,
}

const fn s(offset: u16, size: u8) -> Option<FieldLayout> {
    Some(FieldLayout::scalar(offset, size))
}

const fn b(offset: u16, size: u8, bit: u8, width: u8) -> Option<FieldLayout> {
    Some(FieldLayout::bits(offset, size, bit, width))
}

/// Layer descriptor field table. `None` when the generation has no such
/// field.
pub const fn layer_field(generation: Generation, field: Field) -> Option<FieldLayout> {
    match generation {
        Generation::Gmm => None,
        Generation::Gen1 | Generation::Gen2 => xnn1_field(field),
        Generation::Gen3 => xnn3_field(field),
    }
}

const fn xnn1_field(field: Field) -> Option<FieldLayout> {
    match field {
        Field::OpType => s(0x00, 1),
        Field::ActivationEnabled => b(0x01, 1, 0, 1),
        Field::PoolingMode => b(0x01, 1, 1, 2),
        Field::WeightElementSize => b(0x01, 1, 3, 2),
        Field::InputElementCount => s(0x02, 2),
        Field::OutputElementCount => s(0x04, 2),
        Field::Grouping => s(0x06, 1),
        Field::IterationCount => s(0x07, 1),
        Field::LastIterationElementCount => s(0x08, 2),
        Field::FeedbackIterationCount => s(0x0A, 1),
        Field::FeedbackFirstElementCount => s(0x0C, 2),
        Field::FeedbackLastElementCount => s(0x0E, 2),
        Field::PwlSegmentCount => s(0x10, 1),
        Field::ActiveListElementCount => s(0x12, 2),
        Field::CopyElementCount => s(0x14, 2),
        Field::FilterCount => s(0x16, 2),
        Field::FilterSize => s(0x18, 2),
        Field::FeatureStride => s(0x1A, 2),
        Field::PoolSize => s(0x1C, 1),
        Field::PoolStride => s(0x1D, 1),
        Field::BiasVectorCount => s(0x1E, 1),
        Field::BiasVectorIndex => s(0x1F, 1),
        Field::InputBuffer => s(0x20, 4),
        Field::OutputBuffer => s(0x24, 4),
        Field::OutputSumBuffer => s(0x28, 4),
        Field::FeedbackBuffer => s(0x2C, 4),
        Field::WeightBuffer => s(0x30, 4),
        Field::BiasBuffer => s(0x34, 4),
        Field::ActiveListBuffer => s(0x38, 4),
        Field::PwlSegmentBuffer => s(0x3C, 4),
        Field::WeightScaleBuffer => s(0x40, 4),
        Field::GmmDescriptorBuffer => s(0x44, 4),
        Field::InputElementSize
        | Field::BiasElementSize
        | Field::OutputElementSize
        | Field::FilterHeight
        | Field::StrideHeight
        | Field::InputHeight
        | Field::InputWidth
        | Field::InputDepth
        | Field::PaddingWidth
        | Field::PaddingHeight => None,
    }
}

const fn xnn3_field(field: Field) -> Option<FieldLayout> {
    match field {
        Field::OpType => s(0x00, 1),
        Field::ActivationEnabled => b(0x01, 1, 0, 1),
        Field::PoolingMode => b(0x01, 1, 1, 2),
        Field::WeightElementSize => b(0x01, 1, 3, 2),
        Field::InputElementSize => b(0x01, 1, 5, 2),
        Field::BiasElementSize => b(0x02, 1, 0, 2),
        Field::OutputElementSize => b(0x02, 1, 2, 2),
        Field::InputElementCount => s(0x04, 2),
        Field::OutputElementCount => s(0x06, 2),
        Field::Grouping => s(0x08, 1),
        Field::IterationCount => s(0x09, 1),
        Field::LastIterationElementCount => s(0x0A, 2),
        Field::FeedbackIterationCount => s(0x0C, 1),
        Field::PwlSegmentCount => s(0x0D, 1),
        Field::FeedbackFirstElementCount => s(0x0E, 2),
        Field::FeedbackLastElementCount => s(0x10, 2),
        Field::ActiveListElementCount => s(0x12, 2),
        Field::CopyElementCount => s(0x14, 2),
        Field::BiasVectorCount => s(0x16, 1),
        Field::BiasVectorIndex => s(0x17, 1),
        Field::FilterCount => s(0x18, 2),
        Field::FilterSize => s(0x1A, 2),
        Field::FilterHeight => s(0x1C, 2),
        Field::FeatureStride => s(0x1E, 1),
        Field::StrideHeight => s(0x1F, 1),
        Field::InputHeight => s(0x20, 2),
        Field::InputWidth => s(0x22, 2),
        Field::InputDepth => s(0x24, 2),
        Field::PaddingWidth => s(0x26, 1),
        Field::PaddingHeight => s(0x27, 1),
        Field::PoolSize => s(0x28, 1),
        Field::PoolStride => s(0x29, 1),
        Field::InputBuffer => s(0x40, 4),
        Field::OutputBuffer => s(0x44, 4),
        Field::OutputSumBuffer => s(0x48, 4),
        Field::FeedbackBuffer => s(0x4C, 4),
        Field::WeightBuffer => s(0x50, 4),
        Field::BiasBuffer => s(0x54, 4),
        Field::ActiveListBuffer => s(0x58, 4),
        Field::PwlSegmentBuffer => s(0x5C, 4),
        Field::WeightScaleBuffer => s(0x60, 4),
        Field::GmmDescriptorBuffer => s(0x64, 4),
    }
}

/// GMM descriptor field table.
pub const fn gmm_field(field: GmmField) -> FieldLayout {
    match field {
        GmmField::FeatureVectorBuffer => FieldLayout::scalar(0x00, 4),
        GmmField::FeatureVectorStride => FieldLayout::scalar(0x04, 4),
        GmmField::ReadElimination => FieldLayout::bits(0x08, 1, 0, 1),
        GmmField::InverseCovarianceSize => FieldLayout::bits(0x08, 1, 1, 1),
        GmmField::ActiveListEnabled => FieldLayout::bits(0x08, 1, 2, 1),
        GmmField::VectorCount => FieldLayout::scalar(0x0C, 1),
        GmmField::StateCount => FieldLayout::scalar(0x10, 4),
        GmmField::MixtureComponentCount => FieldLayout::scalar(0x14, 2),
        GmmField::FeatureVectorLength => FieldLayout::scalar(0x16, 2),
        GmmField::ScoreBufferLength => FieldLayout::scalar(0x18, 4),
        GmmField::ScoreBuffer => FieldLayout::scalar(0x1C, 4),
        GmmField::MeanBuffer => FieldLayout::scalar(0x20, 4),
        GmmField::MeanSetSize => FieldLayout::scalar(0x24, 4),
        GmmField::InverseCovarianceBuffer => FieldLayout::scalar(0x28, 4),
        GmmField::InverseCovarianceSetSize => FieldLayout::scalar(0x2C, 4),
        GmmField::ConstantBuffer => FieldLayout::scalar(0x30, 4),
        GmmField::ConstantSetSize => FieldLayout::scalar(0x34, 4),
        GmmField::ActiveListBuffer => FieldLayout::scalar(0x38, 4),
        GmmField::ActiveListLength => FieldLayout::scalar(0x3C, 4),
        GmmField::MaximumScore => FieldLayout::scalar(0x40, 4),
    }
}

/// Native descriptor operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NnOp {
    /// Fully connected affine.
    Affine,
    /// Fully connected affine restricted to an active list.
    AffineActiveList,
    /// Diagonal affine.
    Diagonal,
    /// Recurrent affine.
    Recurrent,
    /// 1-D convolution.
    Convolution1D,
    /// Multi-bias affine.
    AffineMultiBias,
    /// Deinterleave.
    Deinterleave,
    /// Interleave.
    Interleave,
    /// Copy.
    Copy,
    /// GMM layer.
    Gmm,
    /// GMM layer restricted to an active list.
    GmmActiveList,
    /// Fused 2-D convolution.
    Convolution2D,
    /// Stand-alone 2-D pooling.
    Pooling2D,
}

/// Operation code written to [`Field::OpType`]. `None` when the generation
/// has no such operation.
pub const fn op_code(generation: Generation, op: NnOp) -> Option<u8> {
    let code = match op {
        NnOp::Affine => 0x00,
        NnOp::AffineActiveList => 0x01,
        NnOp::Diagonal => 0x02,
        NnOp::Recurrent => 0x03,
        NnOp::Convolution1D => 0x04,
        NnOp::AffineMultiBias => 0x05,
        NnOp::Deinterleave => 0x08,
        NnOp::Interleave => 0x09,
        NnOp::Copy => 0x0A,
        NnOp::Gmm => 0x0C,
        NnOp::GmmActiveList => 0x0D,
        NnOp::Convolution2D => 0x10,
        NnOp::Pooling2D => 0x11,
    };
    let available = match generation {
        Generation::Gmm => false,
        Generation::Gen1 => !matches!(
            op,
            NnOp::AffineMultiBias | NnOp::Convolution2D | NnOp::Pooling2D
        ),
        Generation::Gen2 => !matches!(op, NnOp::Convolution2D | NnOp::Pooling2D),
        Generation::Gen3 => true,
    };
    if available {
        Some(code)
    } else {
        None
    }
}

/// Element-size selector for the precision fields.
///
/// Gen1/Gen2 only encode weight size (0 two bytes, 1 one byte). Gen3 encodes
/// every precision field as 0 one byte, 1 two bytes, 2 four bytes.
pub const fn element_size_code(generation: Generation, field: Field, bytes: u32) -> Option<u32> {
    match (generation, field) {
        (Generation::Gen1 | Generation::Gen2, Field::WeightElementSize) => match bytes {
            2 => Some(0),
            1 => Some(1),
            _ => None,
        },
        (
            Generation::Gen3,
            Field::WeightElementSize
            | Field::InputElementSize
            | Field::BiasElementSize
            | Field::OutputElementSize,
        ) => match bytes {
            1 => Some(0),
            2 => Some(1),
            4 | 8 => Some(2),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_FIELDS: [Field; 42] = [
        Field::OpType,
        Field::ActivationEnabled,
        Field::PoolingMode,
        Field::WeightElementSize,
        Field::InputElementSize,
        Field::BiasElementSize,
        Field::OutputElementSize,
        Field::InputElementCount,
        Field::OutputElementCount,
        Field::Grouping,
        Field::IterationCount,
        Field::LastIterationElementCount,
        Field::FeedbackIterationCount,
        Field::FeedbackFirstElementCount,
        Field::FeedbackLastElementCount,
        Field::PwlSegmentCount,
        Field::ActiveListElementCount,
        Field::CopyElementCount,
        Field::FilterCount,
        Field::FilterSize,
        Field::FilterHeight,
        Field::FeatureStride,
        Field::StrideHeight,
        Field::InputHeight,
        Field::InputWidth,
        Field::InputDepth,
        Field::PaddingWidth,
        Field::PaddingHeight,
        Field::PoolSize,
        Field::PoolStride,
        Field::BiasVectorCount,
        Field::BiasVectorIndex,
        Field::InputBuffer,
        Field::OutputBuffer,
        Field::OutputSumBuffer,
        Field::FeedbackBuffer,
        Field::WeightBuffer,
        Field::BiasBuffer,
        Field::ActiveListBuffer,
        Field::PwlSegmentBuffer,
        Field::WeightScaleBuffer,
        Field::GmmDescriptorBuffer,
    ];

    fn assert_no_overlap(generation: Generation) {
        let layouts: Vec<_> = ALL_FIELDS
            .iter()
            .filter_map(|f| layer_field(generation, *f))
            .collect();
        for (i, a) in layouts.iter().enumerate() {
            assert!(u32::from(a.offset) + u32::from(a.size) <= LAYER_DESCRIPTOR_SIZE);
            for bl in &layouts[i + 1..] {
                let a_end = a.offset + u16::from(a.size);
                let b_end = bl.offset + u16::from(bl.size);
                let bytes_overlap = a.offset < b_end && bl.offset < a_end;
                if !bytes_overlap {
                    continue;
                }
                // Shared storage is only legal for disjoint bit ranges.
                assert_eq!(a.offset, bl.offset, "{a:?} vs {bl:?}");
                let a_bits = a.bit_offset..a.bit_offset + a.bit_width;
                let b_bits = bl.bit_offset..bl.bit_offset + bl.bit_width;
                assert!(
                    a_bits.end <= b_bits.start || b_bits.end <= a_bits.start,
                    "{a:?} vs {bl:?}"
                );
            }
        }
    }

    #[test]
    fn layer_tables_have_no_overlapping_fields() {
        assert_no_overlap(Generation::Gen1);
        assert_no_overlap(Generation::Gen3);
    }

    #[test]
    fn gen3_only_fields_absent_on_gen1() {
        assert!(layer_field(Generation::Gen1, Field::InputHeight).is_none());
        assert!(layer_field(Generation::Gen3, Field::InputHeight).is_some());
        assert!(layer_field(Generation::Gmm, Field::OpType).is_none());
    }

    #[test]
    fn op_codes_respect_generation() {
        assert_eq!(op_code(Generation::Gen1, NnOp::AffineMultiBias), None);
        assert_eq!(op_code(Generation::Gen2, NnOp::AffineMultiBias), Some(0x05));
        assert_eq!(op_code(Generation::Gen2, NnOp::Convolution2D), None);
        assert_eq!(op_code(Generation::Gen3, NnOp::Convolution2D), Some(0x10));
    }

    #[test]
    fn element_size_translation() {
        assert_eq!(element_size_code(Generation::Gen1, Field::WeightElementSize, 1), Some(1));
        assert_eq!(element_size_code(Generation::Gen1, Field::InputElementSize, 1), None);
        assert_eq!(element_size_code(Generation::Gen3, Field::BiasElementSize, 4), Some(2));
    }

    #[test]
    fn gmm_fields_fit() {
        let l = gmm_field(GmmField::MaximumScore);
        assert!(u32::from(l.offset) + u32::from(l.size) <= GMM_DESCRIPTOR_SIZE);
        assert!(gmm_field(GmmField::ActiveListEnabled).is_packed());
    }
}
