// SPDX-License-Identifier: AGPL-3.0-only

//! Element data types

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataType {
    /// Signed 8-bit integer
    Int8,
    /// Signed 16-bit integer
    Int16,
    /// Signed 32-bit integer
    Int32,
    /// Unsigned 8-bit integer
    Uint8,
    /// Unsigned 16-bit integer
    Uint16,
    /// Unsigned 32-bit integer
    Uint32,
    /// `{ bias: i32, multiplier: u8, pad: [u8; 3] }` used with 8-bit weights
    CompoundBias,
    /// `{ multiplier: u8, pad: [u8; 7] }` per-row weight scale
    WeightScaleFactor,
    /// `{ x_base: i32, y_base: i16, slope: i16 }` PWL activation segment
    PwlSegment,
}

impl DataType {
    /// Bytes per element
    pub const fn size(self) -> u32 {
        match self {
            Self::Int8 | Self::Uint8 => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 => 4,
            Self::CompoundBias | Self::WeightScaleFactor | Self::PwlSegment => 8,
        }
    }

    /// True for plain signed integer types
    pub const fn is_signed_integer(self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32)
    }

    /// True for plain unsigned integer types
    pub const fn is_unsigned_integer(self) -> bool {
        matches!(self, Self::Uint8 | Self::Uint16 | Self::Uint32)
    }

    /// Inclusive value range of an integer element, `None` for structured types
    pub const fn range(self) -> Option<(i64, i64)> {
        match self {
            Self::Int8 => Some((i8::MIN as i64, i8::MAX as i64)),
            Self::Int16 => Some((i16::MIN as i64, i16::MAX as i64)),
            Self::Int32 => Some((i32::MIN as i64, i32::MAX as i64)),
            Self::Uint8 => Some((0, u8::MAX as i64)),
            Self::Uint16 => Some((0, u16::MAX as i64)),
            Self::Uint32 => Some((0, u32::MAX as i64)),
            Self::CompoundBias | Self::WeightScaleFactor | Self::PwlSegment => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(DataType::Int8.size(), 1);
        assert_eq!(DataType::Uint16.size(), 2);
        assert_eq!(DataType::CompoundBias.size(), 8);
        assert_eq!(DataType::PwlSegment.size(), 8);
    }

    #[test]
    fn test_ranges() {
        assert_eq!(DataType::Int16.range(), Some((-32768, 32767)));
        assert_eq!(DataType::Uint32.range(), Some((0, 4_294_967_295)));
        assert_eq!(DataType::PwlSegment.range(), None);
    }
}
