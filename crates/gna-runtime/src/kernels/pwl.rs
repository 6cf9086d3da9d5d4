// SPDX-License-Identifier: AGPL-3.0-only

//! Piecewise-linear activation
//!
//! Segments are sorted by `x_base`. The two low bits of `x_base` are not part
//! of the base; they select the slope scale `8 * (x_base & 3)` bits.

use bytemuck::{Pod, Zeroable};

/// One PWL segment as stored in device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct PwlSegment {
    /// Segment start; low two bits hold the slope scale
    pub x_base: i32,
    /// Output at the segment start
    pub y_base: i16,
    /// Slope
    pub slope: i16,
}

impl PwlSegment {
    /// Segment with a slope scale of `8 * scale` bits
    pub fn new(x_base: i32, y_base: i16, slope: i16, scale: u8) -> Self {
        Self {
            x_base: (x_base & !3) | i32::from(scale & 3),
            y_base,
            slope,
        }
    }

    fn base(&self) -> i64 {
        i64::from(self.x_base & !3)
    }

    fn shift(&self) -> u32 {
        8 * (self.x_base & 3) as u32
    }
}

/// Activate one accumulator value; the result is not saturated
pub(super) fn activate(segments: &[PwlSegment], x: i64) -> i64 {
    let Some(first) = segments.first() else {
        return x;
    };
    let segment = segments
        .iter()
        .take_while(|s| s.base() <= x)
        .last()
        .unwrap_or(first);
    if x < segment.base() {
        return i64::from(segment.y_base);
    }
    (((x - segment.base()) * i64::from(segment.slope)) >> segment.shift()) + i64::from(segment.y_base)
}
