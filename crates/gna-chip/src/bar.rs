// SPDX-License-Identifier: AGPL-3.0-only

//! Memory tags and bar-relative addressing for MMU-less parts.
//!
//! Without an MMU every descriptor buffer field holds `offset | bar`, where
//! `bar` is a small index in the low bits selecting one of the device's
//! memory windows and `offset` is relative to the base of that window.
//!
//! ```text
//! bar 0  descriptors, then read-only data (weights, biases, PWL)
//! bar 1  scratch, based after the descriptors rounded up to 64 bytes
//! bar 2  input
//! bar 3  output
//! bar 4  state
//! bar 5  read-write
//! ```
//!
//! External input/output buffers are not in any bar; they are relocated by
//! the host that loads the exported model.

use crate::version::DeviceVersion;

/// Mask of the low offset bits carrying the bar index.
pub const BAR_INDEX_MASK: u32 = 0x7;

/// Alignment of the scratch window base.
pub const SCRATCH_BASE_ALIGNMENT: u32 = 64;

/// Semantic tag of a memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryTag {
    /// General read-write data.
    ReadWrite,
    /// Model input.
    Input,
    /// Model output.
    Output,
    /// Constant model data.
    ReadOnly,
    /// Input owned by the host of an exported model.
    ExternalInput,
    /// Output owned by the host of an exported model.
    ExternalOutput,
    /// Intermediate activations.
    Scratch,
    /// Persistent state between requests.
    State,
}

impl MemoryTag {
    /// Raw tag value of an allocation that was never tagged.
    pub const UNTAGGED: u32 = 0;

    /// Raw tag value as set through the allocation API.
    pub const fn raw(self) -> u32 {
        match self {
            Self::ReadWrite => 0x0100,
            Self::Input => 0x0200,
            Self::Output => 0x0400,
            Self::ReadOnly => 0x0800,
            Self::ExternalInput => 0x1000,
            Self::ExternalOutput => 0x2000,
            Self::Scratch => 0x4000,
            Self::State => 0x8000,
        }
    }

    /// Decode a raw tag. Untagged and unknown values yield `None`.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0x0100 => Self::ReadWrite,
            0x0200 => Self::Input,
            0x0400 => Self::Output,
            0x0800 => Self::ReadOnly,
            0x1000 => Self::ExternalInput,
            0x2000 => Self::ExternalOutput,
            0x4000 => Self::Scratch,
            0x8000 => Self::State,
            _ => return None,
        })
    }

    /// External buffers bypass bar encoding.
    pub const fn is_external(self) -> bool {
        matches!(self, Self::ExternalInput | Self::ExternalOutput)
    }
}

/// Where a tag's window starts, relative to the descriptor block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagBase {
    /// Descriptor block size rounded up to [`SCRATCH_BASE_ALIGNMENT`].
    AfterDescriptorsAligned,
    /// Immediately after the descriptor block.
    AfterDescriptors,
    /// Window starts at zero.
    Zero,
}

/// True when `target` addresses memory through bars.
pub const fn is_bar_target(target: DeviceVersion) -> bool {
    matches!(target, DeviceVersion::Embedded3_1 | DeviceVersion::Embedded3_5)
}

/// Bar index of a tag on a bar target. `None` for external tags and for
/// targets that do not use bars.
pub const fn bar_index(target: DeviceVersion, tag: MemoryTag) -> Option<u32> {
    if !is_bar_target(target) {
        return None;
    }
    match tag {
        MemoryTag::ReadOnly => Some(0),
        MemoryTag::Scratch => Some(1),
        MemoryTag::Input => Some(2),
        MemoryTag::Output => Some(3),
        MemoryTag::State => Some(4),
        MemoryTag::ReadWrite => Some(5),
        MemoryTag::ExternalInput | MemoryTag::ExternalOutput => None,
    }
}

/// Window base of a tag. `None` for external tags.
pub const fn tag_base(tag: MemoryTag) -> Option<TagBase> {
    match tag {
        MemoryTag::Scratch => Some(TagBase::AfterDescriptorsAligned),
        MemoryTag::ReadOnly => Some(TagBase::AfterDescriptors),
        MemoryTag::Input | MemoryTag::Output | MemoryTag::State | MemoryTag::ReadWrite => {
            Some(TagBase::Zero)
        }
        MemoryTag::ExternalInput | MemoryTag::ExternalOutput => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_indices_fit_mask() {
        for tag in [
            MemoryTag::ReadOnly,
            MemoryTag::Scratch,
            MemoryTag::Input,
            MemoryTag::Output,
            MemoryTag::State,
            MemoryTag::ReadWrite,
        ] {
            let bar = bar_index(DeviceVersion::Embedded3_1, tag).unwrap();
            assert_eq!(bar & !BAR_INDEX_MASK, 0);
        }
    }

    #[test]
    fn mmu_targets_have_no_bar_table() {
        assert_eq!(bar_index(DeviceVersion::Gna3_0, MemoryTag::Input), None);
        assert_eq!(
            bar_index(DeviceVersion::Embedded3_1, MemoryTag::ExternalInput),
            None
        );
    }

    #[test]
    fn untagged_is_unknown() {
        assert_eq!(MemoryTag::from_raw(MemoryTag::UNTAGGED), None);
        assert_eq!(MemoryTag::from_raw(0x4000), Some(MemoryTag::Scratch));
    }
}
