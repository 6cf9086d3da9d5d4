// SPDX-License-Identifier: AGPL-3.0-only

//! Buffer address → device offset translation
//!
//! Descriptor buffer fields never hold host addresses. What they hold depends
//! on how the device reaches memory:
//!
//! - **MMU**: every allocation of the model (descriptor memory first) and of
//!   the request is mapped back to back on page boundaries; the field holds
//!   the position of the buffer in that layout.
//! - **Bar-relative**: MMU-less targets see one window per memory tag; the
//!   field holds `window offset | bar index`.
//! - **Flat**: the legacy export image is the model layout without request
//!   memory.
//!
//! Offset zero always falls inside descriptor memory, so it can never be a
//! valid buffer offset and is rejected.

use std::collections::BTreeMap;
use std::sync::Arc;

use gna_chip::bar::{self, TagBase, BAR_INDEX_MASK, SCRATCH_BASE_ALIGNMENT};
use gna_chip::{DeviceVersion, MemoryTag, BUFFER_ALIGNMENT, PAGE_SIZE};

use crate::error::{GnaError, Result};
use crate::memory::{align_up, Memory, MemoryContainer};

/// Translated buffer offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOffset {
    /// Offset the device resolves itself
    Device(u32),
    /// Offset inside a host-owned external buffer of an exported model
    External {
        /// Tag of the external buffer
        tag: MemoryTag,
        /// Offset inside the external tag group
        offset: u32,
    },
}

impl BufferOffset {
    /// Value written to the descriptor field
    pub fn value(self) -> u32 {
        match self {
            Self::Device(v) | Self::External { offset: v, .. } => v,
        }
    }

    /// True for host-relocated buffers
    pub fn is_external(self) -> bool {
        matches!(self, Self::External { .. })
    }
}

/// Address translation selected when a hardware model is built
#[derive(Debug, Clone)]
pub enum AddressTranslation {
    /// Live scoring through the device MMU
    Mmu(ContainerTranslation),
    /// Legacy single-shot export image
    Flat(ContainerTranslation),
    /// MMU-less export
    BarRelative(BarTranslation),
}

impl AddressTranslation {
    /// Translate `address` for a descriptor field
    ///
    /// `request` holds request-level allocations and is only consulted by the
    /// MMU regime.
    ///
    /// # Errors
    ///
    /// [`GnaError::MemoryBufferInvalid`] when the address is not registered or
    /// lands on the reserved offset zero; bar translation can also fail with
    /// [`GnaError::MemoryAlignmentInvalid`].
    pub fn translate(&self, address: u64, request: Option<&MemoryContainer>) -> Result<BufferOffset> {
        match self {
            Self::Mmu(t) => t.translate(address, request),
            Self::Flat(t) => t.translate(address, None),
            Self::BarRelative(t) => t.translate(address),
        }
    }

    /// Model-level allocations, descriptor memory first
    pub fn model_memory(&self) -> &MemoryContainer {
        match self {
            Self::Mmu(t) | Self::Flat(t) => &t.model,
            Self::BarRelative(t) => &t.model,
        }
    }

    /// Bar translation of an MMU-less export
    pub fn bar(&self) -> Option<&BarTranslation> {
        match self {
            Self::BarRelative(t) => Some(t),
            Self::Mmu(_) | Self::Flat(_) => None,
        }
    }
}

/// MMU and flat translation over a page-aligned container
#[derive(Debug, Clone)]
pub struct ContainerTranslation {
    model: MemoryContainer,
}

impl ContainerTranslation {
    /// Translation over `model`, whose first entry must be descriptor memory
    pub fn new(model: MemoryContainer) -> Self {
        Self { model }
    }

    fn translate(&self, address: u64, request: Option<&MemoryContainer>) -> Result<BufferOffset> {
        let found = match self.model.offset_of(address, PAGE_SIZE) {
            Some(offset) => Some(offset),
            None => request
                .and_then(|r| r.offset_of(address, PAGE_SIZE))
                .and_then(|offset| offset.checked_add(self.model.total_size_aligned())),
        };
        match found {
            Some(0) => Err(GnaError::buffer_invalid(address, "offset zero is reserved")),
            Some(offset) => Ok(BufferOffset::Device(offset)),
            None => Err(GnaError::buffer_invalid(
                address,
                "not inside any model or request allocation",
            )),
        }
    }
}

/// Bar-relative translation for MMU-less targets
#[derive(Debug, Clone)]
pub struct BarTranslation {
    target: DeviceVersion,
    descriptor_size: u32,
    model: MemoryContainer,
    groups: BTreeMap<MemoryTag, MemoryContainer>,
}

impl BarTranslation {
    /// Group the model allocations of `model` (descriptor memory first) by tag
    ///
    /// # Errors
    ///
    /// [`GnaError::DeviceVersionInvalid`] when `target` does not address
    /// memory through bars; [`GnaError::MemoryBufferInvalid`] when an
    /// allocation other than descriptor memory is untagged.
    pub fn new(target: DeviceVersion, model: MemoryContainer) -> Result<Self> {
        if !bar::is_bar_target(target) {
            return Err(GnaError::DeviceVersionInvalid {
                version: target.raw(),
            });
        }
        let mut entries = model.memories();
        let descriptor_size = entries.next().map_or(0, |m| m.size());
        let mut groups: BTreeMap<MemoryTag, MemoryContainer> = BTreeMap::new();
        for memory in entries {
            let tag = tag_of(memory)?;
            groups.entry(tag).or_default().append(Arc::clone(memory))?;
        }
        Ok(Self {
            target,
            descriptor_size,
            model,
            groups,
        })
    }

    /// Export target
    pub fn target(&self) -> DeviceVersion {
        self.target
    }

    /// Size of descriptor memory, the start of read-only data
    pub fn descriptor_size(&self) -> u32 {
        self.descriptor_size
    }

    /// Allocations carrying `tag`, in window order
    pub fn group(&self, tag: MemoryTag) -> Option<&MemoryContainer> {
        self.groups.get(&tag)
    }

    /// Bytes each tag group occupies inside its window
    pub fn group_size(&self, tag: MemoryTag) -> u32 {
        self.groups
            .get(&tag)
            .map_or(0, |g| g.total_size_with(BUFFER_ALIGNMENT))
    }

    fn translate(&self, address: u64) -> Result<BufferOffset> {
        let memory = self
            .model
            .find(address, 0)
            .map(|e| e.memory())
            .ok_or_else(|| GnaError::buffer_invalid(address, "not inside any model allocation"))?;
        let tag = tag_of(memory)?;
        let local = self
            .groups
            .get(&tag)
            .and_then(|g| g.offset_of(address, BUFFER_ALIGNMENT))
            .ok_or_else(|| GnaError::buffer_invalid(address, "not inside its tag group"))?;

        if tag.is_external() {
            return Ok(BufferOffset::External { tag, offset: local });
        }
        let bar = bar::bar_index(self.target, tag).ok_or_else(|| {
            GnaError::buffer_invalid(address, format!("{tag:?} has no bar on {}", self.target))
        })?;
        let base = match bar::tag_base(tag) {
            Some(TagBase::AfterDescriptorsAligned) => {
                align_up(self.descriptor_size, SCRATCH_BASE_ALIGNMENT)
            }
            Some(TagBase::AfterDescriptors) => self.descriptor_size,
            Some(TagBase::Zero) | None => 0,
        };
        let offset = base
            .checked_add(local)
            .ok_or_else(|| GnaError::buffer_invalid(address, "offset overflows"))?;
        if offset & BAR_INDEX_MASK != 0 {
            return Err(GnaError::MemoryAlignmentInvalid {
                address: u64::from(offset),
                alignment: BAR_INDEX_MASK + 1,
            });
        }
        Ok(BufferOffset::Device(offset | bar))
    }
}

fn tag_of(memory: &Memory) -> Result<MemoryTag> {
    memory.tag().ok_or_else(|| {
        GnaError::buffer_invalid(
            memory.address(),
            format!("unknown memory tag 0x{:X}", memory.raw_tag()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_with(sizes: &[u32]) -> (MemoryContainer, Vec<Arc<Memory>>) {
        let mut c = MemoryContainer::new();
        let mems: Vec<_> = sizes.iter().map(|&s| Memory::allocate(s).unwrap()).collect();
        for m in &mems {
            c.append(Arc::clone(m)).unwrap();
        }
        (c, mems)
    }

    #[test]
    fn test_mmu_model_offsets() {
        let (c, mems) = model_with(&[256, 100, 50]);
        let t = AddressTranslation::Mmu(ContainerTranslation::new(c));
        assert_eq!(
            t.translate(mems[1].address(), None).unwrap(),
            BufferOffset::Device(4096)
        );
        assert_eq!(
            t.translate(mems[2].address() + 10, None).unwrap(),
            BufferOffset::Device(8192 + 10)
        );
    }

    #[test]
    fn test_mmu_offset_zero_rejected() {
        let (c, mems) = model_with(&[256]);
        let t = AddressTranslation::Mmu(ContainerTranslation::new(c));
        assert!(matches!(
            t.translate(mems[0].address(), None),
            Err(GnaError::MemoryBufferInvalid { .. })
        ));
    }

    #[test]
    fn test_mmu_request_memory_is_biased() {
        let (c, _) = model_with(&[256, 5000]);
        let (request, req_mems) = model_with(&[64, 64]);
        let t = AddressTranslation::Mmu(ContainerTranslation::new(c));
        let off = t
            .translate(req_mems[1].address() + 8, Some(&request))
            .unwrap();
        assert_eq!(off, BufferOffset::Device(4096 + 8192 + 4096 + 8));
        // Flat translation never sees request memory.
        let (c2, _) = model_with(&[256]);
        let flat = AddressTranslation::Flat(ContainerTranslation::new(c2));
        assert!(flat.translate(req_mems[0].address(), Some(&request)).is_err());
    }

    #[test]
    fn test_unregistered_address() {
        let (c, _) = model_with(&[256]);
        let t = AddressTranslation::Mmu(ContainerTranslation::new(c));
        assert!(t.translate(0x40, None).is_err());
    }

    #[test]
    fn test_translation_is_injective() {
        let (c, mems) = model_with(&[128, 64, 64, 9000, 1]);
        let t = AddressTranslation::Mmu(ContainerTranslation::new(c));
        let mut seen = std::collections::HashSet::new();
        for m in &mems[1..] {
            let last = u64::from(m.size()) - 1;
            let deltas: std::collections::BTreeSet<u64> = [0, 1u64.min(last), last].into();
            for delta in deltas {
                let off = t.translate(m.address() + delta, None).unwrap().value();
                assert_ne!(off, 0);
                assert!(seen.insert(off), "offset {off} produced twice");
            }
        }
    }

    fn bar_model() -> (MemoryContainer, Vec<Arc<Memory>>) {
        let (c, mems) = model_with(&[200, 64, 128, 64, 64, 32]);
        mems[1].set_tag(MemoryTag::ReadOnly);
        mems[2].set_tag(MemoryTag::ReadOnly);
        mems[3].set_tag(MemoryTag::Scratch);
        mems[4].set_tag(MemoryTag::Input);
        mems[5].set_tag(MemoryTag::ExternalOutput);
        (c, mems)
    }

    #[test]
    fn test_bar_relative_offsets() {
        let (c, mems) = bar_model();
        let t = AddressTranslation::BarRelative(
            BarTranslation::new(DeviceVersion::Embedded3_1, c).unwrap(),
        );
        // Read-only starts right after the 200-byte descriptor block.
        assert_eq!(
            t.translate(mems[1].address(), None).unwrap(),
            BufferOffset::Device(200)
        );
        assert_eq!(
            t.translate(mems[2].address(), None).unwrap(),
            BufferOffset::Device(264)
        );
        // Scratch window starts at the descriptor size rounded to 64, bar 1.
        assert_eq!(
            t.translate(mems[3].address(), None).unwrap(),
            BufferOffset::Device(256 | 1)
        );
        assert_eq!(
            t.translate(mems[4].address() + 8, None).unwrap(),
            BufferOffset::Device(8 | 2)
        );
        assert_eq!(
            t.translate(mems[5].address() + 4, None).unwrap(),
            BufferOffset::External {
                tag: MemoryTag::ExternalOutput,
                offset: 4
            }
        );
    }

    #[test]
    fn test_bar_misaligned_offset() {
        let (c, mems) = bar_model();
        let t = BarTranslation::new(DeviceVersion::Embedded3_1, c).unwrap();
        assert!(matches!(
            t.translate(mems[4].address() + 3),
            Err(GnaError::MemoryAlignmentInvalid { .. })
        ));
    }

    #[test]
    fn test_bar_rejects_mmu_target_and_untagged() {
        let (c, _) = bar_model();
        assert!(matches!(
            BarTranslation::new(DeviceVersion::Gna3_0, c),
            Err(GnaError::DeviceVersionInvalid { .. })
        ));
        let (c2, _) = model_with(&[128, 64]);
        assert!(matches!(
            BarTranslation::new(DeviceVersion::Embedded3_1, c2),
            Err(GnaError::MemoryBufferInvalid { .. })
        ));
    }
}
