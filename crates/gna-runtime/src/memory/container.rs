// SPDX-License-Identifier: AGPL-3.0-only

//! Ordered registry of memory allocations with cumulative offsets
//!
//! The device sees every allocation registered for a scope laid out back to
//! back. Each entry records where it starts in two layouts, captured when it
//! is appended and never changed afterwards:
//!
//! ```text
//! sizes         100        50
//! unaligned     0          100
//! page aligned  0          4096
//! ```

use std::sync::Arc;

use gna_chip::PAGE_SIZE;

use super::{align_up, Memory};
use crate::error::{GnaError, Result};

/// One registered allocation
#[derive(Debug, Clone)]
pub struct ContainerEntry {
    memory: Arc<Memory>,
    offset: u32,
    offset_aligned: u32,
}

impl ContainerEntry {
    /// Registered allocation
    pub fn memory(&self) -> &Arc<Memory> {
        &self.memory
    }

    /// Sum of the sizes of all earlier entries
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Sum of the page-rounded sizes of all earlier entries
    pub fn offset_aligned(&self) -> u32 {
        self.offset_aligned
    }
}

/// Append-only list of distinct allocations
#[derive(Debug, Clone, Default)]
pub struct MemoryContainer {
    entries: Vec<ContainerEntry>,
    total_size: u32,
    total_size_aligned: u32,
}

impl MemoryContainer {
    /// Empty container
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an allocation at the end
    ///
    /// Returns `false` when it was already registered.
    ///
    /// # Errors
    ///
    /// [`GnaError::MemoryTotalSizeExceeded`] when the aligned total would
    /// overflow the 32-bit device address space.
    pub fn append(&mut self, memory: Arc<Memory>) -> Result<bool> {
        if self.entries.iter().any(|e| e.memory.id() == memory.id()) {
            return Ok(false);
        }
        let overflow = || GnaError::MemoryTotalSizeExceeded {
            size: u64::from(self.total_size_aligned) + u64::from(memory.allocated_size()),
            limit: u64::from(u32::MAX),
        };
        let total_size = self
            .total_size
            .checked_add(memory.size())
            .ok_or_else(overflow)?;
        let total_size_aligned = self
            .total_size_aligned
            .checked_add(memory.allocated_size())
            .ok_or_else(overflow)?;
        self.entries.push(ContainerEntry {
            memory,
            offset: self.total_size,
            offset_aligned: self.total_size_aligned,
        });
        self.total_size = total_size;
        self.total_size_aligned = total_size_aligned;
        Ok(true)
    }

    /// Registered entries in order
    pub fn entries(&self) -> &[ContainerEntry] {
        &self.entries
    }

    /// Registered allocations in order
    pub fn memories(&self) -> impl Iterator<Item = &Arc<Memory>> {
        self.entries.iter().map(|e| &e.memory)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all sizes
    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    /// Sum of all page-rounded sizes
    pub fn total_size_aligned(&self) -> u32 {
        self.total_size_aligned
    }

    /// Entry whose allocation holds `[address, address + size)`
    pub fn find(&self, address: u64, size: u64) -> Option<&ContainerEntry> {
        self.entries
            .iter()
            .find(|e| e.memory.contains(address, size))
    }

    /// True when `[address, address + size)` lies inside one registered allocation
    pub fn contains(&self, address: u64, size: u64) -> bool {
        self.find(address, size).is_some()
    }

    /// Position of `address` in the back-to-back layout where every entry
    /// starts at a multiple of `alignment` (a power of two).
    ///
    /// Alignments 1 and [`PAGE_SIZE`] use the recorded offsets; any other
    /// alignment is computed from the entry sizes.
    pub fn offset_of(&self, address: u64, alignment: u32) -> Option<u32> {
        let index = self
            .entries
            .iter()
            .position(|e| e.memory.offset_of(address).is_some())?;
        let entry = &self.entries[index];
        let inner = entry.memory.offset_of(address)?;
        let base = match alignment {
            0 | 1 => entry.offset,
            PAGE_SIZE => entry.offset_aligned,
            _ => self.entries[..index]
                .iter()
                .map(|e| align_up(e.memory.size(), alignment))
                .sum(),
        };
        base.checked_add(inner)
    }

    /// Total size when every entry starts at a multiple of `alignment`
    pub fn total_size_with(&self, alignment: u32) -> u32 {
        match alignment {
            0 | 1 => self.total_size,
            PAGE_SIZE => self.total_size_aligned,
            _ => self
                .entries
                .iter()
                .map(|e| align_up(e.memory.size(), alignment))
                .sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(sizes: &[u32]) -> MemoryContainer {
        let mut c = MemoryContainer::new();
        for &size in sizes {
            assert!(c.append(Memory::allocate(size).unwrap()).unwrap());
        }
        c
    }

    #[test]
    fn test_offsets_of_second_allocation() {
        let c = container(&[100, 50]);
        let second = c.entries()[1].memory().address();
        assert_eq!(c.offset_of(second + 10, 1), Some(110));
        assert_eq!(c.offset_of(second + 10, PAGE_SIZE), Some(4096 + 10));
        assert_eq!(c.offset_of(second + 10, 64), Some(128 + 10));
    }

    #[test]
    fn test_cumulative_offsets_are_monotonic() {
        let sizes = [100, 4096, 1, 5000, 64];
        let c = container(&sizes);
        for (k, entry) in c.entries().iter().enumerate() {
            let unaligned: u32 = sizes[..k].iter().sum();
            let aligned: u32 = sizes[..k].iter().map(|&s| align_up(s, PAGE_SIZE)).sum();
            assert_eq!(entry.offset(), unaligned);
            assert_eq!(entry.offset_aligned(), aligned);
        }
        assert_eq!(c.total_size(), sizes.iter().sum::<u32>());
        assert_eq!(c.total_size_aligned(), 4096 + 4096 + 4096 + 8192 + 4096);
    }

    #[test]
    fn test_duplicates_rejected() {
        let mem = Memory::allocate(10).unwrap();
        let mut c = MemoryContainer::new();
        assert!(c.append(mem.clone()).unwrap());
        assert!(!c.append(mem).unwrap());
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_containment() {
        let c = container(&[100]);
        let base = c.entries()[0].memory().address();
        assert!(c.contains(base + 90, 10));
        assert!(!c.contains(base + 90, 11));
        assert_eq!(c.offset_of(base + 100, 1), None);
        assert_eq!(c.offset_of(0x10, 1), None);
    }
}
