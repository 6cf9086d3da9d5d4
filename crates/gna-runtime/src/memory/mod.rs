// SPDX-License-Identifier: AGPL-3.0-only

//! Device-visible memory allocations
//!
//! A [`Memory`] is a page-aligned, zero-initialised host allocation that the
//! driver maps for device access. Operands of a model refer to bytes inside
//! these allocations by address; the runtime never copies them.
//!
//! Reads and writes go through bounds-checked copies. Concurrent scoring of
//! requests that write the same bytes is the caller's problem, exactly as it
//! would be with the device writing through DMA.

mod container;

pub use container::{ContainerEntry, MemoryContainer};

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use gna_chip::{MemoryTag, PAGE_SIZE};
use parking_lot::Mutex;

use crate::driver::MappingId;
use crate::error::{GnaError, Result};

static NEXT_MEMORY_ID: AtomicU64 = AtomicU64::new(1);

/// Round `value` up to a multiple of `alignment` (a power of two)
pub const fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Page-aligned allocation shared between host and device
#[derive(Debug)]
pub struct Memory {
    id: u64,
    ptr: NonNull<u8>,
    size: u32,
    layout: Layout,
    tag: AtomicU32,
    mapping: Mutex<Option<MappingId>>,
    pinned: AtomicBool,
}

// SAFETY: Memory owns its allocation exclusively; all access goes through
// bounds-checked copies via the raw pointer, never through shared references.
unsafe impl Send for Memory {}

// SAFETY: see Send. Interior state is atomics or behind a mutex; the byte
// contents follow device DMA semantics (concurrent writers race on data only).
unsafe impl Sync for Memory {}

impl Memory {
    /// Allocate `size` bytes, rounded up to whole pages and zeroed
    ///
    /// # Errors
    ///
    /// [`GnaError::MemorySizeInvalid`] for zero or oversized requests,
    /// [`GnaError::OutOfMemory`] when the host allocator fails.
    pub fn allocate(size: u32) -> Result<Arc<Self>> {
        if size == 0 || size > u32::MAX - PAGE_SIZE {
            return Err(GnaError::MemorySizeInvalid {
                size: u64::from(size),
            });
        }
        let padded = align_up(size, PAGE_SIZE) as usize;
        let layout = Layout::from_size_align(padded, PAGE_SIZE as usize).map_err(|_| {
            GnaError::MemorySizeInvalid {
                size: u64::from(size),
            }
        })?;

        // SAFETY: layout has non-zero size and a power-of-two alignment; the
        // pointer is released in Drop with the same layout.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(GnaError::OutOfMemory {
            size: u64::from(size),
        })?;

        let id = NEXT_MEMORY_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Allocated memory {id}: {size} bytes at {raw:p}");
        Ok(Arc::new(Self {
            id,
            ptr,
            size,
            layout,
            tag: AtomicU32::new(MemoryTag::UNTAGGED),
            mapping: Mutex::new(None),
            pinned: AtomicBool::new(false),
        }))
    }

    /// Unique allocation id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Host address of the first byte
    pub fn address(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Requested size in bytes
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Size rounded up to whole pages
    pub fn allocated_size(&self) -> u32 {
        align_up(self.size, PAGE_SIZE)
    }

    /// Raw tag value
    pub fn raw_tag(&self) -> u32 {
        self.tag.load(Ordering::Acquire)
    }

    /// Decoded tag; `None` when untagged or unknown
    pub fn tag(&self) -> Option<MemoryTag> {
        MemoryTag::from_raw(self.raw_tag())
    }

    /// Set the raw tag value
    pub fn set_raw_tag(&self, tag: u32) {
        self.tag.store(tag, Ordering::Release);
    }

    /// Set the tag
    pub fn set_tag(&self, tag: MemoryTag) {
        self.set_raw_tag(tag.raw());
    }

    /// True when `[address, address + size)` lies inside this allocation
    pub fn contains(&self, address: u64, size: u64) -> bool {
        let start = self.address();
        let end = start + u64::from(self.size);
        address >= start && address.checked_add(size).is_some_and(|e| e <= end)
    }

    /// Offset of `address` inside the allocation
    pub fn offset_of(&self, address: u64) -> Option<u32> {
        let start = self.address();
        if address >= start && address < start + u64::from(self.size) {
            u32::try_from(address - start).ok()
        } else {
            None
        }
    }

    fn check_range(&self, offset: u32, len: usize) -> Result<()> {
        let end = u64::from(offset) + len as u64;
        if end > u64::from(self.size) {
            return Err(GnaError::buffer_invalid(
                self.address() + u64::from(offset),
                format!("{len} bytes at offset {offset} exceed allocation of {}", self.size),
            ));
        }
        Ok(())
    }

    /// Copy bytes out of the allocation
    ///
    /// # Errors
    ///
    /// [`GnaError::MemoryBufferInvalid`] when the range leaves the allocation.
    pub fn read(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        // SAFETY: range checked above; source and destination cannot overlap
        // because buf is a distinct Rust borrow.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(offset as usize),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Copy bytes out into a new vector
    ///
    /// # Errors
    ///
    /// Same as [`Memory::read`].
    pub fn read_vec(&self, offset: u32, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.read(offset, &mut buf)?;
        Ok(buf)
    }

    /// Copy bytes into the allocation
    ///
    /// # Errors
    ///
    /// [`GnaError::MemoryBufferInvalid`] when the range leaves the allocation.
    pub fn write(&self, offset: u32, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        // SAFETY: range checked above; data is a distinct Rust borrow.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.ptr.as_ptr().add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    /// Snapshot of the whole allocation
    pub fn to_bytes(&self) -> Bytes {
        self.read_vec(0, self.size as usize)
            .map(Bytes::from)
            .unwrap_or_default()
    }

    /// Mapping id handed out by the driver
    pub fn mapping(&self) -> Option<MappingId> {
        *self.mapping.lock()
    }

    pub(crate) fn set_mapping(&self, mapping: Option<MappingId>) -> Option<MappingId> {
        std::mem::replace(&mut *self.mapping.lock(), mapping)
    }

    /// Lock the pages in RAM so the device never faults on them.
    ///
    /// Best effort: an `RLIMIT_MEMLOCK` refusal is logged and ignored.
    pub fn pin(&self) {
        if self.pinned.load(Ordering::Acquire) {
            return;
        }
        #[cfg(unix)]
        {
            // SAFETY: the range is exactly the allocation made in allocate().
            match unsafe { rustix::mm::mlock(self.ptr.as_ptr().cast(), self.layout.size()) } {
                Ok(()) => self.pinned.store(true, Ordering::Release),
                Err(e) => tracing::warn!("mlock of memory {} failed: {e}", self.id),
            }
        }
    }

    /// True when [`Memory::pin`] succeeded
    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if self.pinned.load(Ordering::Acquire) {
                // SAFETY: the range was mlock'd in pin() and is still allocated.
                let _ = unsafe { rustix::mm::munlock(self.ptr.as_ptr().cast(), self.layout.size()) };
            }
        }
        // SAFETY: ptr was allocated in allocate() with exactly this layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_page_aligned_and_zeroed() {
        let mem = Memory::allocate(100).unwrap();
        assert_eq!(mem.address() % u64::from(PAGE_SIZE), 0);
        assert_eq!(mem.size(), 100);
        assert_eq!(mem.allocated_size(), PAGE_SIZE);
        assert!(mem.read_vec(0, 100).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            Memory::allocate(0),
            Err(GnaError::MemorySizeInvalid { size: 0 })
        ));
    }

    #[test]
    fn test_read_write_bounds() {
        let mem = Memory::allocate(16).unwrap();
        mem.write(8, &[1, 2, 3, 4]).unwrap();
        assert_eq!(mem.read_vec(8, 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(mem.write(14, &[0; 4]).is_err());
        assert!(mem.read_vec(16, 1).is_err());
    }

    #[test]
    fn test_containment() {
        let mem = Memory::allocate(64).unwrap();
        let base = mem.address();
        assert!(mem.contains(base, 64));
        assert!(mem.contains(base + 60, 4));
        assert!(!mem.contains(base + 60, 5));
        assert!(!mem.contains(base - 1, 1));
        assert_eq!(mem.offset_of(base + 10), Some(10));
        assert_eq!(mem.offset_of(base + 64), None);
    }

    #[test]
    fn test_tags() {
        let mem = Memory::allocate(8).unwrap();
        assert_eq!(mem.tag(), None);
        mem.set_tag(MemoryTag::Scratch);
        assert_eq!(mem.tag(), Some(MemoryTag::Scratch));
        mem.set_raw_tag(0x7);
        assert_eq!(mem.tag(), None);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(65, 64), 128);
    }
}
