//! Device-visible memory shared with the modem.
//!
//! A [`DmaRegion`] is a physically contiguous block the modem reads and writes behind the
//! CPU's back. Pointer words that both sides update concurrently go through atomic 32-bit
//! accesses; descriptor fields and payload bytes use volatile accesses since ownership of
//! those bytes is handed over by the ring protocol itself.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DmaError {
    #[error("out of DMA memory allocating {len} bytes")]
    OutOfMemory { len: usize },

    #[error("zero-length DMA allocation")]
    ZeroLength,
}

/// Allocator of coherent, device-visible memory.
pub trait DmaAllocator: Send + Sync {
    /// Allocates `len` zeroed bytes, aligned to at least 8 bytes.
    fn alloc_coherent(&self, len: usize) -> Result<DmaRegion, DmaError>;
}

/// Returns a region to whoever handed it out. Called exactly once, from `Drop`.
pub trait DmaRelease: Send + Sync {
    fn release(&self, paddr: u64, vaddr: NonNull<u8>, len: usize);
}

pub struct DmaRegion {
    vaddr: NonNull<u8>,
    paddr: u64,
    len: usize,
    owner: Arc<dyn DmaRelease>,
}

// The region is plain memory; concurrent access discipline is enforced by the accessors.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl core::fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaRegion")
            .field("paddr", &format_args!("0x{:x}", self.paddr))
            .field("len", &self.len)
            .finish()
    }
}

impl DmaRegion {
    /// Wraps an allocation made by a [`DmaAllocator`].
    ///
    /// # Safety
    /// `vaddr` must point to `len` bytes that stay valid and device-visible at `paddr` until
    /// `owner.release` is called, and must be aligned to at least 8 bytes.
    pub unsafe fn from_raw(
        vaddr: NonNull<u8>,
        paddr: u64,
        len: usize,
        owner: Arc<dyn DmaRelease>,
    ) -> Self {
        debug_assert_eq!(vaddr.as_ptr() as usize % 8, 0);
        Self {
            vaddr,
            paddr,
            len,
            owner,
        }
    }

    pub fn paddr(&self) -> u64 {
        self.paddr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Physical address of `offset` within the region.
    pub fn paddr_at(&self, offset: usize) -> u64 {
        assert!(offset <= self.len, "offset {offset} past end of {:?}", self);
        self.paddr + offset as u64
    }

    fn ptr_at(&self, offset: usize, size: usize) -> *mut u8 {
        let end = offset.checked_add(size);
        assert!(
            end.is_some_and(|end| end <= self.len),
            "access of {size} bytes at {offset} outside {:?}",
            self
        );
        // SAFETY: bounds checked above.
        unsafe { self.vaddr.as_ptr().add(offset) }
    }

    fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        assert_eq!(offset % 4, 0, "unaligned pointer word at {offset}");
        // SAFETY: in bounds, 4-byte aligned, and the memory lives as long as `self`.
        unsafe { &*(self.ptr_at(offset, 4) as *const AtomicU32) }
    }

    /// Loads a word the peer may be updating concurrently.
    pub fn load_u32(&self, offset: usize) -> u32 {
        self.atomic_u32(offset).load(Ordering::Acquire)
    }

    /// Publishes a word; every earlier write to the region is visible before it.
    pub fn store_u32(&self, offset: usize, value: u32) {
        self.atomic_u32(offset).store(value, Ordering::Release)
    }

    pub fn read_u8(&self, offset: usize) -> u8 {
        // SAFETY: in bounds.
        unsafe { self.ptr_at(offset, 1).read_volatile() }
    }

    pub fn write_u8(&self, offset: usize, value: u8) {
        // SAFETY: in bounds.
        unsafe { self.ptr_at(offset, 1).write_volatile(value) }
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        // SAFETY: in bounds; unaligned-safe.
        u16::from_le(unsafe { (self.ptr_at(offset, 2) as *const u16).read_unaligned() })
    }

    pub fn write_u16(&self, offset: usize, value: u16) {
        let bytes = value.to_le_bytes();
        self.write_u8(offset, bytes[0]);
        self.write_u8(offset + 1, bytes[1]);
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        self.read_bytes(offset, &mut buf);
        u32::from_le_bytes(buf)
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        self.read_bytes(offset, &mut buf);
        u64::from_le_bytes(buf)
    }

    pub fn write_u64(&self, offset: usize, value: u64) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        let src = self.ptr_at(offset, dst.len());
        for (i, byte) in dst.iter_mut().enumerate() {
            // SAFETY: `src..src + dst.len()` is in bounds.
            *byte = unsafe { src.add(i).read_volatile() };
        }
    }

    pub fn write_bytes(&self, offset: usize, src: &[u8]) {
        let dst = self.ptr_at(offset, src.len());
        for (i, byte) in src.iter().enumerate() {
            // SAFETY: `dst..dst + src.len()` is in bounds.
            unsafe { dst.add(i).write_volatile(*byte) };
        }
    }

    pub fn fill(&self, value: u8) {
        let dst = self.ptr_at(0, self.len);
        for i in 0..self.len {
            // SAFETY: whole region.
            unsafe { dst.add(i).write_volatile(value) };
        }
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        self.owner.release(self.paddr, self.vaddr, self.len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDma;

    #[test]
    fn scalar_accessors_are_little_endian() {
        let dma = SimDma::new();
        let region = dma.alloc_coherent(64).unwrap();

        region.write_u64(0, 0x1122_3344_5566_7788);
        region.write_u16(8, 0xbeef);
        region.write_u8(10, 0x5a);
        region.store_u32(12, 0xdead_beef);

        let mut raw = [0u8; 16];
        region.read_bytes(0, &mut raw);
        assert_eq!(&raw[0..8], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&raw[8..10], &[0xef, 0xbe]);
        assert_eq!(raw[10], 0x5a);
        assert_eq!(region.read_u32(12), 0xdead_beef);
        assert_eq!(region.load_u32(12), 0xdead_beef);
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn out_of_bounds_access_panics() {
        let dma = SimDma::new();
        let region = dma.alloc_coherent(16).unwrap();
        region.write_u64(12, 0);
    }

    #[test]
    fn drop_returns_memory_to_allocator() {
        let dma = SimDma::new();
        let a = dma.alloc_coherent(4096).unwrap();
        let b = dma.alloc_coherent(100).unwrap();
        assert_eq!(dma.live_allocations(), 2);
        assert_ne!(a.paddr(), b.paddr());
        drop(a);
        assert_eq!(dma.live_allocations(), 1);
        drop(b);
        assert_eq!(dma.live_allocations(), 0);
    }
}
