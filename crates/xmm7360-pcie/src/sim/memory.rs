use core::ptr::NonNull;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::dma::{DmaAllocator, DmaError, DmaRegion, DmaRelease};
use crate::wait::lock;

const PAGE: u64 = 0x1000;
/// First synthetic bus address; above 4 GiB so both halves of a pointer matter.
const BASE_PADDR: u64 = 0x1_0000_0000;

struct Block {
    ptr: NonNull<u64>,
    words: usize,
    len: usize,
    live: bool,
}

#[derive(Default)]
struct MemState {
    next_paddr: u64,
    blocks: BTreeMap<u64, Block>,
    live: usize,
    fail_after: Option<usize>,
}

// Blocks are plain heap memory owned by the state.
unsafe impl Send for MemState {}

struct SimMemory {
    state: Mutex<MemState>,
}

impl Drop for SimMemory {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        for block in state.blocks.values() {
            // SAFETY: produced by `Box::into_raw` on a `[u64]` of `words` elements, freed once.
            drop(unsafe {
                Box::from_raw(core::ptr::slice_from_raw_parts_mut(
                    block.ptr.as_ptr(),
                    block.words,
                ))
            });
        }
    }
}

impl DmaRelease for SimMemory {
    fn release(&self, paddr: u64, _vaddr: NonNull<u8>, _len: usize) {
        let mut state = lock(&self.state);
        let released = match state.blocks.get_mut(&paddr) {
            Some(block) if block.live => {
                block.live = false;
                true
            }
            _ => false,
        };
        assert!(released, "double free of DMA block 0x{paddr:x}");
        state.live -= 1;
    }
}

/// Device-side view of host memory. Keeps the backing storage alive but never frees blocks.
struct DeviceMapping(#[allow(dead_code)] Arc<SimMemory>);

impl DmaRelease for DeviceMapping {
    fn release(&self, _paddr: u64, _vaddr: NonNull<u8>, _len: usize) {}
}

/// Coherent DMA memory backed by the heap, at synthetic page-aligned bus addresses.
///
/// Released blocks keep their backing storage until the allocator itself goes away, so a
/// simulated device touching freed memory is detected through [`SimDma::map`] instead of
/// corrupting the test process.
#[derive(Clone)]
pub struct SimDma {
    memory: Arc<SimMemory>,
}

impl core::fmt::Debug for SimDma {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimDma")
            .field("live", &self.live_allocations())
            .finish()
    }
}

impl Default for SimDma {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDma {
    pub fn new() -> Self {
        Self {
            memory: Arc::new(SimMemory {
                state: Mutex::new(MemState {
                    next_paddr: BASE_PADDR,
                    ..MemState::default()
                }),
            }),
        }
    }

    pub fn live_allocations(&self) -> usize {
        lock(&self.memory.state).live
    }

    /// Lets the next `n` allocations succeed, then fails every later one.
    pub fn fail_after(&self, n: usize) {
        lock(&self.memory.state).fail_after = Some(n);
    }

    pub fn is_live(&self, paddr: u64) -> bool {
        let state = lock(&self.memory.state);
        state
            .blocks
            .range(..=paddr)
            .next_back()
            .is_some_and(|(start, block)| block.live && paddr < start + block.len as u64)
    }

    /// Maps `len` bytes at bus address `paddr` the way the device sees them. Returns `None`
    /// unless the range lies inside one live allocation.
    pub fn map(&self, paddr: u64, len: usize) -> Option<DmaRegion> {
        let state = lock(&self.memory.state);
        let (start, block) = state.blocks.range(..=paddr).next_back()?;
        let offset = (paddr - start) as usize;
        if !block.live || offset.checked_add(len)? > block.len {
            return None;
        }
        // SAFETY: in bounds of a block whose storage lives as long as `self.memory`; the
        // mapping's owner holds a reference to it.
        let vaddr = unsafe { NonNull::new_unchecked((block.ptr.as_ptr() as *mut u8).add(offset)) };
        let owner = Arc::new(DeviceMapping(self.memory.clone()));
        Some(unsafe { DmaRegion::from_raw(vaddr, paddr, len, owner) })
    }
}

impl DmaAllocator for SimDma {
    fn alloc_coherent(&self, len: usize) -> Result<DmaRegion, DmaError> {
        if len == 0 {
            return Err(DmaError::ZeroLength);
        }

        let mut state = lock(&self.memory.state);
        if let Some(remaining) = state.fail_after.as_mut() {
            if *remaining == 0 {
                return Err(DmaError::OutOfMemory { len });
            }
            *remaining -= 1;
        }

        let words = len.div_ceil(8);
        let storage: Box<[u64]> = vec![0u64; words].into_boxed_slice();
        let raw = Box::into_raw(storage) as *mut u64;
        // SAFETY: `Box::into_raw` never returns null.
        let ptr = unsafe { NonNull::new_unchecked(raw) };

        let paddr = state.next_paddr;
        // Leave an unmapped page between blocks.
        state.next_paddr += (len as u64).div_ceil(PAGE) * PAGE + PAGE;
        state.blocks.insert(
            paddr,
            Block {
                ptr,
                words,
                len,
                live: true,
            },
        );
        state.live += 1;

        // SAFETY: `ptr` addresses `len` zeroed, 8-aligned bytes that stay allocated until
        // `self.memory` drops, which the region's owner handle prevents.
        Ok(unsafe { DmaRegion::from_raw(ptr.cast(), paddr, len, self.memory.clone()) })
    }
}
