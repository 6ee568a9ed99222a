//! Index arithmetic shared by the command ring and the transfer-descriptor rings.
//!
//! Both sides keep free-running pointers reduced modulo the capacity. One slot is always left
//! unused so that `w == r` means empty and `w + 1 == r` means full, without a separate count.

use crate::error::{Fault, RingKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ring {
    mask: u32,
}

impl Ring {
    pub fn new(capacity: usize) -> Result<Self, Fault> {
        if capacity < 2 || !capacity.is_power_of_two() || capacity > u32::MAX as usize {
            return Err(Fault::NotPowerOfTwo { size: capacity });
        }
        Ok(Self {
            mask: capacity as u32 - 1,
        })
    }

    pub fn capacity(&self) -> usize {
        self.mask as usize + 1
    }

    pub fn wrap(&self, ptr: u32) -> u32 {
        ptr & self.mask
    }

    pub fn next(&self, ptr: u32) -> u32 {
        self.wrap(ptr.wrapping_add(1))
    }

    pub fn is_empty(&self, wptr: u32, rptr: u32) -> bool {
        self.wrap(wptr) == self.wrap(rptr)
    }

    pub fn is_full(&self, wptr: u32, rptr: u32) -> bool {
        self.next(wptr) == self.wrap(rptr)
    }

    /// Slots written but not yet consumed.
    pub fn used(&self, wptr: u32, rptr: u32) -> usize {
        self.wrap(wptr.wrapping_sub(rptr)) as usize
    }

    /// Slots the producer may still fill.
    pub fn free(&self, wptr: u32, rptr: u32) -> usize {
        self.capacity() - 1 - self.used(wptr, rptr)
    }

    /// Returns the advanced write pointer, refusing to step onto the read pointer.
    ///
    /// Producers check [`Ring::is_full`] before writing a slot, so a refusal here means the
    /// slot that was just written overwrote unread data.
    pub fn advance(&self, wptr: u32, rptr: u32, ring: RingKind) -> Result<u32, Fault> {
        let next = self.next(wptr);
        if next == self.wrap(rptr) {
            return Err(Fault::Overrun { ring });
        }
        Ok(next)
    }
}
