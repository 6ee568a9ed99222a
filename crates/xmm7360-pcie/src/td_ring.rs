//! Transfer-descriptor rings.
//!
//! Each ring owns a descriptor array and one DMA page per slot. Slot `i`'s descriptor points
//! at page `i` for the whole life of the ring; only the length and flags change. Even ring
//! ids carry host-to-modem traffic, odd ids modem-to-host.

use std::fmt::Write as _;
use std::sync::RwLock;
use std::time::Duration;

use bitflags::bitflags;
use tracing::{debug, trace, warn, Level};

use crate::command::CommandChannel;
use crate::control_page::{ControlPage, OPCODE_RING_CLOSE, OPCODE_RING_OPEN, TD_RING_COUNT};
use crate::dma::{DmaAllocator, DmaRegion};
use crate::error::{Fault, ModemError, Result, RingKind};
use crate::regs::Doorbell;
use crate::ring::Ring;
use crate::wait::{read, write};

// Descriptor (`struct td_ring_entry`).
pub const TD_ADDR: usize = 0;
pub const TD_LENGTH: usize = 8;
pub const TD_FLAGS: usize = 10;
pub const TD_UNK: usize = 12;
pub const TD_BYTES: usize = 16;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TdFlags: u16 {
        /// Set by the modem on descriptors it finished with.
        const COMPLETE = 0x200;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RingId(u8);

impl RingId {
    pub fn new(id: u8) -> Option<Self> {
        ((id as usize) < TD_RING_COUNT).then_some(Self(id))
    }

    pub(crate) fn wrapping(id: u8) -> Self {
        Self(id % TD_RING_COUNT as u8)
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn direction(self) -> Direction {
        if self.0 & 1 == 0 {
            Direction::Outbound
        } else {
            Direction::Inbound
        }
    }

    pub fn all() -> impl Iterator<Item = RingId> {
        (0..TD_RING_COUNT as u8).map(RingId)
    }
}

impl core::fmt::Display for RingId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ring {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to modem.
    Outbound,
    /// Modem to host.
    Inbound,
}

pub struct TdRing {
    id: RingId,
    ring: Ring,
    page_size: usize,
    descriptors: DmaRegion,
    pages: Vec<DmaRegion>,
}

impl core::fmt::Debug for TdRing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TdRing")
            .field("id", &self.id)
            .field("capacity", &self.ring.capacity())
            .field("descriptors", &self.descriptors)
            .finish()
    }
}

impl TdRing {
    /// Allocates the descriptor array and one page per slot, binding each descriptor to its
    /// page. Nothing is published to the modem yet.
    pub fn allocate(
        id: RingId,
        capacity: usize,
        page_size: usize,
        dma: &dyn DmaAllocator,
    ) -> Result<Self> {
        let ring = Ring::new(capacity)?;
        let descriptors = dma.alloc_coherent(TD_BYTES * capacity)?;
        descriptors.fill(0);

        let mut pages = Vec::with_capacity(capacity);
        for slot in 0..capacity {
            let page = dma.alloc_coherent(page_size)?;
            descriptors.write_u64(slot * TD_BYTES + TD_ADDR, page.paddr());
            pages.push(page);
        }

        Ok(Self {
            id,
            ring,
            page_size,
            descriptors,
            pages,
        })
    }

    pub fn id(&self) -> RingId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Physical address of the descriptor array, as handed to the modem in `RING_OPEN`.
    pub fn descriptors_paddr(&self) -> u64 {
        self.descriptors.paddr()
    }

    pub fn is_full(&self, page: &ControlPage) -> bool {
        self.ring.is_full(page.s_wptr(self.id), page.s_rptr(self.id))
    }

    fn expect_direction(&self, direction: Direction) -> Result<()> {
        if self.id.direction() != direction {
            return Err(Fault::WrongDirection { ring: self.id }.into());
        }
        Ok(())
    }

    fn set_descriptor(&self, slot: u32, length: u16) {
        let base = slot as usize * TD_BYTES;
        self.descriptors.write_u16(base + TD_LENGTH, length);
        self.descriptors.write_u16(base + TD_FLAGS, 0);
        self.descriptors.write_u32(base + TD_UNK, 0);
    }

    fn publish(&self, page: &ControlPage, wptr: u32) -> Result<()> {
        let next = self
            .ring
            .advance(wptr, page.s_rptr(self.id), RingKind::Transfer(self.id))?;
        page.set_s_wptr(self.id, next);
        Ok(())
    }

    /// Copies `data` into the page at the write slot and hands the slot to the modem.
    /// The caller rings the transfer doorbell.
    pub fn post_outbound(&self, page: &ControlPage, data: &[u8]) -> Result<()> {
        self.expect_direction(Direction::Outbound)?;
        if data.len() > self.page_size {
            return Err(ModemError::PayloadTooLarge {
                len: data.len(),
                page_size: self.page_size,
            });
        }
        if self.is_full(page) {
            return Err(ModemError::RingFull {
                ring: RingKind::Transfer(self.id),
            });
        }

        let wptr = self.ring.wrap(page.s_wptr(self.id));
        self.pages[wptr as usize].write_bytes(0, data);
        self.set_descriptor(wptr, data.len() as u16);

        if tracing::enabled!(Level::TRACE) {
            trace!(ring = %self.id, slot = wptr, "write\n{}", hex_dump(data));
        }

        self.publish(page, wptr)
    }

    /// Re-arms the write slot as an empty receive buffer of a full page.
    pub fn post_inbound(&self, page: &ControlPage) -> Result<()> {
        self.expect_direction(Direction::Inbound)?;
        if self.is_full(page) {
            return Err(ModemError::RingFull {
                ring: RingKind::Transfer(self.id),
            });
        }

        let wptr = self.ring.wrap(page.s_wptr(self.id));
        self.set_descriptor(wptr, self.page_size as u16);
        self.publish(page, wptr)
    }

    /// Length the modem reported for `slot`, clamped to the page.
    pub fn completed_len(&self, slot: u32) -> usize {
        let slot = self.ring.wrap(slot) as usize;
        let len = self.descriptors.read_u16(slot * TD_BYTES + TD_LENGTH) as usize;
        len.min(self.page_size)
    }

    /// Copies up to `dst.len()` bytes of the completed `slot` and returns the count. Bytes
    /// beyond `dst` are dropped.
    pub fn copy_out(&self, slot: u32, dst: &mut [u8]) -> usize {
        let n = self.completed_len(slot).min(dst.len());
        self.pages[self.ring.wrap(slot) as usize].read_bytes(0, &mut dst[..n]);
        n
    }
}

/// Renders `data` as offset-prefixed rows of 16 hex bytes followed by their ASCII.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}:", row * 16);
        for digits in hex::encode(chunk).as_bytes().chunks(2) {
            out.push(' ');
            out.extend(digits.iter().map(|&d| d as char));
        }
        for _ in chunk.len()..16 {
            out.push_str("   ");
        }
        out.push_str("  ");
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push('\n');
    }
    out
}

/// The sixteen transfer-ring slots of one device, indexed by ring id.
pub struct RingTable {
    slots: [RwLock<Option<TdRing>>; TD_RING_COUNT],
}

impl core::fmt::Debug for RingTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RingTable")
            .field("live", &self.live_rings())
            .finish()
    }
}

impl Default for RingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RingTable {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| RwLock::new(None)),
        }
    }

    pub fn is_live(&self, id: RingId) -> bool {
        read(&self.slots[id.index()]).is_some()
    }

    pub fn live_rings(&self) -> Vec<RingId> {
        RingId::all().filter(|id| self.is_live(*id)).collect()
    }

    /// Shared access to a slot. Holding the guard keeps the ring's pages alive.
    pub fn get(&self, id: RingId) -> std::sync::RwLockReadGuard<'_, Option<TdRing>> {
        read(&self.slots[id.index()])
    }

    /// Allocates ring `id`, zeroes its pointers, submits `RING_OPEN` and rings the command
    /// doorbell. Returns once the command is submitted; the modem acknowledges later.
    pub fn create(
        &self,
        id: RingId,
        capacity: usize,
        page_size: usize,
        extra: u32,
        dma: &dyn DmaAllocator,
        cmd: &CommandChannel,
    ) -> Result<()> {
        let mut slot = write(&self.slots[id.index()]);
        if slot.is_some() {
            return Err(Fault::RingExists { ring: id }.into());
        }

        let ring = TdRing::allocate(id, capacity, page_size, dma)?;
        cmd.page().reset_ring_pointers(id);
        cmd.submit(
            OPCODE_RING_OPEN,
            id.raw(),
            capacity as u16,
            ring.descriptors_paddr(),
            extra,
        )?;
        cmd.ring_doorbell(Doorbell::Command);

        debug!(ring = %id, capacity, "transfer ring created");
        *slot = Some(ring);
        Ok(())
    }

    /// Submits `RING_CLOSE`, rings the command doorbell and frees the ring's memory.
    ///
    /// With `ack_timeout` set, the memory is only freed once the modem drained the command
    /// ring (or the timeout passed). Without it the buffers go immediately. If the close cannot
    /// be submitted the ring stays live, since the modem still owns its descriptors.
    pub fn destroy(
        &self,
        id: RingId,
        cmd: &CommandChannel,
        ack_timeout: Option<Duration>,
    ) -> Result<()> {
        let mut slot = write(&self.slots[id.index()]);
        if slot.is_none() {
            warn!(ring = %id, "tried destroying a ring that is not live");
            return Err(ModemError::NotFound);
        }

        if let Err(err) = cmd.submit(OPCODE_RING_CLOSE, id.raw(), 0, 0, 0) {
            warn!(ring = %id, %err, "could not submit ring close, keeping ring allocated");
            return Err(err);
        }
        cmd.ring_doorbell(Doorbell::Command);
        if let Some(timeout) = ack_timeout {
            if let Err(err) = cmd.wait_all_complete_timeout(timeout) {
                warn!(ring = %id, %err, "modem did not acknowledge ring close");
            }
        }

        *slot = None;
        debug!(ring = %id, "transfer ring destroyed");
        Ok(())
    }
}
