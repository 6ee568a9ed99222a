//! The control page: one DMA block holding every structure the modem and the host share
//! outside the transfer buffers.
//!
//! Layout (little-endian, offsets in bytes):
//!
//! | offset | field                                                        |
//! |--------|--------------------------------------------------------------|
//! | 0      | header: physical addresses of the fields below + ring size   |
//! | 56     | status block (code, mode, asleep, pad), modem-written        |
//! | 72     | `s_wptr[16]` transfer ring write pointers                    |
//! | 136    | `s_rptr[16]` transfer ring read pointers                     |
//! | 200    | `c_wptr`, `c_rptr` command ring pointers                     |
//! | 208    | `c_ring[128]` command entries, 24 bytes each                 |
//!
//! The header is filled once at allocation; the modem learns the page's physical address
//! during bring-up and never sees it change.

use bitflags::bitflags;

use crate::dma::{DmaAllocator, DmaError, DmaRegion};
use crate::td_ring::RingId;

pub const CMD_RING_SIZE: usize = 0x80;
pub const TD_RING_COUNT: usize = 16;

pub mod layout {
    use super::{CMD_RING_SIZE, TD_RING_COUNT};

    // Header (`struct control`).
    pub const CTL_STATUS: usize = 0;
    pub const CTL_S_WPTR: usize = 8;
    pub const CTL_S_RPTR: usize = 16;
    pub const CTL_C_WPTR: usize = 24;
    pub const CTL_C_RPTR: usize = 32;
    pub const CTL_C_RING: usize = 40;
    pub const CTL_C_RING_SIZE: usize = 48;
    pub const CTL_BYTES: usize = 56;

    pub const STATUS: usize = CTL_BYTES;
    pub const STATUS_CODE: usize = STATUS;
    pub const STATUS_MODE: usize = STATUS + 4;
    pub const STATUS_ASLEEP: usize = STATUS + 8;
    pub const STATUS_BYTES: usize = 16;

    pub const S_WPTR: usize = STATUS + STATUS_BYTES;
    pub const S_RPTR: usize = S_WPTR + 4 * TD_RING_COUNT;
    pub const C_WPTR: usize = S_RPTR + 4 * TD_RING_COUNT;
    pub const C_RPTR: usize = C_WPTR + 4;
    pub const C_RING: usize = C_RPTR + 4;

    // Command entry (`struct cmd_ring_entry`).
    pub const CMD_PTR: usize = 0;
    pub const CMD_LEN: usize = 8;
    pub const CMD_PARM: usize = 10;
    pub const CMD_OPCODE: usize = 11;
    pub const CMD_EXTRA: usize = 12;
    pub const CMD_UNK: usize = 16;
    pub const CMD_FLAGS: usize = 20;
    pub const CMD_ENTRY_BYTES: usize = 24;

    pub const PAGE_BYTES: usize = C_RING + CMD_ENTRY_BYTES * CMD_RING_SIZE;

    pub const fn s_wptr(ring: usize) -> usize {
        S_WPTR + 4 * ring
    }

    pub const fn s_rptr(ring: usize) -> usize {
        S_RPTR + 4 * ring
    }

    pub const fn c_ring_entry(slot: usize) -> usize {
        C_RING + CMD_ENTRY_BYTES * slot
    }
}

pub const OPCODE_RING_OPEN: u8 = 1;
pub const OPCODE_RING_CLOSE: u8 = 3;
pub const OPCODE_WAKEUP: u8 = 4;
/// Second bring-up command; the modem expects it right after the first wake-up.
pub const OPCODE_HANDSHAKE: u8 = 0xf0;
pub const HANDSHAKE_PARM: u8 = 0x80;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandFlags: u32 {
        /// Set by the modem once it consumed the entry.
        const DONE = 1;
        /// Set by the host, last, once the entry is fully written.
        const READY = 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandEntry {
    pub ptr: u64,
    pub len: u16,
    pub parm: u8,
    pub opcode: u8,
    pub extra: u32,
    pub flags: u32,
}

/// Snapshot of the modem-written status block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStatus {
    pub code: u32,
    pub mode: u32,
    pub asleep: bool,
}

pub struct ControlPage {
    region: DmaRegion,
}

impl core::fmt::Debug for ControlPage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ControlPage")
            .field("paddr", &format_args!("0x{:x}", self.paddr()))
            .field("c_wptr", &self.c_wptr())
            .field("c_rptr", &self.c_rptr())
            .finish()
    }
}

impl ControlPage {
    pub fn new(dma: &dyn DmaAllocator) -> Result<Self, DmaError> {
        let region = dma.alloc_coherent(layout::PAGE_BYTES)?;
        region.fill(0);

        let base = region.paddr();
        let at = |offset: usize| base + offset as u64;
        region.write_u64(layout::CTL_STATUS, at(layout::STATUS));
        region.write_u64(layout::CTL_S_WPTR, at(layout::S_WPTR));
        region.write_u64(layout::CTL_S_RPTR, at(layout::S_RPTR));
        region.write_u64(layout::CTL_C_WPTR, at(layout::C_WPTR));
        region.write_u64(layout::CTL_C_RPTR, at(layout::C_RPTR));
        region.write_u64(layout::CTL_C_RING, at(layout::C_RING));
        region.write_u16(layout::CTL_C_RING_SIZE, CMD_RING_SIZE as u16);

        Ok(Self { region })
    }

    pub fn paddr(&self) -> u64 {
        self.region.paddr()
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            code: self.region.load_u32(layout::STATUS_CODE),
            mode: self.region.load_u32(layout::STATUS_MODE),
            asleep: self.region.load_u32(layout::STATUS_ASLEEP) != 0,
        }
    }

    pub fn is_asleep(&self) -> bool {
        self.region.load_u32(layout::STATUS_ASLEEP) != 0
    }

    pub fn c_wptr(&self) -> u32 {
        self.region.load_u32(layout::C_WPTR)
    }

    pub fn set_c_wptr(&self, value: u32) {
        self.region.store_u32(layout::C_WPTR, value);
    }

    pub fn c_rptr(&self) -> u32 {
        self.region.load_u32(layout::C_RPTR)
    }

    pub fn s_wptr(&self, ring: RingId) -> u32 {
        self.region.load_u32(layout::s_wptr(ring.index()))
    }

    pub fn set_s_wptr(&self, ring: RingId, value: u32) {
        self.region.store_u32(layout::s_wptr(ring.index()), value);
    }

    pub fn s_rptr(&self, ring: RingId) -> u32 {
        self.region.load_u32(layout::s_rptr(ring.index()))
    }

    /// Zeroes both pointers of `ring` before it is (re)opened.
    pub fn reset_ring_pointers(&self, ring: RingId) {
        self.region.store_u32(layout::s_rptr(ring.index()), 0);
        self.region.store_u32(layout::s_wptr(ring.index()), 0);
    }

    /// Writes `entry` into `slot`. The flags word goes last with release ordering: the modem
    /// may start parsing the entry as soon as it observes the ready flag.
    pub fn write_command(&self, slot: u32, entry: &CommandEntry) {
        let base = layout::c_ring_entry(slot as usize % CMD_RING_SIZE);
        self.region.write_u64(base + layout::CMD_PTR, entry.ptr);
        self.region.write_u16(base + layout::CMD_LEN, entry.len);
        self.region.write_u8(base + layout::CMD_PARM, entry.parm);
        self.region.write_u8(base + layout::CMD_OPCODE, entry.opcode);
        self.region.write_u32(base + layout::CMD_EXTRA, entry.extra);
        self.region.write_u32(base + layout::CMD_UNK, 0);
        self.region.store_u32(base + layout::CMD_FLAGS, entry.flags);
    }

    pub fn read_command(&self, slot: u32) -> CommandEntry {
        read_command_entry(&self.region, slot)
    }
}

/// Decodes command slot `slot` from a control page mapping.
pub fn read_command_entry(page: &DmaRegion, slot: u32) -> CommandEntry {
    let base = layout::c_ring_entry(slot as usize % CMD_RING_SIZE);
    CommandEntry {
        ptr: page.read_u64(base + layout::CMD_PTR),
        len: page.read_u16(base + layout::CMD_LEN),
        parm: page.read_u8(base + layout::CMD_PARM),
        opcode: page.read_u8(base + layout::CMD_OPCODE),
        extra: page.read_u32(base + layout::CMD_EXTRA),
        flags: page.load_u32(base + layout::CMD_FLAGS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDma;
    use proptest::prelude::*;

    #[test]
    fn layout_matches_modem_abi() {
        assert_eq!(layout::STATUS, 56);
        assert_eq!(layout::S_WPTR, 72);
        assert_eq!(layout::S_RPTR, 136);
        assert_eq!(layout::C_WPTR, 200);
        assert_eq!(layout::C_RPTR, 204);
        assert_eq!(layout::C_RING, 208);
        assert_eq!(layout::PAGE_BYTES, 3280);
        assert!(layout::PAGE_BYTES <= 4096);
    }

    #[test]
    fn header_points_at_own_fields() {
        let dma = SimDma::new();
        let cp = ControlPage::new(&dma).unwrap();
        let base = cp.paddr();
        let header = &cp.region;

        assert_eq!(header.read_u64(layout::CTL_STATUS), base + 56);
        assert_eq!(header.read_u64(layout::CTL_S_WPTR), base + 72);
        assert_eq!(header.read_u64(layout::CTL_S_RPTR), base + 136);
        assert_eq!(header.read_u64(layout::CTL_C_WPTR), base + 200);
        assert_eq!(header.read_u64(layout::CTL_C_RPTR), base + 204);
        assert_eq!(header.read_u64(layout::CTL_C_RING), base + 208);
        assert_eq!(header.read_u16(layout::CTL_C_RING_SIZE), 128);
        assert_eq!(cp.c_wptr(), 0);
        assert_eq!(cp.status(), DeviceStatus::default());
    }

    #[test]
    fn command_roundtrips_through_slot() {
        let dma = SimDma::new();
        let cp = ControlPage::new(&dma).unwrap();
        let entry = CommandEntry {
            ptr: 0x1_2345_6000,
            len: 8,
            parm: 7,
            opcode: OPCODE_RING_OPEN,
            extra: 0x60,
            flags: CommandFlags::READY.bits(),
        };
        cp.write_command(127, &entry);
        assert_eq!(cp.read_command(127), entry);
        assert_eq!(cp.read_command(0), CommandEntry::default());
    }

    proptest! {
        #[test]
        fn ring_pointer_updates_stay_in_their_slot(
            writes in prop::collection::vec((0usize..16, any::<bool>(), any::<u32>()), 1..64),
        ) {
            let dma = SimDma::new();
            let cp = ControlPage::new(&dma).unwrap();
            let mut model_w = [0u32; 16];
            let mut model_r = [0u32; 16];

            for (ring, is_write, value) in writes {
                let id = RingId::new(ring as u8).unwrap();
                if is_write {
                    cp.set_s_wptr(id, value);
                    model_w[ring] = value;
                } else {
                    cp.region.store_u32(layout::s_rptr(ring), value);
                    model_r[ring] = value;
                }
            }

            for ring in 0..16 {
                let id = RingId::new(ring as u8).unwrap();
                prop_assert_eq!(cp.s_wptr(id), model_w[ring]);
                prop_assert_eq!(cp.s_rptr(id), model_r[ring]);
            }
            prop_assert_eq!(cp.c_wptr(), 0);
            prop_assert_eq!(cp.c_rptr(), 0);
        }
    }
}
