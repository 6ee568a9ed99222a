//! Host side of the command ring.
//!
//! Submission and notification are split: [`CommandChannel::submit`] only publishes an entry,
//! [`CommandChannel::ring_doorbell`] tells the modem to look. Callers batch several
//! submissions behind one doorbell.

use core::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace};

use crate::control_page::{CommandEntry, CommandFlags, ControlPage, CMD_RING_SIZE};
use crate::error::{ModemError, Result, RingKind};
use crate::regs::{Doorbell, RegisterBank, BAR0_DOORBELL, BAR0_WAKEUP};
use crate::ring::Ring;
use crate::wait::{lock, CancelToken, WaitQueue};

pub struct CommandChannel {
    page: ControlPage,
    bar0: Arc<dyn RegisterBank>,
    ring: Ring,
    /// Serializes writers of `c_wptr` and the slot it names.
    submit: Mutex<()>,
    /// Woken by interrupt vector 0 whenever the modem made progress.
    wq: WaitQueue,
}

impl core::fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandChannel")
            .field("page", &self.page)
            .field("pending", &self.pending())
            .finish()
    }
}

impl CommandChannel {
    pub fn new(page: ControlPage, bar0: Arc<dyn RegisterBank>) -> Result<Self> {
        Ok(Self {
            page,
            bar0,
            ring: Ring::new(CMD_RING_SIZE)?,
            submit: Mutex::new(()),
            wq: WaitQueue::new(),
        })
    }

    pub fn page(&self) -> &ControlPage {
        &self.page
    }

    pub fn wait_queue(&self) -> &WaitQueue {
        &self.wq
    }

    /// Commands submitted but not yet consumed by the modem.
    pub fn pending(&self) -> usize {
        self.ring.used(self.page.c_wptr(), self.page.c_rptr())
    }

    /// Entries that can still be submitted before the ring is full.
    pub fn free_slots(&self) -> usize {
        self.ring.free(self.page.c_wptr(), self.page.c_rptr())
    }

    pub fn submit(&self, opcode: u8, parm: u8, len: u16, ptr: u64, extra: u32) -> Result<()> {
        let _guard = lock(&self.submit);

        let wptr = self.ring.wrap(self.page.c_wptr());
        let rptr = self.page.c_rptr();
        if self.ring.is_full(wptr, rptr) {
            return Err(ModemError::RingFull {
                ring: RingKind::Command,
            });
        }

        debug!(
            opcode = format_args!("0x{opcode:x}"),
            parm = format_args!("0x{parm:02x}"),
            len = format_args!("0x{len:04x}"),
            ptr = format_args!("0x{ptr:x}"),
            slot = wptr,
            "submitting command"
        );

        self.page.write_command(
            wptr,
            &CommandEntry {
                ptr,
                len,
                parm,
                opcode,
                extra,
                flags: CommandFlags::READY.bits(),
            },
        );

        let next = self.ring.advance(wptr, rptr, RingKind::Command)?;
        self.page.set_c_wptr(next);
        Ok(())
    }

    fn drained(&self) -> bool {
        self.ring.wrap(self.page.c_rptr()) == self.ring.wrap(self.page.c_wptr())
    }

    /// Blocks until the modem consumed every submitted command.
    pub fn wait_all_complete(&self, cancel: &CancelToken) -> Result<()> {
        self.wq.wait_event(cancel, || self.drained())
    }

    pub fn wait_all_complete_timeout(&self, timeout: Duration) -> Result<()> {
        if self.wq.wait_event_timeout(timeout, || self.drained()) {
            Ok(())
        } else {
            Err(ModemError::Timeout {
                what: "command ring to drain",
            })
        }
    }

    /// Notifies the modem that `which` ring class has new entries, waking it first if the
    /// status block says it is asleep.
    pub fn ring_doorbell(&self, which: Doorbell) {
        // Ring and pointer writes must land before the MMIO write the modem reacts to.
        fence(Ordering::SeqCst);
        if self.page.is_asleep() {
            trace!("modem asleep, waking before doorbell");
            self.bar0.write32(BAR0_WAKEUP, 1);
        }
        debug!(doorbell = ?which, "ringing doorbell");
        self.bar0.write32(BAR0_DOORBELL, which as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_page::{OPCODE_HANDSHAKE, OPCODE_WAKEUP};
    use crate::sim::{BarAccess, SimDma, SimModem};

    fn channel() -> (SimDma, CommandChannel) {
        let dma = SimDma::new();
        let page = ControlPage::new(&dma).unwrap();
        // No test here rings the command doorbell, so the modem never consumes entries.
        let modem = SimModem::new(dma.clone());
        let channel = CommandChannel::new(page, modem.bar0()).unwrap();
        (dma, channel)
    }

    #[test]
    fn submit_publishes_entry_and_advances_wptr() {
        let (_dma, ch) = channel();
        ch.submit(OPCODE_WAKEUP, 0, 1, 0, 0).unwrap();
        ch.submit(OPCODE_HANDSHAKE, 0x80, 0, 0, 0).unwrap();

        assert_eq!(ch.page().c_wptr(), 2);
        assert_eq!(ch.pending(), 2);
        let first = ch.page().read_command(0);
        assert_eq!(first.opcode, OPCODE_WAKEUP);
        assert_eq!(first.len, 1);
        assert_eq!(first.flags, CommandFlags::READY.bits());
        assert_eq!(ch.page().read_command(1).parm, 0x80);
    }

    #[test]
    fn full_ring_rejects_without_touching_state() {
        let (_dma, ch) = channel();
        for _ in 0..CMD_RING_SIZE - 1 {
            ch.submit(OPCODE_WAKEUP, 0, 1, 0, 0).unwrap();
        }
        let before = ch.page().read_command(CMD_RING_SIZE as u32 - 1);
        assert_eq!(
            ch.submit(OPCODE_WAKEUP, 0, 1, 0, 0),
            Err(ModemError::RingFull {
                ring: RingKind::Command
            })
        );
        assert_eq!(ch.page().c_wptr(), CMD_RING_SIZE as u32 - 1);
        assert_eq!(ch.page().read_command(CMD_RING_SIZE as u32 - 1), before);
    }

    #[test]
    fn drain_wait_times_out_when_modem_is_silent() {
        let (_dma, ch) = channel();
        ch.wait_all_complete_timeout(Duration::from_millis(1)).unwrap();
        ch.submit(OPCODE_WAKEUP, 0, 1, 0, 0).unwrap();
        assert!(matches!(
            ch.wait_all_complete_timeout(Duration::from_millis(5)),
            Err(ModemError::Timeout { .. })
        ));
    }

    #[test]
    fn doorbell_skips_wake_while_awake() {
        let dma = SimDma::new();
        let modem = SimModem::new(dma.clone());
        let page = ControlPage::new(&dma).unwrap();
        let ch = CommandChannel::new(page, modem.bar0()).unwrap();

        ch.ring_doorbell(Doorbell::Transfer);
        assert_eq!(
            modem.bar0_writes(),
            vec![BarAccess {
                offset: BAR0_DOORBELL,
                value: Doorbell::Transfer as u32
            }]
        );
    }
}
