use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::control_page::{
    layout, read_command_entry, CommandEntry, CommandFlags, CMD_RING_SIZE, OPCODE_RING_CLOSE,
    OPCODE_RING_OPEN,
};
use crate::dma::{DmaAllocator, DmaRegion};
use crate::platform::{IrqError, IrqHandler, IrqRegistration, Platform};
use crate::regs::{
    Doorbell, RegisterBank, BAR0_DOORBELL, BAR0_MODE, BAR0_WAKEUP, BAR2_BLANKS, BAR2_CONTROL,
    BAR2_CONTROLH, BAR2_MODE, BAR2_STATUS, MODE_INIT, MODE_RUNNING, STATUS_CRASHED,
    STATUS_READY,
};
use crate::td_ring::{RingId, TdFlags, TD_ADDR, TD_BYTES, TD_FLAGS, TD_LENGTH};
use crate::wait::lock;

use super::SimDma;

/// What the status register reports while the modem core boots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootBehavior {
    /// Reads zero `n` times, then the ready magic.
    ReadyAfter(u32),
    /// Stuck in the crash dump state.
    Crashed,
    /// Never leaves an unknown state.
    NeverReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarAccess {
    pub offset: u64,
    pub value: u32,
}

#[derive(Debug, Clone, Copy)]
struct SimRing {
    tds: u64,
    size: u32,
}

struct ModemState {
    boot: BootBehavior,
    status_reads: u32,
    control: [u32; 2],
    mode: u32,
    mode_ack: bool,
    running_ack: bool,
    blanks: [u32; 4],
    process_commands: bool,
    bar0_log: Vec<BarAccess>,
    wake_writes: usize,
    /// `s_wptr` of every ring, sampled at each transfer doorbell.
    transfer_doorbells: Vec<[u32; 16]>,
    commands: Vec<CommandEntry>,
    rings: [Option<SimRing>; 16],
    stale_accesses: usize,
}

struct ModemInner {
    dma: SimDma,
    state: Mutex<ModemState>,
    irq: Mutex<Option<Arc<dyn IrqHandler>>>,
}

/// Software model of the modem firmware's side of the protocol.
///
/// Command-ring doorbells are processed synchronously inside the register write, followed by
/// an interrupt on vector 0. Transfer traffic is driven explicitly by the test through
/// [`SimModem::consume_outbound`] and [`SimModem::deliver_inbound`].
#[derive(Clone)]
pub struct SimModem {
    inner: Arc<ModemInner>,
}

impl core::fmt::Debug for SimModem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("SimModem")
            .field("boot", &state.boot)
            .field("mode", &state.mode)
            .field("commands", &state.commands.len())
            .finish()
    }
}

impl SimModem {
    pub fn new(dma: SimDma) -> Self {
        Self::with_boot(dma, BootBehavior::ReadyAfter(0))
    }

    pub fn with_boot(dma: SimDma, boot: BootBehavior) -> Self {
        Self {
            inner: Arc::new(ModemInner {
                dma,
                state: Mutex::new(ModemState {
                    boot,
                    status_reads: 0,
                    control: [0; 2],
                    mode: 0,
                    mode_ack: true,
                    running_ack: true,
                    blanks: [0xffff_ffff; 4],
                    process_commands: true,
                    bar0_log: Vec::new(),
                    wake_writes: 0,
                    transfer_doorbells: Vec::new(),
                    commands: Vec::new(),
                    rings: [None; 16],
                    stale_accesses: 0,
                }),
                irq: Mutex::new(None),
            }),
        }
    }

    pub fn bar0(&self) -> Arc<dyn RegisterBank> {
        Arc::new(Bar0(self.clone()))
    }

    pub fn bar2(&self) -> Arc<dyn RegisterBank> {
        Arc::new(Bar2(self.clone()))
    }

    /// When off, mode writes are not reflected in the mode-status register.
    pub fn set_mode_ack(&self, ack: bool) {
        lock(&self.inner.state).mode_ack = ack;
    }

    /// When off, the modem acknowledges `MODE_INIT` but never reports interrupts enabled.
    pub fn set_running_ack(&self, ack: bool) {
        lock(&self.inner.state).running_ack = ack;
    }

    /// When off, command doorbells are ignored and `c_rptr` never moves.
    pub fn set_process_commands(&self, process: bool) {
        lock(&self.inner.state).process_commands = process;
    }

    pub fn bar0_writes(&self) -> Vec<BarAccess> {
        lock(&self.inner.state).bar0_log.clone()
    }

    pub fn clear_bar0_writes(&self) {
        lock(&self.inner.state).bar0_log.clear();
    }

    pub fn wake_writes(&self) -> usize {
        lock(&self.inner.state).wake_writes
    }

    /// Write pointers of all sixteen rings as seen at each transfer doorbell.
    pub fn transfer_doorbells(&self) -> Vec<[u32; 16]> {
        lock(&self.inner.state).transfer_doorbells.clone()
    }

    pub fn blanks(&self) -> [u32; 4] {
        lock(&self.inner.state).blanks
    }

    /// Every command consumed so far, in ring order.
    pub fn commands(&self) -> Vec<CommandEntry> {
        lock(&self.inner.state).commands.clone()
    }

    /// Device-side accesses that hit memory the host had already freed.
    pub fn stale_accesses(&self) -> usize {
        lock(&self.inner.state).stale_accesses
    }

    pub fn control_page_paddr(&self) -> u64 {
        let state = lock(&self.inner.state);
        control_paddr(&state)
    }

    /// Whether the modem currently considers `ring` open.
    pub fn ring_open(&self, ring: RingId) -> bool {
        lock(&self.inner.state).rings[ring.index()].is_some()
    }

    pub fn set_asleep(&self, asleep: bool) {
        let state = lock(&self.inner.state);
        if let Some(cp) = self.control_page(&state) {
            cp.store_u32(layout::STATUS_ASLEEP, asleep as u32);
        }
    }

    pub fn raise_irq(&self, vector: usize) {
        let handler = lock(&self.inner.irq).clone();
        if let Some(handler) = handler {
            handler.handle_irq(vector);
        }
    }

    /// Receive buffers the host has armed on `ring` and the modem has not filled yet.
    pub fn armed_inbound(&self, ring: RingId) -> usize {
        let state = lock(&self.inner.state);
        let (Some(cp), Some(sim)) = (self.control_page(&state), state.rings[ring.index()]) else {
            return 0;
        };
        let w = cp.load_u32(layout::s_wptr(ring.index()));
        let r = cp.load_u32(layout::s_rptr(ring.index()));
        (w.wrapping_sub(r) & (sim.size - 1)) as usize
    }

    /// Takes the oldest unconsumed frame off outbound `ring`, completing its descriptor.
    pub fn consume_outbound(&self, ring: RingId) -> Option<Vec<u8>> {
        let frame = {
            let mut state = lock(&self.inner.state);
            let cp = self.control_page(&state)?;
            let sim = state.rings[ring.index()]?;
            let r = cp.load_u32(layout::s_rptr(ring.index()));
            let w = cp.load_u32(layout::s_wptr(ring.index()));
            if r == w {
                return None;
            }

            let Some(td) = self.map_td(&mut state, sim, r) else {
                return None;
            };
            let len = td.read_u16(TD_LENGTH) as usize;
            let addr = td.read_u64(TD_ADDR);
            let Some(page) = self.map(&mut state, addr, len.max(1)) else {
                return None;
            };
            let mut frame = vec![0; len];
            page.read_bytes(0, &mut frame);
            td.write_u16(TD_FLAGS, TdFlags::COMPLETE.bits());
            cp.store_u32(layout::s_rptr(ring.index()), (r + 1) & (sim.size - 1));
            trace!(%ring, slot = r, len, "modem consumed frame");
            frame
        };
        self.raise_irq(0);
        Some(frame)
    }

    pub fn drain_outbound(&self, ring: RingId) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| self.consume_outbound(ring)).collect()
    }

    /// Fills the next armed receive buffer of inbound `ring` with `data` and raises irq0.
    /// Returns `false` when the host has no buffer armed.
    pub fn deliver_inbound(&self, ring: RingId, data: &[u8]) -> bool {
        {
            let mut state = lock(&self.inner.state);
            let (Some(cp), Some(sim)) = (self.control_page(&state), state.rings[ring.index()])
            else {
                return false;
            };
            let r = cp.load_u32(layout::s_rptr(ring.index()));
            let w = cp.load_u32(layout::s_wptr(ring.index()));
            if r == w {
                return false;
            }

            let Some(td) = self.map_td(&mut state, sim, r) else {
                return false;
            };
            let room = td.read_u16(TD_LENGTH) as usize;
            assert!(
                data.len() <= room,
                "frame of {} bytes does not fit armed buffer of {room}",
                data.len()
            );
            let addr = td.read_u64(TD_ADDR);
            let Some(page) = self.map(&mut state, addr, room) else {
                return false;
            };
            page.write_bytes(0, data);
            td.write_u16(TD_LENGTH, data.len() as u16);
            td.write_u16(TD_FLAGS, TdFlags::COMPLETE.bits());
            cp.store_u32(layout::s_rptr(ring.index()), (r + 1) & (sim.size - 1));
            trace!(%ring, slot = r, len = data.len(), "modem delivered frame");
        }
        self.raise_irq(0);
        true
    }

    fn control_page(&self, state: &ModemState) -> Option<DmaRegion> {
        let paddr = control_paddr(state);
        if paddr == 0 {
            return None;
        }
        self.inner.dma.map(paddr, layout::PAGE_BYTES)
    }

    fn map(&self, state: &mut ModemState, paddr: u64, len: usize) -> Option<DmaRegion> {
        let region = self.inner.dma.map(paddr, len);
        if region.is_none() {
            state.stale_accesses += 1;
        }
        region
    }

    fn map_td(&self, state: &mut ModemState, ring: SimRing, slot: u32) -> Option<DmaRegion> {
        self.map(state, ring.tds + (slot as usize * TD_BYTES) as u64, TD_BYTES)
    }

    /// Consumes every ready command between `c_rptr` and `c_wptr`.
    fn process_commands(&self) {
        let processed = {
            let mut state = lock(&self.inner.state);
            if !state.process_commands {
                return;
            }
            let Some(cp) = self.control_page(&state) else {
                return;
            };

            let mut processed = 0;
            loop {
                let r = cp.load_u32(layout::C_RPTR);
                if r == cp.load_u32(layout::C_WPTR) {
                    break;
                }
                let entry = read_command_entry(&cp, r);
                let flags = CommandFlags::from_bits_retain(entry.flags);
                if !flags.contains(CommandFlags::READY) {
                    break;
                }

                let ring = entry.parm as usize % 16;
                match entry.opcode {
                    OPCODE_RING_OPEN => {
                        state.rings[ring] = Some(SimRing {
                            tds: entry.ptr,
                            size: (entry.len as u32).max(1),
                        })
                    }
                    OPCODE_RING_CLOSE => state.rings[ring] = None,
                    _ => {}
                }
                debug!(opcode = entry.opcode, parm = entry.parm, "modem consumed command");

                cp.store_u32(
                    layout::c_ring_entry(r as usize) + layout::CMD_FLAGS,
                    (flags | CommandFlags::DONE).bits(),
                );
                state.commands.push(entry);
                cp.store_u32(layout::C_RPTR, (r + 1) % CMD_RING_SIZE as u32);
                processed += 1;
            }
            processed
        };
        if processed > 0 {
            self.raise_irq(0);
        }
    }

    fn write_bar0(&self, offset: u64, value: u32) {
        let mut state = lock(&self.inner.state);
        state.bar0_log.push(BarAccess { offset, value });
        match offset {
            BAR0_WAKEUP => {
                state.wake_writes += 1;
                if let Some(cp) = self.control_page(&state) {
                    cp.store_u32(layout::STATUS_ASLEEP, 0);
                }
            }
            BAR0_MODE => {
                if state.mode_ack && (value != MODE_RUNNING || state.running_ack) {
                    state.mode = value;
                }
                if value == MODE_INIT {
                    if let Some(cp) = self.control_page(&state) {
                        cp.store_u32(layout::STATUS_CODE, STATUS_READY);
                        cp.store_u32(layout::STATUS_MODE, value);
                    }
                }
            }
            BAR0_DOORBELL if value == Doorbell::Command as u32 => {
                drop(state);
                self.process_commands();
            }
            BAR0_DOORBELL => {
                if let Some(cp) = self.control_page(&state) {
                    let wptrs = std::array::from_fn(|ring| cp.load_u32(layout::s_wptr(ring)));
                    state.transfer_doorbells.push(wptrs);
                }
            }
            _ => {}
        }
    }

    fn read_bar2(&self, offset: u64) -> u32 {
        let mut state = lock(&self.inner.state);
        match offset {
            BAR2_STATUS => match state.boot {
                BootBehavior::ReadyAfter(n) => {
                    state.status_reads += 1;
                    if state.status_reads > n {
                        STATUS_READY
                    } else {
                        0
                    }
                }
                BootBehavior::Crashed => STATUS_CRASHED,
                BootBehavior::NeverReady => 0x0bad_b007,
            },
            BAR2_MODE => state.mode,
            BAR2_CONTROL => state.control[0],
            BAR2_CONTROLH => state.control[1],
            _ => BAR2_BLANKS
                .iter()
                .position(|reg| *reg == offset)
                .map_or(0, |i| state.blanks[i]),
        }
    }

    fn write_bar2(&self, offset: u64, value: u32) {
        let mut state = lock(&self.inner.state);
        match offset {
            BAR2_CONTROL => state.control[0] = value,
            BAR2_CONTROLH => state.control[1] = value,
            _ => {
                if let Some(i) = BAR2_BLANKS.iter().position(|reg| *reg == offset) {
                    state.blanks[i] = value;
                }
            }
        }
    }

    fn set_irq_handler(&self, handler: Option<Arc<dyn IrqHandler>>) {
        *lock(&self.inner.irq) = handler;
    }
}

fn control_paddr(state: &ModemState) -> u64 {
    ((state.control[1] as u64) << 32) | state.control[0] as u64
}

struct Bar0(SimModem);

impl RegisterBank for Bar0 {
    fn read32(&self, _offset: u64) -> u32 {
        0
    }

    fn write32(&self, offset: u64, value: u32) {
        self.0.write_bar0(offset, value);
    }
}

struct Bar2(SimModem);

impl RegisterBank for Bar2 {
    fn read32(&self, offset: u64) -> u32 {
        self.0.read_bar2(offset)
    }

    fn write32(&self, offset: u64, value: u32) {
        self.0.write_bar2(offset, value);
    }
}

/// [`Platform`] wiring a [`SimModem`] to a [`SimDma`].
pub struct SimPlatform {
    modem: SimModem,
    dma: SimDma,
    live_irqs: Arc<AtomicUsize>,
    fail_irqs: AtomicBool,
}

impl core::fmt::Debug for SimPlatform {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimPlatform")
            .field("modem", &self.modem)
            .field("dma", &self.dma)
            .field("live_irqs", &self.live_irq_registrations())
            .finish()
    }
}

impl SimPlatform {
    pub fn new(boot: BootBehavior) -> Self {
        let dma = SimDma::new();
        Self {
            modem: SimModem::with_boot(dma.clone(), boot),
            dma,
            live_irqs: Arc::new(AtomicUsize::new(0)),
            fail_irqs: AtomicBool::new(false),
        }
    }

    /// A modem that is already booted.
    pub fn ready() -> Self {
        Self::new(BootBehavior::ReadyAfter(0))
    }

    pub fn modem(&self) -> &SimModem {
        &self.modem
    }

    pub fn sim_dma(&self) -> &SimDma {
        &self.dma
    }

    pub fn live_irq_registrations(&self) -> usize {
        self.live_irqs.load(Ordering::SeqCst)
    }

    pub fn fail_irq_requests(&self, fail: bool) {
        self.fail_irqs.store(fail, Ordering::SeqCst);
    }
}

impl Platform for SimPlatform {
    fn bar0(&self) -> Arc<dyn RegisterBank> {
        self.modem.bar0()
    }

    fn bar2(&self) -> Arc<dyn RegisterBank> {
        self.modem.bar2()
    }

    fn dma(&self) -> Arc<dyn DmaAllocator> {
        Arc::new(self.dma.clone())
    }

    fn request_irqs(
        &self,
        count: usize,
        handler: Arc<dyn IrqHandler>,
    ) -> Result<Box<dyn IrqRegistration>, IrqError> {
        if self.fail_irqs.load(Ordering::SeqCst) {
            return Err(IrqError::VectorsUnavailable { requested: count });
        }
        self.modem.set_irq_handler(Some(handler));
        self.live_irqs.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimIrqRegistration {
            modem: self.modem.clone(),
            live: self.live_irqs.clone(),
        }))
    }
}

struct SimIrqRegistration {
    modem: SimModem,
    live: Arc<AtomicUsize>,
}

impl IrqRegistration for SimIrqRegistration {}

impl Drop for SimIrqRegistration {
    fn drop(&mut self) {
        self.modem.set_irq_handler(None);
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}
