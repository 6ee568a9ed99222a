//! Device instance: bring-up, interrupt dispatch, and the per-pair operations exposed to the
//! character-device layer.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use tracing::{debug, error, info, trace, warn};

use crate::command::CommandChannel;
use crate::config::ModemConfig;
use crate::control_page::{
    ControlPage, DeviceStatus, HANDSHAKE_PARM, OPCODE_HANDSHAKE, OPCODE_WAKEUP,
};
use crate::dma::DmaAllocator;
use crate::error::{Fault, ModemError, Result};
use crate::platform::{IrqHandler, IrqRegistration, Platform, IRQ_VECTOR_COUNT};
use crate::queue_pair::{QueuePair, QueuePairId};
use crate::regs::{
    Doorbell, RegisterBank, BAR0_MODE, BAR2_BLANKS, BAR2_CONTROL, BAR2_CONTROLH, BAR2_MODE,
    BAR2_STATUS, MODE_INIT, MODE_OFF, MODE_RUNNING, STATUS_CRASHED, STATUS_READY,
};
use crate::ring::Ring;
use crate::td_ring::RingTable;
use crate::wait::CancelToken;

/// State shared between callers and the interrupt handler.
pub(crate) struct Core {
    pub(crate) bar0: Arc<dyn RegisterBank>,
    pub(crate) bar2: Arc<dyn RegisterBank>,
    pub(crate) dma: Arc<dyn DmaAllocator>,
    pub(crate) config: ModemConfig,
    pub(crate) cmd: CommandChannel,
    pub(crate) rings: RingTable,
    pub(crate) pairs: [QueuePair; crate::queue_pair::QUEUE_PAIR_COUNT],
    faulted: AtomicBool,
}

impl Core {
    fn handle_irq(&self, vector: usize) {
        match vector {
            0 => {
                trace!("irq0");
                self.cmd.wait_queue().wake_all();
                for pair in self.pairs.iter().filter(|p| p.is_open()) {
                    pair.wait_queue().wake_all();
                }
            }
            _ => warn!(vector, "interrupt on reserved vector"),
        }
    }
}

/// Interrupt entry point. Only wakes waiters; they recheck the control page themselves.
struct IrqDispatch {
    core: Weak<Core>,
}

impl IrqHandler for IrqDispatch {
    fn handle_irq(&self, vector: usize) {
        if let Some(core) = self.core.upgrade() {
            core.handle_irq(vector);
        }
    }
}

/// A brought-up modem.
///
/// Dropping the device closes every open queue pair, turns the modem's mode register off,
/// unregisters interrupts and frees the control page.
pub struct Device {
    core: Arc<Core>,
    irqs: Option<Box<dyn IrqRegistration>>,
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("cmd", &self.core.cmd)
            .field("rings", &self.core.rings)
            .field("faulted", &self.is_faulted())
            .finish()
    }
}

impl Device {
    /// Brings the modem from power-on to accepting commands.
    ///
    /// On any failure everything acquired so far is released before the error is returned.
    pub fn probe(platform: &dyn Platform, config: ModemConfig) -> Result<Self> {
        config.validate()?;

        let bar0 = platform.bar0();
        let bar2 = platform.bar2();
        let dma = platform.dma();
        let page = ControlPage::new(dma.as_ref())?;
        let cmd = CommandChannel::new(page, bar0.clone())?;
        let rx = Ring::new(config.ring_capacity)?;

        let core = Arc::new(Core {
            bar0,
            bar2,
            dma,
            config,
            cmd,
            rings: RingTable::new(),
            pairs: std::array::from_fn(|i| QueuePair::new(QueuePairId::wrapping(i as u8), rx)),
            faulted: AtomicBool::new(false),
        });
        let mut device = Device { core, irqs: None };

        let handler = Arc::new(IrqDispatch {
            core: Arc::downgrade(&device.core),
        });
        device.irqs = Some(platform.request_irqs(IRQ_VECTOR_COUNT, handler)?);

        if let Err(err) = device.bring_up() {
            error!(%err, "could not bring up modem");
            return Err(err);
        }
        Ok(device)
    }

    fn bring_up(&self) -> Result<()> {
        let core = &*self.core;
        let cfg = &core.config;

        info!("waiting for modem core to boot");
        let mut status = 0;
        for attempt in 0..cfg.boot_poll_attempts {
            status = core.bar2.read32(BAR2_STATUS);
            if status == STATUS_READY {
                break;
            }
            if status == STATUS_CRASHED {
                error!("modem is in crash dump state");
                return Err(Fault::Crashed { status }.into());
            }
            if attempt + 1 < cfg.boot_poll_attempts {
                thread::sleep(cfg.boot_poll_interval);
            }
        }
        if status != STATUS_READY {
            error!(status = format_args!("0x{status:08x}"), "unknown modem status");
            return Err(ModemError::Timeout { what: "modem boot" });
        }

        let paddr = core.cmd.page().paddr();
        debug!(paddr = format_args!("0x{paddr:x}"), "installing control page");
        core.bar2.write32(BAR2_CONTROL, paddr as u32);
        core.bar2.write32(BAR2_CONTROLH, (paddr >> 32) as u32);

        core.bar0.write32(BAR0_MODE, MODE_INIT);
        self.poll_mode("mode init", |mode| mode != 0)?;

        for reg in BAR2_BLANKS {
            core.bar2.write32(reg, 0);
        }

        core.bar0.write32(BAR0_MODE, MODE_RUNNING);
        self.poll_mode("interrupt enable", |mode| mode == MODE_RUNNING)?;

        core.cmd.submit(OPCODE_WAKEUP, 0, 1, 0, 0)?;
        core.cmd.submit(OPCODE_HANDSHAKE, HANDSHAKE_PARM, 0, 0, 0)?;
        self.dump_state();
        core.cmd.ring_doorbell(Doorbell::Command);
        core.cmd.wait_all_complete_timeout(cfg.command_timeout)?;
        self.dump_state();

        info!("modem ready");
        Ok(())
    }

    fn poll_mode(&self, what: &'static str, reached: impl Fn(u32) -> bool) -> Result<()> {
        let cfg = &self.core.config;
        for attempt in 0..cfg.mode_poll_attempts {
            if reached(self.core.bar2.read32(BAR2_MODE)) {
                return Ok(());
            }
            if attempt + 1 < cfg.mode_poll_attempts {
                thread::sleep(cfg.mode_poll_interval);
            }
        }
        error!(what, "modem did not reach mode");
        Err(ModemError::Timeout { what })
    }

    /// Runs `op` unless the device is poisoned, poisoning it if `op` hits a fault.
    fn run<R>(&self, op: impl FnOnce(&Core) -> Result<R>) -> Result<R> {
        if self.is_faulted() {
            return Err(ModemError::Faulted);
        }
        let res = op(&self.core);
        if let Err(err) = &res {
            if err.is_fatal() && !self.core.faulted.swap(true, Ordering::AcqRel) {
                error!(%err, "protocol fault, disabling device");
                self.dump_state();
            }
        }
        res
    }

    pub fn open(&self, id: QueuePairId) -> Result<()> {
        self.run(|core| core.pairs[id.index()].open(core))
    }

    pub fn close(&self, id: QueuePairId) -> Result<()> {
        self.run(|core| core.pairs[id.index()].close(core))
    }

    /// Queues one frame; returns the number of bytes accepted.
    pub fn write(&self, id: QueuePairId, data: &[u8]) -> Result<usize> {
        self.run(|core| core.pairs[id.index()].write(core, data))
    }

    /// Blocks for the next frame and returns at most `max_len` bytes of it.
    pub fn read(&self, id: QueuePairId, max_len: usize, cancel: &CancelToken) -> Result<Vec<u8>> {
        // A frame never spans more than one transfer page.
        let mut buf = vec![0; max_len.min(self.core.config.page_size)];
        let n = self.read_into(id, &mut buf, cancel)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn read_into(
        &self,
        id: QueuePairId,
        buf: &mut [u8],
        cancel: &CancelToken,
    ) -> Result<usize> {
        self.run(|core| core.pairs[id.index()].read(core, buf, cancel))
    }

    /// Blocks until the modem consumed every submitted command.
    pub fn wait_commands(&self, cancel: &CancelToken) -> Result<()> {
        self.run(|core| core.cmd.wait_all_complete(cancel))
    }

    pub fn pair(&self, id: QueuePairId) -> &QueuePair {
        &self.core.pairs[id.index()]
    }

    pub fn is_faulted(&self) -> bool {
        self.core.faulted.load(Ordering::Acquire)
    }

    pub fn status(&self) -> DeviceStatus {
        self.core.cmd.page().status()
    }

    pub fn control_page_paddr(&self) -> u64 {
        self.core.cmd.page().paddr()
    }

    pub fn config(&self) -> &ModemConfig {
        &self.core.config
    }

    pub fn dump_state(&self) {
        let page = self.core.cmd.page();
        let status = page.status();
        trace!(
            status = format_args!("{:08x}", status.code),
            asleep = status.asleep,
            c_rptr = page.c_rptr(),
            c_wptr = page.c_wptr(),
            "modem state"
        );
        for ring in self.core.rings.live_rings() {
            trace!(
                %ring,
                s_rptr = page.s_rptr(ring),
                s_wptr = page.s_wptr(ring),
                "transfer ring state"
            );
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        for pair in &self.core.pairs {
            if pair.is_open() {
                if let Err(err) = pair.close(&self.core) {
                    warn!(qp = %pair.id(), %err, "error closing queue pair during teardown");
                }
            }
        }
        self.core.bar0.write32(BAR0_MODE, MODE_OFF);
        drop(self.irqs.take());
        debug!("modem torn down");
    }
}
