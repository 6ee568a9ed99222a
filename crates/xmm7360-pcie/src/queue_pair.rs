//! Queue pairs: the eight bidirectional byte channels built from transfer-ring pairs.
//!
//! Pair `n` sends on ring `2n` and receives on ring `2n + 1`. Open/close transitions are
//! serialized per pair; readers and writers of distinct pairs never contend.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use tracing::{info, trace, warn};

use crate::device::Core;
use crate::error::{Fault, ModemError, Result, RingKind};
use crate::regs::Doorbell;
use crate::ring::Ring;
use crate::td_ring::RingId;
use crate::wait::{lock, CancelToken, WaitQueue};

pub const QUEUE_PAIR_COUNT: usize = 8;

/// Command slots an open may need: two `RING_OPEN`s plus two `RING_CLOSE`s on rollback.
const OPEN_COMMAND_BUDGET: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueuePairId(u8);

impl QueuePairId {
    pub fn new(id: u8) -> Option<Self> {
        ((id as usize) < QUEUE_PAIR_COUNT).then_some(Self(id))
    }

    pub(crate) fn wrapping(id: u8) -> Self {
        Self(id % QUEUE_PAIR_COUNT as u8)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn tx_ring(self) -> RingId {
        RingId::wrapping(self.0 * 2)
    }

    pub fn rx_ring(self) -> RingId {
        RingId::wrapping(self.0 * 2 + 1)
    }

    /// Name of the character device node exposing this pair.
    pub fn node_name(self) -> String {
        format!("xmm{}", self.0)
    }

    pub fn all() -> impl Iterator<Item = QueuePairId> {
        (0..QUEUE_PAIR_COUNT as u8).map(QueuePairId)
    }
}

impl core::fmt::Display for QueuePairId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "qp{}", self.0)
    }
}

#[derive(Debug)]
pub struct QueuePair {
    id: QueuePairId,
    /// Held across open and close.
    lifecycle: Mutex<()>,
    open: AtomicBool,
    /// Set while one reader owns the receive cursor.
    reader_active: AtomicBool,
    writer: Mutex<()>,
    /// Next receive slot to hand to a reader.
    last_handled: AtomicU32,
    rx: Ring,
    wq: WaitQueue,
}

impl QueuePair {
    pub(crate) fn new(id: QueuePairId, rx: Ring) -> Self {
        Self {
            id,
            lifecycle: Mutex::new(()),
            open: AtomicBool::new(false),
            reader_active: AtomicBool::new(false),
            writer: Mutex::new(()),
            last_handled: AtomicU32::new(0),
            rx,
            wq: WaitQueue::new(),
        }
    }

    pub fn id(&self) -> QueuePairId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn wait_queue(&self) -> &WaitQueue {
        &self.wq
    }

    pub fn last_handled(&self) -> u32 {
        self.last_handled.load(Ordering::Acquire)
    }

    fn has_completion(&self, core: &Core) -> bool {
        let rptr = self.rx.wrap(core.cmd.page().s_rptr(self.id.rx_ring()));
        rptr != self.last_handled()
    }

    pub(crate) fn open(&self, core: &Core) -> Result<()> {
        let _guard = lock(&self.lifecycle);
        if self.is_open() {
            return Err(ModemError::Busy);
        }

        info!(qp = %self.id, "opening queue pair");
        let (tx, rx) = (self.id.tx_ring(), self.id.rx_ring());
        let cfg = &core.config;
        let dma = core.dma.as_ref();

        // Rings an earlier close could not hand back to the modem are released first.
        for ring in [tx, rx] {
            if core.rings.is_live(ring) {
                core.rings.destroy(ring, &core.cmd, None)?;
            }
        }
        if core.cmd.free_slots() < OPEN_COMMAND_BUDGET {
            return Err(ModemError::RingFull {
                ring: RingKind::Command,
            });
        }

        core.rings.create(
            tx,
            cfg.ring_capacity,
            cfg.page_size,
            cfg.ring_open_extra,
            dma,
            &core.cmd,
        )?;
        if let Err(err) = core.rings.create(
            rx,
            cfg.ring_capacity,
            cfg.page_size,
            cfg.ring_open_extra,
            dma,
            &core.cmd,
        ) {
            self.roll_back(core, &[tx]);
            return Err(err);
        }
        core.cmd.ring_doorbell(Doorbell::Command);

        if let Err(err) = self.prearm(core) {
            self.roll_back(core, &[tx, rx]);
            return Err(err);
        }
        core.cmd.ring_doorbell(Doorbell::Transfer);

        self.last_handled.store(0, Ordering::Release);
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    /// Destroys rings created by a failed open. A ring whose close cannot be submitted stays
    /// live and is released by the next open.
    fn roll_back(&self, core: &Core, rings: &[RingId]) {
        for &ring in rings {
            if let Err(err) = core.rings.destroy(ring, &core.cmd, None) {
                warn!(qp = %self.id, %ring, %err, "ring left live after failed open");
            }
        }
    }

    /// Hands every free inbound slot to the modem.
    fn prearm(&self, core: &Core) -> Result<()> {
        let rx = self.id.rx_ring();
        let slot = core.rings.get(rx);
        let ring = slot.as_ref().ok_or(Fault::RingMissing { ring: rx })?;
        while !ring.is_full(core.cmd.page()) {
            ring.post_inbound(core.cmd.page())?;
        }
        Ok(())
    }

    pub(crate) fn close(&self, core: &Core) -> Result<()> {
        let _guard = lock(&self.lifecycle);
        if !self.open.swap(false, Ordering::AcqRel) {
            return Err(ModemError::NotFound);
        }

        // Pending readers observe the closed flag and leave before the pages go.
        self.wq.wake_all();

        let ack = core
            .config
            .close_waits_for_ack
            .then_some(core.config.command_timeout);
        let tx = core.rings.destroy(self.id.tx_ring(), &core.cmd, ack);
        let rx = core.rings.destroy(self.id.rx_ring(), &core.cmd, ack);
        info!(qp = %self.id, "closed queue pair");
        tx.and(rx)
    }

    /// Posts `data` to the outbound ring and rings the transfer doorbell. Never blocks.
    pub(crate) fn write(&self, core: &Core, data: &[u8]) -> Result<usize> {
        if data.len() > core.config.page_size {
            return Err(ModemError::PayloadTooLarge {
                len: data.len(),
                page_size: core.config.page_size,
            });
        }

        let _writer = lock(&self.writer);
        if !self.is_open() {
            return Err(ModemError::NotFound);
        }
        {
            let slot = core.rings.get(self.id.tx_ring());
            let Some(ring) = slot.as_ref() else {
                return Err(ModemError::NotFound);
            };
            ring.post_outbound(core.cmd.page(), data)?;
        }
        core.cmd.ring_doorbell(Doorbell::Transfer);
        trace!(qp = %self.id, len = data.len(), "queued frame");
        Ok(data.len())
    }

    /// Waits until no other reader is active on this pair and takes the receive cursor.
    ///
    /// The wait goes through the pair's queue so a queued reader stays cancellable.
    fn claim_reader(&self, cancel: &CancelToken) -> Result<ReaderClaim<'_>> {
        let mut claimed = false;
        self.wq.wait_event(cancel, || {
            if !self.is_open() {
                return true;
            }
            claimed = !self.reader_active.swap(true, Ordering::AcqRel);
            claimed
        })?;
        if !claimed {
            return Err(ModemError::NotFound);
        }
        Ok(ReaderClaim { pair: self })
    }

    /// Blocks for the next received frame and copies up to `buf.len()` bytes of it.
    ///
    /// The rest of a frame larger than `buf` is discarded.
    pub(crate) fn read(&self, core: &Core, buf: &mut [u8], cancel: &CancelToken) -> Result<usize> {
        let _reader = self.claim_reader(cancel)?;
        let rx = self.id.rx_ring();

        loop {
            self.wq
                .wait_event(cancel, || !self.is_open() || self.has_completion(core))?;

            let slot = core.rings.get(rx);
            let Some(ring) = slot.as_ref().filter(|_| self.is_open()) else {
                return Err(ModemError::NotFound);
            };
            // Closed and reopened while we were waking up.
            if !self.has_completion(core) {
                continue;
            }

            let idx = self.last_handled();
            let n = ring.copy_out(idx, buf);
            trace!(
                qp = %self.id,
                slot = idx,
                len = ring.completed_len(idx),
                copied = n,
                "received frame"
            );
            ring.post_inbound(core.cmd.page())?;
            // Advanced under the slot guard so a concurrent close/reopen cannot interleave.
            self.last_handled.store(self.rx.next(idx), Ordering::Release);
            drop(slot);

            core.cmd.ring_doorbell(Doorbell::Transfer);
            return Ok(n);
        }
    }
}

/// Releases the receive cursor and lets the next queued reader in.
struct ReaderClaim<'a> {
    pair: &'a QueuePair,
}

impl Drop for ReaderClaim<'_> {
    fn drop(&mut self) {
        self.pair.reader_active.store(false, Ordering::Release);
        self.pair.wq.wake_all();
    }
}
