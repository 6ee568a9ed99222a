//! Protocol engine for the Intel XMM7360 PCIe LTE modem.
//!
//! The modem and the host share one control page and a set of transfer buffers in DMA memory.
//! The host configures the modem through a command ring, moves data through sixteen
//! transfer-descriptor rings grouped into eight queue pairs, and learns about progress via
//! interrupts. [`Device::probe`] runs the bring-up handshake and returns a handle exposing
//! `open`/`close`/`read`/`write` per queue pair.
//!
//! The host services (register mapping, DMA allocation, interrupt delivery) are abstracted by
//! [`Platform`]; [`sim`] provides a software modem implementing it.

pub mod command;
pub mod config;
pub mod control_page;
pub mod device;
pub mod dma;
pub mod error;
pub mod platform;
pub mod queue_pair;
pub mod regs;
pub mod ring;
pub mod sim;
pub mod td_ring;
pub mod wait;

pub use config::ModemConfig;
pub use control_page::DeviceStatus;
pub use device::Device;
pub use dma::{DmaAllocator, DmaError, DmaRegion};
pub use error::{Fault, ModemError, Result, RingKind};
pub use platform::{IrqError, IrqHandler, IrqRegistration, Platform};
pub use queue_pair::QueuePairId;
pub use regs::RegisterBank;
pub use td_ring::RingId;
pub use wait::{CancelToken, WaitQueue};
