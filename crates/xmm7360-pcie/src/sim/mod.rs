//! Simulated modem peer and host platform, for driving the protocol engine without hardware.

mod memory;
mod modem;

pub use memory::SimDma;
pub use modem::{BarAccess, BootBehavior, SimModem, SimPlatform};
