//! Register map of the two BARs and the bring-up magic values.
//!
//! The modem exposes its registers as arrays of 32-bit words. Offsets below are byte offsets
//! (`word index * 4`).

const fn word(index: u64) -> u64 {
    index * 4
}

// BAR0: doorbell / mode / wakeup.
pub const BAR0_DOORBELL: u64 = word(0x04);
pub const BAR0_MODE: u64 = word(0x0c);
pub const BAR0_WAKEUP: u64 = word(0x14);

// BAR2: status / control / blanking.
pub const BAR2_STATUS: u64 = word(0x00);
pub const BAR2_MODE: u64 = word(0x18);
pub const BAR2_CONTROL: u64 = word(0x19);
pub const BAR2_CONTROLH: u64 = word(0x1a);
pub const BAR2_BLANK0: u64 = word(0x1b);
pub const BAR2_BLANK1: u64 = word(0x1c);
pub const BAR2_BLANK2: u64 = word(0x1d);
pub const BAR2_BLANK3: u64 = word(0x1e);

pub const BAR2_BLANKS: [u64; 4] = [BAR2_BLANK0, BAR2_BLANK1, BAR2_BLANK2, BAR2_BLANK3];

/// Status register value once the modem core has booted.
pub const STATUS_READY: u32 = 0x600d_f00d;
/// Status register value while the modem sits in its crash dump state.
pub const STATUS_CRASHED: u32 = 0xbadc_0ded;

pub const MODE_OFF: u32 = 0;
/// Hand the control page to the modem.
pub const MODE_INIT: u32 = 1;
/// Enable interrupts.
pub const MODE_RUNNING: u32 = 2;

/// Doorbell values naming which ring class changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Doorbell {
    Transfer = 0,
    Command = 1,
}

/// 32-bit MMIO access to one BAR.
///
/// Implementations must perform each access exactly once and in program order; the modem
/// treats doorbell and mode writes as side-effecting.
pub trait RegisterBank: Send + Sync {
    fn read32(&self, offset: u64) -> u32;
    fn write32(&self, offset: u64, value: u32);
}
