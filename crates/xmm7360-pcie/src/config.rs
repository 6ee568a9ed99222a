//! Tunables for device bring-up and the transfer rings.
//!
//! The defaults reproduce the modem's protocol constants; tests shrink the poll intervals so
//! bring-up failures resolve in milliseconds.

use std::time::Duration;

use crate::error::{ModemError, Result};

/// Extra word carried by every `RING_OPEN` command.
pub const DEFAULT_RING_OPEN_EXTRA: u32 = 0x60;

/// Size of each transfer buffer page.
pub const DEFAULT_PAGE_SIZE: usize = 0x1000;

/// Slots per transfer ring.
pub const DEFAULT_RING_CAPACITY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModemConfig {
    /// Attempts to observe the ready magic in the status register.
    pub boot_poll_attempts: u32,
    /// Delay between boot status polls. The modem core typically needs ~5 seconds.
    pub boot_poll_interval: Duration,
    /// Attempts to observe each mode-status transition.
    pub mode_poll_attempts: u32,
    pub mode_poll_interval: Duration,
    /// Upper bound on waiting for the bring-up handshake commands to complete.
    pub command_timeout: Duration,
    /// Slot count of each transfer ring (power of two).
    pub ring_capacity: usize,
    /// Bytes per transfer buffer page.
    pub page_size: usize,
    pub ring_open_extra: u32,
    /// Wait for the device to consume `RING_CLOSE` before freeing ring buffers.
    ///
    /// Off by default: the modem protocol frees buffers right after submitting the close.
    pub close_waits_for_ack: bool,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            boot_poll_attempts: 100,
            boot_poll_interval: Duration::from_millis(200),
            mode_poll_attempts: 100,
            mode_poll_interval: Duration::from_millis(10),
            command_timeout: Duration::from_secs(1),
            ring_capacity: DEFAULT_RING_CAPACITY,
            page_size: DEFAULT_PAGE_SIZE,
            ring_open_extra: DEFAULT_RING_OPEN_EXTRA,
            close_waits_for_ack: false,
        }
    }
}

impl ModemConfig {
    /// Configuration with near-zero poll intervals, for driving a simulated modem.
    pub fn fast() -> Self {
        Self {
            boot_poll_interval: Duration::from_micros(50),
            mode_poll_interval: Duration::from_micros(50),
            command_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.boot_poll_attempts == 0 || self.mode_poll_attempts == 0 {
            return Err(ModemError::InvalidConfig("poll attempts must be non-zero"));
        }
        if self.ring_capacity < 2 || !self.ring_capacity.is_power_of_two() {
            return Err(ModemError::InvalidConfig(
                "ring capacity must be a power of two of at least 2",
            ));
        }
        // Slot indices travel in a u8 and the capacity in the command's u16 length.
        if self.ring_capacity > 128 {
            return Err(ModemError::InvalidConfig("ring capacity must be at most 128"));
        }
        if self.page_size == 0 || self.page_size > u16::MAX as usize {
            return Err(ModemError::InvalidConfig(
                "page size must fit the 16-bit descriptor length",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ModemConfig::default().validate().unwrap();
        ModemConfig::fast().validate().unwrap();
    }

    #[test]
    fn rejects_bad_ring_capacity() {
        for capacity in [0, 1, 6, 256] {
            let cfg = ModemConfig {
                ring_capacity: capacity,
                ..ModemConfig::default()
            };
            assert!(
                matches!(cfg.validate(), Err(ModemError::InvalidConfig(_))),
                "capacity {capacity} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_oversized_page() {
        let cfg = ModemConfig {
            page_size: 0x1_0000,
            ..ModemConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
