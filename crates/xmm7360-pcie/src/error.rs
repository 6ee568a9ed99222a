use thiserror::Error;

use crate::dma::DmaError;
use crate::platform::IrqError;
use crate::td_ring::RingId;

pub type Result<T> = std::result::Result<T, ModemError>;

// POSIX error numbers handed back to the character-device layer.
pub const EINTR: i32 = 4;
pub const EIO: i32 = 5;
pub const EAGAIN: i32 = 11;
pub const ENOMEM: i32 = 12;
pub const EBUSY: i32 = 16;
pub const ENODEV: i32 = 19;
pub const EINVAL: i32 = 22;
pub const ETIMEDOUT: i32 = 110;

/// Which producer ring refused a new entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingKind {
    Command,
    Transfer(RingId),
}

impl core::fmt::Display for RingKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RingKind::Command => f.write_str("command ring"),
            RingKind::Transfer(id) => write!(f, "transfer ring {id}"),
        }
    }
}

/// Unrecoverable protocol faults.
///
/// A fault means the shared rings are corrupt or the driver logic is wrong; it is never a
/// transient condition. Hitting one poisons the owning [`crate::Device`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("modem reported crash dump state (status 0x{status:08x})")]
    Crashed { status: u32 },

    #[error("{ring} already exists")]
    RingExists { ring: RingId },

    #[error("{ring} is not live")]
    RingMissing { ring: RingId },

    #[error("{ring} used against its transfer direction")]
    WrongDirection { ring: RingId },

    #[error("advancing the write pointer of {ring} would overrun its read pointer")]
    Overrun { ring: RingKind },

    #[error("ring capacity {size} is not a power of two")]
    NotPowerOfTwo { size: usize },
}

/// Unified error type for modem operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModemError {
    #[error("timed out waiting for {what}")]
    Timeout { what: &'static str },

    #[error("{ring} is full")]
    RingFull { ring: RingKind },

    #[error("queue pair is already open")]
    Busy,

    #[error("queue pair is not open")]
    NotFound,

    #[error("wait interrupted")]
    Interrupted,

    #[error("payload of {len} bytes exceeds the {page_size}-byte transfer page")]
    PayloadTooLarge { len: usize, page_size: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("protocol fault: {0}")]
    Fault(#[from] Fault),

    #[error("device is unusable after an earlier protocol fault")]
    Faulted,

    #[error(transparent)]
    Dma(#[from] DmaError),

    #[error(transparent)]
    Irq(#[from] IrqError),
}

impl ModemError {
    /// Maps the error onto the errno convention used by the character-device layer.
    pub fn errno(&self) -> i32 {
        match self {
            ModemError::Timeout { .. } => ETIMEDOUT,
            ModemError::RingFull { .. } => EAGAIN,
            ModemError::Busy => EBUSY,
            ModemError::NotFound => ENODEV,
            ModemError::Interrupted => EINTR,
            ModemError::PayloadTooLarge { .. } | ModemError::InvalidConfig(_) => EINVAL,
            ModemError::Fault(Fault::Crashed { .. }) => EINVAL,
            ModemError::Fault(_) | ModemError::Faulted => EIO,
            ModemError::Dma(_) => ENOMEM,
            ModemError::Irq(_) => EIO,
        }
    }

    /// True for errors that leave the device instance unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ModemError::Fault(_) | ModemError::Faulted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_char_device_convention() {
        assert_eq!(ModemError::Busy.errno(), EBUSY);
        assert_eq!(ModemError::NotFound.errno(), ENODEV);
        assert_eq!(
            ModemError::RingFull {
                ring: RingKind::Command
            }
            .errno(),
            EAGAIN
        );
        assert_eq!(ModemError::Interrupted.errno(), EINTR);
        assert_eq!(ModemError::Timeout { what: "boot" }.errno(), ETIMEDOUT);
        assert_eq!(ModemError::Faulted.errno(), EIO);
    }

    #[test]
    fn only_faults_are_fatal() {
        assert!(ModemError::Fault(Fault::NotPowerOfTwo { size: 3 }).is_fatal());
        assert!(ModemError::Faulted.is_fatal());
        assert!(!ModemError::Busy.is_fatal());
        assert!(!ModemError::PayloadTooLarge {
            len: 5000,
            page_size: 4096
        }
        .is_fatal());
    }

    #[test]
    fn display_names_the_ring() {
        let err = ModemError::RingFull {
            ring: RingKind::Transfer(RingId::new(6).unwrap()),
        };
        assert_eq!(err.to_string(), "transfer ring 6 is full");
    }
}
