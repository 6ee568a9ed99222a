//! Services the host operating system provides to the protocol engine: mapped BARs, coherent
//! DMA memory and MSI/MSI-X vector delivery.

use std::sync::Arc;

use thiserror::Error;

use crate::dma::DmaAllocator;
use crate::regs::RegisterBank;

pub const PCI_VENDOR_ID: u16 = 0x8086;
pub const PCI_DEVICE_ID: u16 = 0x7360;

/// Number of interrupt vectors the modem is driven with.
pub const IRQ_VECTOR_COUNT: usize = 4;

pub fn matches_pci_id(vendor: u16, device: u16) -> bool {
    vendor == PCI_VENDOR_ID && device == PCI_DEVICE_ID
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IrqError {
    #[error("could not allocate {requested} interrupt vectors")]
    VectorsUnavailable { requested: usize },

    #[error("interrupt vector {vector} could not be requested")]
    RequestFailed { vector: usize },
}

/// Receives interrupt notifications. Runs in interrupt context: must not block.
pub trait IrqHandler: Send + Sync {
    fn handle_irq(&self, vector: usize);
}

/// Keeps interrupt vectors registered; dropping it frees them.
pub trait IrqRegistration: Send + Sync {}

pub trait Platform: Send + Sync {
    /// Doorbell / mode / wakeup registers.
    fn bar0(&self) -> Arc<dyn RegisterBank>;
    /// Status / control / blanking registers.
    fn bar2(&self) -> Arc<dyn RegisterBank>;
    fn dma(&self) -> Arc<dyn DmaAllocator>;
    /// Allocates `count` vectors and routes each to `handler` with its index.
    fn request_irqs(
        &self,
        count: usize,
        handler: Arc<dyn IrqHandler>,
    ) -> Result<Box<dyn IrqRegistration>, IrqError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_only_the_xmm7360() {
        assert!(matches_pci_id(0x8086, 0x7360));
        assert!(!matches_pci_id(0x8086, 0x7560));
        assert!(!matches_pci_id(0x1af4, 0x7360));
    }
}
