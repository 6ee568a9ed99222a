#![allow(dead_code)]

use std::time::{Duration, Instant};

use xmm7360_pcie::sim::SimPlatform;
use xmm7360_pcie::{Device, ModemConfig, QueuePairId};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn qp(n: u8) -> QueuePairId {
    QueuePairId::new(n).unwrap()
}

/// A booted modem with fast poll intervals.
pub fn ready_device() -> (SimPlatform, Device) {
    ready_device_with(ModemConfig::fast())
}

pub fn ready_device_with(config: ModemConfig) -> (SimPlatform, Device) {
    init_tracing();
    let platform = SimPlatform::ready();
    let device = Device::probe(&platform, config).unwrap();
    (platform, device)
}

/// Polls `cond` until it holds, panicking after a generous deadline.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}
