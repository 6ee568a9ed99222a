mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{qp, ready_device, wait_until};
use xmm7360_pcie::error::EINTR;
use xmm7360_pcie::{CancelToken, ModemError, RingId};

fn ring(n: u8) -> RingId {
    RingId::new(n).unwrap()
}

#[test]
fn read_blocks_until_the_modem_delivers() {
    let (platform, device) = ready_device();
    let device = Arc::new(device);
    device.open(qp(0)).unwrap();

    let reader = {
        let device = device.clone();
        thread::spawn(move || device.read(qp(0), 64, &CancelToken::new()))
    };

    thread::sleep(Duration::from_millis(20));
    assert!(!reader.is_finished());
    // Spurious interrupt: nothing completed, the reader keeps waiting.
    platform.modem().raise_irq(0);
    thread::sleep(Duration::from_millis(10));
    assert!(!reader.is_finished());

    assert!(platform.modem().deliver_inbound(ring(1), b"RING\r\n"));
    assert_eq!(reader.join().unwrap(), Ok(b"RING\r\n".to_vec()));
}

#[test]
fn cancelled_read_returns_interrupted_without_side_effects() {
    let (platform, device) = ready_device();
    let modem = platform.modem();
    let device = Arc::new(device);
    let token = CancelToken::new();
    device.open(qp(2)).unwrap();

    let reader = {
        let device = device.clone();
        let token = token.clone();
        thread::spawn(move || device.read(qp(2), 64, &token))
    };

    thread::sleep(Duration::from_millis(20));
    token.cancel();
    let err = reader.join().unwrap().unwrap_err();
    assert_eq!(err, ModemError::Interrupted);
    assert_eq!(err.errno(), EINTR);

    assert_eq!(device.pair(qp(2)).last_handled(), 0);
    assert_eq!(modem.armed_inbound(ring(5)), 7);
    assert!(device.pair(qp(2)).is_open());

    token.reset();
    assert!(modem.deliver_inbound(ring(5), b"after"));
    assert_eq!(device.read(qp(2), 64, &token), Ok(b"after".to_vec()));
}

#[test]
fn close_wakes_pending_reader_before_freeing_buffers() {
    let (platform, device) = ready_device();
    let modem = platform.modem();
    let device = Arc::new(device);
    device.open(qp(3)).unwrap();

    let reader = {
        let device = device.clone();
        thread::spawn(move || device.read(qp(3), 64, &CancelToken::new()))
    };

    thread::sleep(Duration::from_millis(20));
    device.close(qp(3)).unwrap();

    assert_eq!(reader.join().unwrap(), Err(ModemError::NotFound));
    assert_eq!(modem.stale_accesses(), 0);
    assert_eq!(platform.sim_dma().live_allocations(), 1);
    assert!(!device.is_faulted());
}

#[test]
fn close_racing_delivery_never_touches_freed_memory() {
    let (platform, device) = ready_device();
    let modem = platform.modem().clone();
    let device = Arc::new(device);

    for _ in 0..20 {
        device.open(qp(1)).unwrap();
        let reader = {
            let device = device.clone();
            thread::spawn(move || device.read(qp(1), 64, &CancelToken::new()))
        };
        let peer = {
            let modem = modem.clone();
            thread::spawn(move || modem.deliver_inbound(ring(3), b"+CSQ: 20,99\r\n"))
        };

        device.close(qp(1)).unwrap();
        let delivered = peer.join().unwrap();
        match reader.join().unwrap() {
            Ok(frame) => {
                assert!(delivered);
                assert_eq!(frame, b"+CSQ: 20,99\r\n");
            }
            Err(err) => assert_eq!(err, ModemError::NotFound),
        }
    }

    assert_eq!(platform.sim_dma().live_allocations(), 1);
    assert!(!device.is_faulted());
}

#[test]
fn command_wait_is_cancellable() {
    let (platform, device) = ready_device();
    let modem = platform.modem();
    let device = Arc::new(device);
    let token = CancelToken::new();

    // The modem stops consuming, so the ring-open commands stay pending.
    modem.set_process_commands(false);
    device.open(qp(0)).unwrap();

    let waiter = {
        let device = device.clone();
        let token = token.clone();
        thread::spawn(move || device.wait_commands(&token))
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!waiter.is_finished());
    token.cancel();
    assert_eq!(waiter.join().unwrap(), Err(ModemError::Interrupted));

    modem.set_process_commands(true);
    device.open(qp(1)).unwrap();
    device.wait_commands(&CancelToken::new()).unwrap();
}

#[test]
fn writer_and_modem_stream_with_backpressure() {
    let (platform, device) = ready_device();
    let modem = platform.modem().clone();
    let device = Arc::new(device);
    device.open(qp(5)).unwrap();

    const FRAMES: u32 = 200;
    let writer = {
        let device = device.clone();
        thread::spawn(move || {
            for i in 0..FRAMES {
                loop {
                    match device.write(qp(5), &i.to_le_bytes()) {
                        Ok(4) => break,
                        Err(ModemError::RingFull { .. }) => thread::yield_now(),
                        other => panic!("unexpected write result {other:?}"),
                    }
                }
            }
        })
    };

    let mut received = Vec::new();
    wait_until("all frames", || {
        received.extend(modem.drain_outbound(ring(10)));
        received.len() == FRAMES as usize
    });
    writer.join().unwrap();

    for (i, frame) in received.iter().enumerate() {
        assert_eq!(frame.as_slice(), &(i as u32).to_le_bytes());
    }
}

#[test]
fn independent_pairs_run_in_parallel() {
    let (platform, device) = ready_device();
    let modem = platform.modem().clone();
    let device = Arc::new(device);

    let workers: Vec<_> = (0..8u8)
        .map(|n| {
            let device = device.clone();
            let modem = modem.clone();
            thread::spawn(move || {
                device.open(qp(n)).unwrap();
                let rx = qp(n).rx_ring();
                for i in 0..10u8 {
                    assert!(modem.deliver_inbound(rx, &[n, i]));
                    assert_eq!(device.read(qp(n), 2, &CancelToken::new()), Ok(vec![n, i]));
                }
                device.close(qp(n)).unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(platform.sim_dma().live_allocations(), 1);
    assert_eq!(modem.stale_accesses(), 0);
}

#[test]
fn queued_second_reader_is_cancellable() {
    let (platform, device) = ready_device();
    let device = Arc::new(device);
    device.open(qp(1)).unwrap();

    let first = {
        let device = device.clone();
        thread::spawn(move || device.read(qp(1), 64, &CancelToken::new()))
    };
    thread::sleep(Duration::from_millis(20));

    let token = CancelToken::new();
    let second = {
        let device = device.clone();
        let token = token.clone();
        thread::spawn(move || device.read(qp(1), 64, &token))
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!second.is_finished());

    token.cancel();
    wait_until("second reader to return", || second.is_finished());
    assert_eq!(second.join().unwrap(), Err(ModemError::Interrupted));
    assert!(device.pair(qp(1)).is_open());

    // The first reader still owns the pair and gets the next frame.
    assert!(platform.modem().deliver_inbound(ring(3), b"OK\r\n"));
    assert_eq!(first.join().unwrap(), Ok(b"OK\r\n".to_vec()));
}

#[test]
fn readers_on_one_pair_take_turns() {
    let (platform, device) = ready_device();
    let device = Arc::new(device);
    device.open(qp(6)).unwrap();

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let device = device.clone();
            thread::spawn(move || device.read(qp(6), 8, &CancelToken::new()))
        })
        .collect();
    thread::sleep(Duration::from_millis(20));

    for i in 0..3u8 {
        assert!(platform.modem().deliver_inbound(ring(13), &[i]));
    }
    let mut frames: Vec<Vec<u8>> = readers
        .into_iter()
        .map(|r| r.join().unwrap().unwrap())
        .collect();
    frames.sort();
    assert_eq!(frames, vec![vec![0], vec![1], vec![2]]);
    assert_eq!(device.pair(qp(6)).last_handled(), 3);
}
