//! Block-transfer DMA through the hardware model
//!
//! Covers host-to-card and card-to-host transfers in interrupt and poll
//! completion, the one-in-flight rule, queue ordering and cancellation.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use xdma_driver::{
    Direction, DmaRequest, DriverConfig, SimConfig, SimPlatform, XdmaDevice, XdmaError,
};

fn attach(cfg: SimConfig, config: DriverConfig) -> (Arc<SimPlatform>, Arc<XdmaDevice>) {
    let sim = SimPlatform::new(cfg).expect("model");
    let dev = XdmaDevice::attach(sim.clone(), config).expect("attach");
    (sim, dev)
}

fn poll_config() -> DriverConfig {
    DriverConfig {
        poll_mode: true,
        ..DriverConfig::default()
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

fn loopback(dev: &Arc<XdmaDevice>, sizes: &[usize]) {
    let h2c = dev.open("h2c_0").unwrap();
    let c2h = dev.open("c2h_0").unwrap();
    for (i, &len) in sizes.iter().enumerate() {
        let data = pattern(len, i as u8);
        let addr = 0x1000 * i as u64;
        assert_eq!(h2c.write(addr, &data).unwrap(), len, "write {len}");

        let mut back = vec![0u8; len];
        assert_eq!(c2h.read(addr, &mut back).unwrap(), len, "read {len}");
        assert!(back == data, "loopback mismatch at {len} bytes");
    }
}

const SIZES: [usize; 5] = [1, 100, 4096, 4097, (3 << 20) + 123];

#[test]
fn loopback_interrupt_mode() {
    let (sim, dev) = attach(SimConfig::default(), DriverConfig::default());
    assert!(!dev.engine(Direction::H2C, 0).unwrap().poll_mode());
    loopback(&dev, &SIZES);
    assert!(sim.interrupts_delivered() > 0);
}

#[test]
fn loopback_poll_mode() {
    let (sim, dev) = attach(SimConfig::default(), poll_config());
    assert!(dev.engine(Direction::C2H, 0).unwrap().poll_mode());
    loopback(&dev, &SIZES);
    assert_eq!(sim.interrupts_delivered(), 0);
}

#[test]
fn loopback_with_descriptor_latency() {
    let cfg = SimConfig::default().with_latency(Duration::from_micros(200));
    let (_sim, dev) = attach(cfg, DriverConfig::default());
    loopback(&dev, &[12_345, 64 * 1024]);
}

#[test]
fn read_reaches_card_memory_written_behind_the_driver() {
    let (sim, dev) = attach(SimConfig::default(), DriverConfig::default());
    let data = pattern(10_000, 7);
    sim.card_write(0x20_0000, &data);

    let c2h = dev.open("c2h_0").unwrap();
    let mut back = vec![0u8; data.len()];
    c2h.read(0x20_0000, &mut back).unwrap();
    assert!(back == data);
}

#[test]
fn bad_lengths_are_refused() {
    let (_sim, dev) = attach(SimConfig::default(), DriverConfig::default());
    let h2c = dev.open("h2c_0").unwrap();
    let c2h = dev.open("c2h_0").unwrap();

    assert!(matches!(h2c.write(0, &[]), Err(XdmaError::InvalidRequest { .. })));
    assert!(matches!(c2h.read(0, &mut []), Err(XdmaError::InvalidRequest { .. })));

    let too_big = vec![0u8; dev.config().max_transfer_size + 1];
    assert!(matches!(h2c.write(0, &too_big), Err(XdmaError::InvalidRequest { .. })));
}

#[test]
fn card_overrun_fails_the_transfer() {
    let (_sim, dev) = attach(SimConfig::default(), DriverConfig::default());
    let h2c = dev.open("h2c_0").unwrap();
    let end = (16u64 << 20) - 100;
    assert!(matches!(
        h2c.write(end, &[0u8; 4096]),
        Err(XdmaError::TransferFailed { .. })
    ));
    // the engine recovers
    h2c.write(0, &[1u8; 64]).unwrap();
}

// ── One transfer in flight ───────────────────────────────────────────────────

#[test]
fn engine_refuses_a_second_transfer() {
    let cfg = SimConfig::default().with_latency(Duration::from_millis(5));
    let (_sim, dev) = attach(cfg, DriverConfig::default());
    let engine = dev.engine(Direction::H2C, 0).unwrap();

    let first = engine
        .issue(0, DmaRequest::Write(Bytes::from(vec![1u8; 32 * 1024])))
        .unwrap();
    assert!(matches!(
        engine.issue(0x10_0000, DmaRequest::Write(Bytes::from_static(b"second"))),
        Err(XdmaError::InvalidRequest { .. })
    ));
    assert_eq!(first.wait().unwrap().bytes, 32 * 1024);
    assert!(!engine.is_busy());

    assert!(matches!(
        engine.issue(0, DmaRequest::Read(16)),
        Err(XdmaError::InvalidRequest { .. })
    ));
    engine
        .issue(0x10_0000, DmaRequest::Write(Bytes::from_static(b"third")))
        .unwrap()
        .wait()
        .unwrap();
}

#[test]
fn queued_writes_complete_in_order() {
    let cfg = SimConfig::default().with_latency(Duration::from_micros(500));
    let (sim, dev) = attach(cfg, DriverConfig::default());
    let h2c = dev.open("h2c_0").unwrap();

    let pending: Vec<_> = (1..=5u8)
        .map(|n| h2c.submit_write(0x8000, Bytes::from(vec![n; 8192])).unwrap())
        .collect();
    for p in pending {
        assert_eq!(p.wait().unwrap().bytes, 8192);
    }

    let mut card = [0u8; 8192];
    sim.card_read(0x8000, &mut card);
    assert!(card.iter().all(|&b| b == 5));
}

#[test]
fn concurrent_submitters_share_one_engine() {
    let (_sim, dev) = attach(SimConfig::default(), DriverConfig::default());
    let workers: Vec<_> = (0..4u64)
        .map(|t| {
            let dev = Arc::clone(&dev);
            std::thread::spawn(move || {
                let h2c = dev.open("h2c_0").unwrap();
                let c2h = dev.open("c2h_0").unwrap();
                for round in 0..8u64 {
                    let addr = 0x10_0000 * t + 0x1000 * round;
                    let data = pattern(3000, (t * 8 + round) as u8);
                    h2c.write(addr, &data).unwrap();
                    let mut back = vec![0u8; data.len()];
                    c2h.read(addr, &mut back).unwrap();
                    assert!(back == data);
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
}

// ── Cancellation ─────────────────────────────────────────────────────────────

/// Small deterministic generator for spin counts.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        self.0 >> 33
    }
}

#[test]
fn cancel_races_completion_exactly_once() {
    let cfg = SimConfig::default().with_latency(Duration::from_micros(50));
    let (_sim, dev) = attach(cfg, DriverConfig::default());
    let engine = dev.engine(Direction::H2C, 0).unwrap();
    let mut rng = Lcg(0x5eed);

    let (mut finished, mut cancelled) = (0, 0);
    for _ in 0..40 {
        let handle = engine
            .issue(0, DmaRequest::Write(Bytes::from(vec![0x77; 16 * 4096])))
            .unwrap();
        let canceller = {
            let handle = handle.clone();
            let spins = rng.next() % 2000;
            std::thread::spawn(move || {
                for _ in 0..spins {
                    std::hint::spin_loop();
                }
                handle.cancel()
            })
        };
        let outcome = handle.wait();
        let won = canceller.join().unwrap();
        match outcome {
            Ok(done) => {
                assert!(!won);
                assert_eq!(done.bytes, 16 * 4096);
                finished += 1;
            }
            Err(XdmaError::Cancelled) => {
                assert!(won);
                cancelled += 1;
            }
            Err(e) => panic!("unexpected outcome: {e}"),
        }
        assert!(handle.is_finished());
        assert!(!handle.cancel());
    }
    println!("{finished} finished, {cancelled} cancelled");

    // engine still usable
    let c2h = dev.open("c2h_0").unwrap();
    let h2c = dev.open("h2c_0").unwrap();
    h2c.write(0x100, b"after").unwrap();
    let mut back = [0u8; 5];
    c2h.read(0x100, &mut back).unwrap();
    assert_eq!(&back, b"after");
}

#[test]
fn cancel_in_poll_mode() {
    let cfg = SimConfig::default().with_latency(Duration::from_millis(2));
    let (_sim, dev) = attach(cfg, poll_config());
    let h2c = dev.open("h2c_0").unwrap();

    let pending = h2c
        .submit_write(0, Bytes::from(vec![1u8; 32 * 4096]))
        .unwrap();
    std::thread::sleep(Duration::from_millis(5));
    pending.cancel();
    assert!(matches!(pending.wait(), Err(XdmaError::Cancelled)));
    h2c.write(0, &[2u8; 100]).unwrap();
}

#[test]
fn queued_request_cancels_before_issue() {
    let cfg = SimConfig::default().with_latency(Duration::from_millis(2));
    let (sim, dev) = attach(cfg, DriverConfig::default());
    let h2c = dev.open("h2c_0").unwrap();

    let first = h2c.submit_write(0, Bytes::from(vec![1u8; 8 * 4096])).unwrap();
    let second = h2c.submit_write(0, Bytes::from(vec![2u8; 4096])).unwrap();
    second.cancel();

    assert_eq!(first.wait().unwrap().bytes, 8 * 4096);
    assert!(matches!(second.wait(), Err(XdmaError::Cancelled)));

    let mut card = [0u8; 4096];
    sim.card_read(0, &mut card);
    assert!(card.iter().all(|&b| b == 1));
}

#[test]
fn release_ends_in_flight_transfers() {
    let cfg = SimConfig::default().with_latency(Duration::from_millis(2));
    let (_sim, dev) = attach(cfg, DriverConfig::default());
    let h2c = dev.open("h2c_0").unwrap();

    let running = h2c.submit_write(0, Bytes::from(vec![3u8; 64 * 4096])).unwrap();
    let queued = h2c.submit_write(0, Bytes::from(vec![4u8; 4096])).unwrap();
    std::thread::sleep(Duration::from_millis(5));
    dev.release();

    assert!(matches!(
        running.wait(),
        Err(XdmaError::Cancelled | XdmaError::DeviceGone)
    ));
    assert!(matches!(
        queued.wait(),
        Err(XdmaError::DeviceGone | XdmaError::Cancelled)
    ));
}
