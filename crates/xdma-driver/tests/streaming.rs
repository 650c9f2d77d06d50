//! Streaming C2H rings and user event lines

use std::sync::Arc;
use std::time::{Duration, Instant};
use xdma_driver::{
    ConsumeStatus, Direction, DriverConfig, FileHandle, SimConfig, SimPlatform, XdmaDevice,
    XdmaError,
};

const STREAM_CH: usize = 1;

fn attach(config: DriverConfig) -> (Arc<SimPlatform>, Arc<XdmaDevice>) {
    let sim = SimPlatform::new(SimConfig::default()).expect("model");
    let dev = XdmaDevice::attach(sim.clone(), config).expect("attach");
    (sim, dev)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Consume until `len` bytes arrived or `limit` passes.
fn drain(node: &FileHandle, len: usize, limit: Duration) -> Vec<u8> {
    let start = Instant::now();
    let mut out = Vec::with_capacity(len);
    let mut buf = vec![0u8; 3000];
    while out.len() < len && start.elapsed() < limit {
        let n = node.consume(&mut buf).unwrap().copied();
        out.extend_from_slice(&buf[..n]);
    }
    out
}

fn wait_for(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

// ── Rings ────────────────────────────────────────────────────────────────────

#[test]
fn ring_captures_pushed_stream() {
    let (sim, dev) = attach(DriverConfig::default());
    let c2h = dev.open("c2h_1").unwrap();
    let data = pattern(50_000);
    sim.push_stream(STREAM_CH, &data);

    let got = drain(&c2h, data.len(), Duration::from_secs(10));
    assert!(got == data, "captured {} of {} bytes", got.len(), data.len());
}

#[test]
fn ring_in_poll_mode() {
    let config = DriverConfig {
        poll_mode: true,
        ..DriverConfig::default()
    };
    let (sim, dev) = attach(config);
    let c2h = dev.open("c2h_1").unwrap();
    let data = pattern(9000);
    sim.push_stream(STREAM_CH, &data);

    assert!(drain(&c2h, data.len(), Duration::from_secs(10)) == data);
    assert_eq!(sim.interrupts_delivered(), 0);
}

#[test]
fn stream_h2c_loops_into_stream_c2h() {
    let (_sim, dev) = attach(DriverConfig::default());
    let c2h = dev.open("c2h_1").unwrap();
    let h2c = dev.open("h2c_1").unwrap();

    let data = pattern(3 * 4096 + 17);
    assert_eq!(h2c.write(0, &data).unwrap(), data.len());
    assert!(drain(&c2h, data.len(), Duration::from_secs(10)) == data);
}

#[test]
fn producer_never_laps_consumer() {
    let config = DriverConfig {
        ring_blocks: 2,
        ..DriverConfig::default()
    };
    let (sim, dev) = attach(config);
    let c2h = dev.open("c2h_1").unwrap();
    let ring = dev.engine(Direction::C2H, STREAM_CH).unwrap().ring().unwrap();
    assert_eq!(ring.capacity(), 2 * 4096);

    let data = pattern(5 * 4096);
    sim.push_stream(STREAM_CH, &data);

    // two credits, so two blocks leave the FIFO and the rest waits
    assert!(wait_for(Duration::from_secs(5), || ring.buffered() == 2 * 4096));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(sim.stream_backlog(STREAM_CH), 3 * 4096);
    assert_eq!(ring.buffered(), 2 * 4096);

    assert!(drain(&c2h, data.len(), Duration::from_secs(10)) == data);
    assert_eq!(sim.stream_backlog(STREAM_CH), 0);
}

#[test]
fn idle_ring_times_out_with_nothing_copied() {
    let config = DriverConfig {
        wait_timeout: Duration::from_millis(50),
        ..DriverConfig::default()
    };
    let (_sim, dev) = attach(config);
    let c2h = dev.open("c2h_1").unwrap();

    let start = Instant::now();
    let mut buf = [0u8; 64];
    assert_eq!(c2h.consume(&mut buf).unwrap(), ConsumeStatus::TimedOut { copied: 0 });
    assert_eq!(c2h.read(0, &mut buf).unwrap(), 0);
    assert!(start.elapsed() < Duration::from_secs(2));

    assert!(matches!(c2h.consume(&mut []), Err(XdmaError::InvalidRequest { .. })));
}

#[test]
fn ring_blocks_must_fit_one_descriptor() {
    let config = DriverConfig {
        ring_block_size: 1 << 28,
        ..DriverConfig::default()
    };
    let (_sim, dev) = attach(config);
    assert!(matches!(dev.open("c2h_1"), Err(XdmaError::Configuration { .. })));
    assert!(dev.engine(Direction::C2H, STREAM_CH).unwrap().ring().is_none());
}

#[test]
fn ring_rejects_block_reads() {
    let (_sim, dev) = attach(DriverConfig::default());
    let c2h = dev.open("c2h_1").unwrap();
    assert!(matches!(c2h.submit_read(0, 16), Err(XdmaError::InvalidRequest { .. })));

    let block = dev.open("c2h_0").unwrap();
    let mut buf = [0u8; 4];
    assert!(matches!(block.consume(&mut buf), Err(XdmaError::InvalidRequest { .. })));
}

#[test]
fn ring_lives_while_any_handle_is_open() {
    let (sim, dev) = attach(DriverConfig::default());
    let engine = dev.engine(Direction::C2H, STREAM_CH).unwrap();
    assert!(engine.ring().is_none());

    let first = dev.open("c2h_1").unwrap();
    let second = dev.open("c2h_1").unwrap();
    drop(first);
    assert!(engine.ring().is_some());

    sim.push_stream(STREAM_CH, b"still here");
    assert_eq!(drain(&second, 10, Duration::from_secs(5)), b"still here");

    drop(second);
    assert!(engine.ring().is_none());
}

#[test]
fn release_wakes_blocked_consumer() {
    let config = DriverConfig {
        wait_timeout: Duration::from_secs(30),
        ..DriverConfig::default()
    };
    let (_sim, dev) = attach(config);
    let c2h = dev.open("c2h_1").unwrap();

    let consumer = std::thread::spawn(move || {
        let mut buf = [0u8; 16];
        c2h.consume(&mut buf)
    });
    std::thread::sleep(Duration::from_millis(50));
    let start = Instant::now();
    dev.release();

    assert!(matches!(consumer.join().unwrap(), Err(XdmaError::DeviceGone)));
    assert!(start.elapsed() < Duration::from_secs(10));
}

// ── Event lines ──────────────────────────────────────────────────────────────

#[test]
fn user_interrupt_releases_event_reader() {
    let (sim, dev) = attach(DriverConfig::default());
    let ev = dev.open("events_2").unwrap();
    let reader = std::thread::spawn(move || {
        let mut flag = [0u8; 1];
        ev.read(0, &mut flag).map(|n| (n, flag[0]))
    });

    // a pulse with no waiter is lost, so keep pulsing until the reader returns
    while !reader.is_finished() {
        sim.trigger_user_irq(2);
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(reader.join().unwrap().unwrap(), (1, 1));
}

#[test]
fn other_lines_do_not_release_the_reader() {
    let config = DriverConfig {
        wait_timeout: Duration::from_millis(100),
        ..DriverConfig::default()
    };
    let (sim, dev) = attach(config);
    let ev = dev.open("events_0").unwrap();
    let reader = std::thread::spawn(move || {
        let mut flag = [0xFFu8; 1];
        ev.read(0, &mut flag).map(|_| flag[0])
    });
    for _ in 0..20 {
        sim.trigger_user_irq(5);
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(reader.join().unwrap().unwrap(), 0);
}

#[test]
fn event_read_needs_one_byte() {
    let (_sim, dev) = attach(DriverConfig::default());
    let ev = dev.open("events_3").unwrap();
    let mut four = [0u8; 4];
    assert!(matches!(ev.read(0, &mut four), Err(XdmaError::InvalidRequest { .. })));
}

#[test]
fn release_fails_event_waiters() {
    let config = DriverConfig {
        wait_timeout: Duration::from_secs(30),
        ..DriverConfig::default()
    };
    let (_sim, dev) = attach(config);
    let ev = dev.open("events_7").unwrap();
    let reader = std::thread::spawn(move || {
        let mut flag = [0u8; 1];
        ev.read(0, &mut flag)
    });
    std::thread::sleep(Duration::from_millis(50));
    dev.release();
    assert!(matches!(reader.join().unwrap(), Err(XdmaError::DeviceGone)));
}
