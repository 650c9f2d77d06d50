//! Attach, discovery and node routing against the hardware model

use std::sync::Arc;
use xdma_chip::ioctl::{ADDRMODE_GET, ADDRMODE_SET, PERF_GET, PERF_START};
use xdma_chip::regs::{IpVersion, CONFIG_BLOCK_OFFSET};
use xdma_driver::{
    Direction, DriverConfig, EngineKind, SimBar, SimChannel, SimConfig, SimPlatform,
    SysfsPlatform, XdmaDevice, XdmaError,
};

fn attach(cfg: SimConfig) -> (Arc<SimPlatform>, Arc<XdmaDevice>) {
    let sim = SimPlatform::new(cfg).expect("model");
    let dev = XdmaDevice::attach(sim.clone(), DriverConfig::default()).expect("attach");
    (sim, dev)
}

// ── Discovery ────────────────────────────────────────────────────────────────

#[test]
fn three_bars_config_in_the_middle() {
    let (_sim, dev) = attach(SimConfig::default());
    let layout = dev.layout().unwrap();
    assert_eq!((layout.count, layout.config), (3, 1));
    assert_eq!(layout.user, Some(0));
    assert_eq!(layout.bypass, Some(2));
    assert_eq!(dev.ip_version().unwrap(), IpVersion::TARGET);
}

#[test]
fn two_bars_config_first_has_bypass_only() {
    let (_sim, dev) =
        attach(SimConfig::default().with_bars(vec![SimBar::Config, SimBar::Ram(0x1000)]));
    let layout = dev.layout().unwrap();
    assert_eq!(layout.config, 0);
    assert_eq!(layout.user, None);
    assert_eq!(layout.bypass, Some(1));

    assert!(matches!(dev.open("user"), Err(XdmaError::InvalidParameter { .. })));
    assert!(dev.open("bypass").is_ok());
}

#[test]
fn lone_config_bar_has_neither() {
    let (_sim, dev) = attach(SimConfig::default().with_bars(vec![SimBar::Config]));
    let layout = dev.layout().unwrap();
    assert_eq!((layout.user, layout.bypass), (None, None));
    assert!(matches!(dev.open("user"), Err(XdmaError::InvalidParameter { .. })));
    assert!(matches!(dev.open("bypass"), Err(XdmaError::InvalidParameter { .. })));
}

#[test]
fn no_config_bar_fails_attach() {
    let sim = SimPlatform::new(
        SimConfig::default().with_bars(vec![SimBar::Ram(0x8000), SimBar::Ram(0x8000)]),
    )
    .unwrap();
    assert!(matches!(
        XdmaDevice::attach(sim, DriverConfig::default()),
        Err(XdmaError::Configuration { .. })
    ));
}

#[test]
fn version_mismatch_still_attaches() {
    let (_sim, dev) = attach(SimConfig::default().with_ip_version(4));
    assert_eq!(dev.ip_version().unwrap(), IpVersion::V2016_3);
}

#[test]
fn engines_follow_probed_hardware() {
    let cfg = SimConfig::default()
        .with_engine(Direction::H2C, 1, SimChannel::Absent)
        .with_engine(Direction::C2H, 3, SimChannel::MemoryMapped);
    let (_sim, dev) = attach(cfg);

    let ids: Vec<String> = dev.engines().unwrap().iter().map(|e| e.id().to_string()).collect();
    assert_eq!(ids, ["h2c_0", "c2h_0", "c2h_1", "c2h_3"]);
    assert_eq!(dev.engine(Direction::C2H, 1).unwrap().kind(), EngineKind::Streaming);
    assert!(matches!(
        dev.engine(Direction::H2C, 1),
        Err(XdmaError::InvalidParameter { .. })
    ));
}

// ── Open ─────────────────────────────────────────────────────────────────────

#[test]
fn unknown_and_disabled_nodes_are_rejected() {
    let (_sim, dev) = attach(SimConfig::default());
    for name in ["xdma0_h2c_0", "h2c_9", "events_16", "c2h", "h2c_00", "events_01"] {
        assert!(
            matches!(dev.open(name), Err(XdmaError::InvalidParameter { .. })),
            "{name}"
        );
    }
    assert!(matches!(dev.open("h2c_2"), Err(XdmaError::InvalidParameter { .. })));
    assert!(matches!(dev.open("c2h_3"), Err(XdmaError::InvalidParameter { .. })));
    assert!(dev.open("\\control").is_ok());
    assert!(dev.open("/events_0").is_ok());
    assert!(dev.open("event_5").is_ok());
}

#[test]
fn direction_mismatch_is_invalid_request() {
    let (_sim, dev) = attach(SimConfig::default());
    let mut buf = [0u8; 16];
    let h2c = dev.open("h2c_0").unwrap();
    let c2h = dev.open("c2h_0").unwrap();
    let ev = dev.open("events_1").unwrap();

    assert!(matches!(h2c.read(0, &mut buf), Err(XdmaError::InvalidRequest { .. })));
    assert!(matches!(c2h.write(0, &buf), Err(XdmaError::InvalidRequest { .. })));
    assert!(matches!(ev.write(0, &buf), Err(XdmaError::InvalidRequest { .. })));
}

// ── Register windows ─────────────────────────────────────────────────────────

#[test]
fn control_node_reads_config_identifiers() {
    let (_sim, dev) = attach(SimConfig::default());
    let ctl = dev.open("control").unwrap();
    let mut id = [0u8; 4];
    assert_eq!(ctl.read(CONFIG_BLOCK_OFFSET as u64, &mut id).unwrap(), 4);
    assert_eq!(u32::from_le_bytes(id) >> 20, 0x1FC);
}

#[test]
fn user_bar_round_trips_at_any_width() {
    let (_sim, dev) = attach(SimConfig::default());
    let user = dev.open("user").unwrap();
    let payloads: [&[u8]; 3] = [&[1, 2, 3, 4, 5, 6, 7, 8], &[9, 10], &[11, 12, 13]];
    for (i, data) in payloads.iter().enumerate() {
        let at = 0x100 * (i as u64 + 1) + i as u64;
        assert_eq!(user.write(at, data).unwrap(), data.len());
        let mut back = vec![0u8; data.len()];
        user.read(at, &mut back).unwrap();
        assert_eq!(&back, data);
    }
}

#[test]
fn register_ranges_are_validated() {
    let (_sim, dev) = attach(SimConfig::default());
    let user = dev.open("user").unwrap();
    let len = 0x1_0000u64;
    let mut four = [0u8; 4];

    assert!(matches!(user.read(0, &mut []), Err(XdmaError::InvalidRequest { .. })));
    // the end of the range must stay strictly inside the BAR
    assert!(matches!(user.read(len - 4, &mut four), Err(XdmaError::InvalidRequest { .. })));
    assert!(matches!(user.write(len, &four), Err(XdmaError::InvalidRequest { .. })));
    assert!(matches!(
        user.read(u64::MAX - 1, &mut four),
        Err(XdmaError::InvalidRequest { .. })
    ));
    assert!(user.read(len - 8, &mut four).is_ok());
}

// ── Control codes ────────────────────────────────────────────────────────────

#[test]
fn control_codes_need_a_dma_node() {
    let (_sim, dev) = attach(SimConfig::default());
    let mut out = [0u8; 32];
    let ctl = dev.open("control").unwrap();
    assert!(matches!(
        ctl.control(PERF_START, &[], &mut out),
        Err(XdmaError::InvalidParameter { .. })
    ));
    let ev = dev.open("events_0").unwrap();
    assert!(matches!(
        ev.control(PERF_GET, &[], &mut out),
        Err(XdmaError::InvalidParameter { .. })
    ));

    let h2c = dev.open("h2c_0").unwrap();
    assert!(matches!(
        h2c.control(0x0022_0014, &[], &mut out),
        Err(XdmaError::NotSupported { .. })
    ));
    assert!(matches!(
        h2c.control(PERF_GET, &[], &mut out[..8]),
        Err(XdmaError::InvalidRequest { .. })
    ));
}

#[test]
fn address_mode_round_trips() {
    let (_sim, dev) = attach(SimConfig::default());
    let c2h = dev.open("c2h_0").unwrap();
    let mut out = [0xFFu8; 4];

    c2h.control(ADDRMODE_GET, &[], &mut out).unwrap();
    assert_eq!(u32::from_le_bytes(out), 0);

    c2h.control(ADDRMODE_SET, &1u32.to_le_bytes(), &mut []).unwrap();
    c2h.control(ADDRMODE_GET, &[], &mut out).unwrap();
    assert_eq!(u32::from_le_bytes(out), 1);
    assert!(dev.engine(Direction::C2H, 0).unwrap().address_mode());

    assert!(matches!(
        c2h.control(ADDRMODE_SET, &[1], &mut []),
        Err(XdmaError::InvalidRequest { .. })
    ));
}

#[test]
fn fixed_address_transfers_hit_one_word() {
    let (sim, dev) = attach(SimConfig::default());
    let h2c = dev.open("h2c_0").unwrap();
    let c2h = dev.open("c2h_0").unwrap();
    h2c.control(ADDRMODE_SET, &1u32.to_le_bytes(), &mut []).unwrap();
    c2h.control(ADDRMODE_SET, &1u32.to_le_bytes(), &mut []).unwrap();

    // two pages, so two descriptors, both aimed at the same card word
    let mut data = vec![0xAAu8; 8192];
    data[8184..].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
    h2c.write(0x4000, &data).unwrap();

    let mut card = [0u8; 16];
    sim.card_read(0x4000, &mut card);
    assert_eq!(card, [1, 2, 3, 4, 5, 6, 7, 8, 0, 0, 0, 0, 0, 0, 0, 0]);

    let mut back = vec![0u8; 24];
    c2h.read(0x4000, &mut back).unwrap();
    for word in back.chunks(8) {
        assert_eq!(word, [1, 2, 3, 4, 5, 6, 7, 8]);
    }
}

#[test]
fn perf_counters_track_transfers() {
    let (_sim, dev) = attach(SimConfig::default());
    let h2c = dev.open("h2c_0").unwrap();
    h2c.control(PERF_START, &[], &mut []).unwrap();
    h2c.write(0, &vec![0x5A; 64 * 1024]).unwrap();

    let mut out = [0u8; 32];
    assert_eq!(h2c.control(PERF_GET, &[], &mut out).unwrap(), 32);
    let word =
        |out: &[u8], i: usize| u64::from_ne_bytes(out[i * 8..i * 8 + 8].try_into().unwrap());
    assert_eq!(word(&out, 0), 64 * 1024);
    assert!(word(&out, 1) > 0);
    assert_eq!(word(&out, 3), 64 * 1024 / 8);
    assert!(word(&out, 2) > word(&out, 3));

    let perf = dev.engine(Direction::H2C, 0).unwrap().perf();
    assert!(perf.throughput() > 0.0);

    h2c.control(PERF_START, &[], &mut []).unwrap();
    h2c.control(PERF_GET, &[], &mut out).unwrap();
    assert_eq!(word(&out, 0), 0);
}

// ── Release ──────────────────────────────────────────────────────────────────

#[test]
fn handles_fail_after_release() {
    let (_sim, dev) = attach(SimConfig::default());
    let user = dev.open("user").unwrap();
    let h2c = dev.open("h2c_0").unwrap();

    dev.release();
    assert!(!dev.is_attached());

    let mut buf = [0u8; 4];
    assert!(matches!(user.read(0, &mut buf), Err(XdmaError::DeviceGone)));
    assert!(matches!(h2c.write(0, &buf), Err(XdmaError::DeviceGone)));
    assert!(matches!(dev.open("control"), Err(XdmaError::DeviceGone)));
    dev.release();
}

#[test]
fn handles_fail_after_device_drop() {
    let (_sim, dev) = attach(SimConfig::default());
    let ctl = dev.open("control").unwrap();
    drop(dev);
    let mut buf = [0u8; 4];
    assert!(matches!(ctl.read(0, &mut buf), Err(XdmaError::DeviceGone)));
}

// ── Sysfs platform ───────────────────────────────────────────────────────────

#[test]
fn sysfs_platform_attaches_in_poll_mode() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("0000:07:00.0");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("resource"),
        "0x00000000fb000000 0x00000000fb00ffff 0x0000000000040200\n",
    )
    .unwrap();

    let mut bar = vec![0u8; 0x1_0000];
    for (off, id) in [(0x2000usize, 0x1FC2_0006u32), (0x3000, 0x1FC3_0006)] {
        bar[off..off + 4].copy_from_slice(&id.to_le_bytes());
    }
    std::fs::write(dir.join("resource0"), &bar).unwrap();

    let platform = SysfsPlatform::with_root(root.path(), "0000:07:00.0").unwrap();
    let dev = XdmaDevice::attach(Arc::new(platform), DriverConfig::default()).unwrap();
    assert_eq!(dev.layout().unwrap().config, 0);
    assert!(dev.engines().unwrap().is_empty());

    let ctl = dev.open("control").unwrap();
    let mut id = [0u8; 4];
    ctl.read(0x3000, &mut id).unwrap();
    assert_eq!(u32::from_le_bytes(id), 0x1FC3_0006);
    assert!(matches!(dev.open("h2c_0"), Err(XdmaError::InvalidParameter { .. })));
}
