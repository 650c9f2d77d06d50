//! Hardware validation tests
//!
//! Run against a real card bound to vfio-pci. Set `XDMA_TEST_DEVICE` to the
//! function's bus address (default `0000:01:00.0`).

use std::sync::Arc;
use xdma_driver::platform::sysfs::{scan_devices, SYSFS_PCI_DEVICES};
use xdma_driver::{DriverConfig, SysfsPlatform, VfioPlatform, XdmaDevice};

fn address() -> String {
    std::env::var("XDMA_TEST_DEVICE").unwrap_or_else(|_| "0000:01:00.0".into())
}

#[test]
#[ignore] // Requires hardware
fn test_enumerate() {
    let devices = scan_devices(SYSFS_PCI_DEVICES).expect("scan sysfs");
    assert!(!devices.is_empty(), "no Xilinx functions found");
    for d in &devices {
        println!("{} {:04x}:{:04x} driver={:?}", d.address, d.vendor, d.device, d.driver);
    }
}

#[test]
#[ignore] // Requires hardware
fn test_sysfs_discovery() {
    let platform = SysfsPlatform::new(&address()).expect("sysfs platform");
    let dev = XdmaDevice::attach(Arc::new(platform), DriverConfig::default()).expect("attach");
    let layout = dev.layout().expect("layout");
    println!("Layout: {layout:?}");
    println!("IP version: {:?}", dev.ip_version().expect("version"));
    for e in dev.engines().expect("engines") {
        println!("  {} {:?} poll={}", e.id(), e.kind(), e.poll_mode());
        assert!(e.poll_mode());
    }
}

#[test]
#[ignore] // Requires hardware
fn test_vfio_loopback() {
    let platform = VfioPlatform::open(&address()).expect("vfio platform");
    let dev = XdmaDevice::attach(Arc::new(platform), DriverConfig::default()).expect("attach");

    let h2c = dev.open("h2c_0").expect("h2c_0");
    let c2h = dev.open("c2h_0").expect("c2h_0");
    let data: Vec<u8> = (0..1 << 20).map(|i| (i % 253) as u8).collect();
    h2c.write(0, &data).expect("write");

    let mut back = vec![0u8; data.len()];
    c2h.read(0, &mut back).expect("read");
    assert!(back == data, "loopback mismatch");

    let perf = dev
        .engine(xdma_driver::Direction::H2C, 0)
        .expect("engine")
        .perf();
    println!("✅ Loopback OK, {:.1} MB/s", perf.throughput() / 1e6);
}

#[test]
#[ignore] // Requires hardware
fn test_vfio_user_events() {
    let platform = VfioPlatform::open(&address()).expect("vfio platform");
    let dev = XdmaDevice::attach(Arc::new(platform), DriverConfig::default()).expect("attach");
    let ev = dev.open("events_0").expect("events_0");

    let mut flag = [0u8; 1];
    ev.read(0, &mut flag).expect("event read");
    println!("events_0: {}", if flag[0] == 1 { "pulsed" } else { "timed out" });
}
