//! `xdma`: command-line interface for Xilinx XDMA devices.
//!
//! ```text
//! USAGE:
//!   xdma enumerate                        List Xilinx functions
//!   xdma probe <pcie-addr> [--vfio]       Discovery: BARs, IP version, engines
//!   xdma reg <pcie-addr> <node> <offset> [value]
//!                                         Read or write a control/user/bypass register
//!   xdma bind-vfio <pcie-addr>            Bind device to vfio-pci (root)
//!   xdma unbind-vfio <pcie-addr>          Unbind from vfio-pci (root)
//!   xdma iommu-group <pcie-addr>          Show the IOMMU group
//!   xdma selftest [--size N] [--poll]     Loopback against the in-process model
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;
use xdma_driver::platform::sysfs::{scan_devices, SYSFS_PCI_DEVICES};
use xdma_driver::platform::vfio;
use xdma_driver::{
    Direction, DriverConfig, NodeKind, Platform, SimPlatform, SysfsPlatform, VfioPlatform,
    XdmaDevice,
};

#[derive(Parser)]
#[command(name = "xdma", about = "Xilinx XDMA PCIe DMA/bridge CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List Xilinx PCIe functions and their bound drivers.
    Enumerate,
    /// Attach to one function and print what discovery found.
    Probe {
        /// PCIe address (e.g. 0000:01:00.0).
        pcie_addr: String,
        /// Attach through VFIO instead of sysfs (enables DMA and interrupts).
        #[arg(long)]
        vfio: bool,
    },
    /// Read (or write, when VALUE is given) one 32-bit register.
    Reg {
        /// PCIe address (e.g. 0000:01:00.0).
        pcie_addr: String,
        /// Register node: control, user or bypass.
        node: String,
        /// Byte offset, decimal or 0x-prefixed hex.
        offset: String,
        /// Value to write, decimal or 0x-prefixed hex.
        value: Option<String>,
    },
    /// Bind a device to vfio-pci (requires root / CAP_SYS_ADMIN).
    BindVfio {
        /// PCIe address (e.g. 0000:01:00.0).
        pcie_addr: String,
    },
    /// Unbind a device from vfio-pci.
    UnbindVfio {
        /// PCIe address (e.g. 0000:01:00.0).
        pcie_addr: String,
    },
    /// Query the IOMMU group for a device.
    IommuGroup {
        /// PCIe address (e.g. 0000:01:00.0).
        pcie_addr: String,
    },
    /// Run a host-to-card-to-host loopback on the in-process model.
    Selftest {
        /// Transfer size in bytes.
        #[arg(long, default_value_t = 1 << 20)]
        size: usize,
        /// Complete transfers by polling instead of interrupts.
        #[arg(long)]
        poll: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Enumerate => cmd_enumerate()?,
        Cmd::Probe { pcie_addr, vfio } => cmd_probe(&pcie_addr, vfio)?,
        Cmd::Reg {
            pcie_addr,
            node,
            offset,
            value,
        } => cmd_reg(&pcie_addr, &node, &offset, value.as_deref())?,
        Cmd::BindVfio { pcie_addr } => cmd_bind_vfio(&pcie_addr)?,
        Cmd::UnbindVfio { pcie_addr } => cmd_unbind_vfio(&pcie_addr)?,
        Cmd::IommuGroup { pcie_addr } => cmd_iommu_group(&pcie_addr)?,
        Cmd::Selftest { size, poll } => cmd_selftest(size, poll)?,
    }

    Ok(())
}

fn parse_number(s: &str) -> Result<u64> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.with_context(|| format!("not a number: {s}"))
}

fn cmd_enumerate() -> Result<()> {
    let devices = scan_devices(SYSFS_PCI_DEVICES)?;

    println!("Xilinx functions: {}", devices.len());
    for d in &devices {
        let kind = if xdma_chip::pcie::is_xdma(d.vendor, d.device) {
            "XDMA"
        } else {
            "other"
        };
        println!(
            "  {}  {:04x}:{:04x}  {:5}  driver={}",
            d.address,
            d.vendor,
            d.device,
            kind,
            d.driver.as_deref().unwrap_or("-")
        );
    }
    if devices.is_empty() {
        println!("  (none; check with `lspci -d {}`)", xdma_chip::pcie::lspci_filter());
    }
    Ok(())
}

fn attach(pcie_addr: &str, use_vfio: bool) -> Result<Arc<XdmaDevice>> {
    tracing::debug!(
        "Attaching {pcie_addr} via {}",
        if use_vfio { "VFIO" } else { "sysfs" }
    );
    let platform: Arc<dyn Platform> = if use_vfio {
        Arc::new(VfioPlatform::open(pcie_addr)?)
    } else {
        Arc::new(SysfsPlatform::new(pcie_addr)?)
    };
    Ok(XdmaDevice::attach(platform, DriverConfig::from_env())?)
}

fn cmd_probe(pcie_addr: &str, use_vfio: bool) -> Result<()> {
    let dev = attach(pcie_addr, use_vfio)?;
    let layout = dev.layout()?;

    println!("Device       : {}", dev.platform().name());
    println!("BARs mapped  : {}", layout.count);
    println!("Config BAR   : {}", layout.config);
    println!(
        "User BAR     : {}",
        layout.user.map_or_else(|| "-".to_string(), |b| b.to_string())
    );
    println!(
        "Bypass BAR   : {}",
        layout.bypass.map_or_else(|| "-".to_string(), |b| b.to_string())
    );
    println!("IP version   : {:?}", dev.ip_version()?);

    let engines = dev.engines()?;
    println!("Engines      : {}", engines.len());
    for e in &engines {
        let a = e.alignments();
        println!(
            "  {:6} {:?}  irq bit {}  {} mode  align {} / granule {} / {} addr bits",
            e.id().to_string(),
            e.kind(),
            e.irq_bit().trailing_zeros(),
            if e.poll_mode() { "poll" } else { "interrupt" },
            a.address,
            a.length,
            a.address_bits
        );
    }
    Ok(())
}

fn cmd_reg(pcie_addr: &str, node: &str, offset: &str, value: Option<&str>) -> Result<()> {
    let kind: NodeKind = node.parse()?;
    if kind.engine_id().is_some() || matches!(kind, NodeKind::Event(_)) {
        bail!("{kind} is not a register node");
    }
    let offset = parse_number(offset)?;
    let dev = attach(pcie_addr, false)?;
    let handle = dev.open(node)?;

    if let Some(value) = value {
        let value = u32::try_from(parse_number(value)?).context("value exceeds 32 bits")?;
        handle.write(offset, &value.to_le_bytes())?;
        println!("{kind}[{offset:#x}] <- {value:#010x}");
    } else {
        let mut word = [0u8; 4];
        handle.read(offset, &mut word)?;
        println!("{kind}[{offset:#x}] = {:#010x}", u32::from_le_bytes(word));
    }
    Ok(())
}

fn cmd_bind_vfio(pcie_addr: &str) -> Result<()> {
    println!("Binding {pcie_addr} to vfio-pci ...");
    vfio::bind_to_vfio(pcie_addr)?;
    let group = vfio::iommu_group(pcie_addr)?;
    println!("Done. IOMMU group: {group}");
    println!("Grant access:  sudo chown $USER /dev/vfio/{group}");
    Ok(())
}

fn cmd_unbind_vfio(pcie_addr: &str) -> Result<()> {
    println!("Unbinding {pcie_addr} from vfio-pci ...");
    vfio::unbind_from_vfio(pcie_addr)?;
    println!("Done.");
    Ok(())
}

fn cmd_iommu_group(pcie_addr: &str) -> Result<()> {
    let group = vfio::iommu_group(pcie_addr)?;
    println!("IOMMU group for {pcie_addr}: {group}");
    println!("Device file: /dev/vfio/{group}");
    Ok(())
}

fn cmd_selftest(size: usize, poll: bool) -> Result<()> {
    if size == 0 {
        bail!("size must be at least 1 byte");
    }
    let config = DriverConfig {
        poll_mode: poll,
        ..DriverConfig::from_env()
    };
    let sim = SimPlatform::with_defaults()?;
    let dev = XdmaDevice::attach(sim.clone(), config)?;

    let h2c = dev.open("h2c_0")?;
    let c2h = dev.open("c2h_0")?;
    let perf_start = xdma_chip::ioctl::PERF_START;
    h2c.control(perf_start, &[], &mut [])?;
    c2h.control(perf_start, &[], &mut [])?;

    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let started = Instant::now();
    h2c.write(0, &data)?;
    let mut back = vec![0u8; size];
    c2h.read(0, &mut back)?;
    let elapsed = started.elapsed();

    if back != data {
        let at = back.iter().zip(&data).position(|(a, b)| a != b).unwrap_or(0);
        bail!("loopback mismatch at byte {at}");
    }

    let mode = if poll { "poll" } else { "interrupt" };
    println!("Loopback     : {size} bytes OK in {elapsed:?} ({mode} mode)");
    for dir in Direction::ALL {
        let perf = dev.engine(dir, 0)?.perf();
        println!(
            "  {dir}_0      : {:.1} MB/s, {} data / {} clock cycles ({:.0}% busy)",
            perf.throughput() / 1e6,
            perf.data_cycles,
            perf.clock_cycles,
            perf.efficiency() * 100.0
        );
    }
    println!("Interrupts   : {}", sim.interrupts_delivered());
    dev.release();
    Ok(())
}
