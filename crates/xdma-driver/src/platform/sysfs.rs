//! Sysfs platform: BAR access through `/sys/bus/pci/devices/<addr>/resourceN`
//!
//! Enough for discovery and register access while the function is bound to
//! any driver that leaves memory decoding enabled. There is no DMA memory and
//! no interrupt delivery here; use VFIO for that.

use super::{DmaMemory, InterruptHandler, MemoryResource, Platform};
use crate::error::{Result, XdmaError};
use crate::mmio::{MappedRegion, Mmio};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use xdma_chip::pcie;

/// Default sysfs PCI device directory.
pub const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// `IORESOURCE_IO` flag in the sysfs `resource` file.
const IORESOURCE_IO: u64 = 0x100;
/// `IORESOURCE_MEM` flag in the sysfs `resource` file.
const IORESOURCE_MEM: u64 = 0x200;

/// Standard BARs per function.
const STANDARD_BARS: usize = 6;

/// A PCI function found in sysfs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDevice {
    /// Bus address (`0000:01:00.0`).
    pub address: String,
    /// Vendor ID.
    pub vendor: u16,
    /// Device ID.
    pub device: u16,
    /// Bound kernel driver, if any.
    pub driver: Option<String>,
}

/// BAR access through sysfs resource files
#[derive(Debug, Clone)]
pub struct SysfsPlatform {
    dir: PathBuf,
    address: String,
}

impl SysfsPlatform {
    /// Platform for the function at `address` under the default sysfs root.
    ///
    /// # Errors
    ///
    /// Returns an error if the function does not exist.
    pub fn new(address: &str) -> Result<Self> {
        Self::with_root(SYSFS_PCI_DEVICES, address)
    }

    /// Platform for `address` under an alternate devices directory.
    ///
    /// # Errors
    ///
    /// Returns an error if `<root>/<address>` does not exist.
    pub fn with_root(root: impl AsRef<Path>, address: &str) -> Result<Self> {
        let dir = root.as_ref().join(address);
        if !dir.is_dir() {
            return Err(XdmaError::invalid_parameter(format!(
                "No PCI function at {}",
                dir.display()
            )));
        }
        Ok(Self {
            dir,
            address: address.to_string(),
        })
    }

    /// Bus address of the function.
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Platform for SysfsPlatform {
    fn name(&self) -> String {
        format!("sysfs:{}", self.address)
    }

    fn memory_resources(&self) -> Result<Vec<MemoryResource>> {
        let table = std::fs::read_to_string(self.dir.join("resource"))?;
        Ok(parse_resource_table(&table))
    }

    fn map(&self, resource: &MemoryResource) -> Result<Arc<dyn Mmio>> {
        let path = self.dir.join(format!("resource{}", resource.bar));
        tracing::debug!("Mapping {}", path.display());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                XdmaError::configuration(format!(
                    "Cannot open {}: {e}. Is the device enabled?",
                    path.display()
                ))
            })?;

        let region = MappedRegion::map(
            &file,
            0,
            resource.len,
            format!("{} BAR{}", self.address, resource.bar),
        )?;
        Ok(Arc::new(region))
    }

    fn alloc_dma(&self, _len: usize, _contiguous: bool) -> Result<Arc<dyn DmaMemory>> {
        Err(XdmaError::not_supported(
            "DMA memory on the sysfs platform (bind to vfio-pci)",
        ))
    }

    fn connect_interrupt(&self, _handler: InterruptHandler) -> Result<()> {
        Err(XdmaError::not_supported(
            "interrupts on the sysfs platform (bind to vfio-pci)",
        ))
    }

    fn disconnect_interrupt(&self) {}
}

/// Parse the sysfs `resource` table (`start end flags` per line, one line per BAR).
pub fn parse_resource_table(table: &str) -> Vec<MemoryResource> {
    table
        .lines()
        .take(STANDARD_BARS)
        .enumerate()
        .filter_map(|(bar, line)| {
            let mut fields = line.split_whitespace().map(parse_hex);
            let (start, end, flags) = (fields.next()??, fields.next()??, fields.next()??);
            if start == 0 || end < start || flags & IORESOURCE_IO != 0 {
                return None;
            }
            if flags & IORESOURCE_MEM == 0 {
                return None;
            }
            let len = usize::try_from(end - start + 1).ok()?;
            Some(MemoryResource { bar, start, len })
        })
        .collect()
}

fn parse_hex(s: &str) -> Option<u64> {
    u64::from_str_radix(s.trim().trim_start_matches("0x"), 16).ok()
}

/// Every function under `root` with the Xilinx vendor ID, sorted by address.
///
/// # Errors
///
/// Returns an error if `root` cannot be read.
pub fn scan_devices(root: impl AsRef<Path>) -> Result<Vec<PciDevice>> {
    let mut found = Vec::new();

    for entry in std::fs::read_dir(root.as_ref())?.flatten() {
        let path = entry.path();
        let (Some(vendor), Some(device)) = (
            read_hex_id(&path.join("vendor")),
            read_hex_id(&path.join("device")),
        ) else {
            continue;
        };
        if vendor != pcie::XILINX_VENDOR_ID {
            continue;
        }
        let driver = std::fs::read_link(path.join("driver"))
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));

        found.push(PciDevice {
            address: entry.file_name().to_string_lossy().into_owned(),
            vendor,
            device,
            driver,
        });
    }

    found.sort_by(|a, b| a.address.cmp(&b.address));
    tracing::debug!("Found {} Xilinx function(s) under {}", found.len(), root.as_ref().display());
    Ok(found)
}

fn read_hex_id(path: &Path) -> Option<u16> {
    let content = std::fs::read_to_string(path).ok()?;
    u16::from_str_radix(content.trim().trim_start_matches("0x"), 16).ok()
}
