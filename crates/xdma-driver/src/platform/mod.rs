//! Host platform seam
//!
//! Everything the driver needs from the host goes through [`Platform`]:
//! enumerating memory BARs, mapping them, allocating DMA-visible host memory
//! and delivering the device interrupt.
//!
//! ```text
//! SysfsPlatform  BAR mmap via /sys resourceN, no DMA, no interrupts
//! VfioPlatform   VFIO/IOMMU: regions, pinned DMA memory, MSI eventfd
//! SimPlatform    in-process model of the IP (tests, self-test)
//! ```

pub mod sim;
pub mod sysfs;
pub mod vfio;

use crate::error::Result;
use crate::mmio::Mmio;
use std::sync::Arc;

pub use sim::{SimBar, SimChannel, SimConfig, SimPlatform};
pub use sysfs::{PciDevice, SysfsPlatform};
pub use vfio::VfioPlatform;

/// Host page size assumed for DMA memory.
pub const PAGE_SIZE: usize = 4096;

/// One memory BAR as enumerated by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryResource {
    /// BAR number on the function (0..5).
    pub bar: usize,
    /// Bus start address.
    pub start: u64,
    /// Length in bytes.
    pub len: usize,
}

/// A physically contiguous run of DMA memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSegment {
    /// Device-visible address of the run.
    pub bus_addr: u64,
    /// Offset of the run within the buffer.
    pub offset: usize,
    /// Length of the run.
    pub len: usize,
}

/// Host memory the card can address.
///
/// Contents are shared with the device, so access is by copy rather than by
/// slice.
pub trait DmaMemory: Send + Sync + std::fmt::Debug {
    /// Buffer length in bytes.
    fn len(&self) -> usize;

    /// Scatter list, ordered by offset, covering the whole buffer.
    fn segments(&self) -> &[DmaSegment];

    /// Copy `buf.len()` bytes starting at `offset` out of the buffer.
    fn read(&self, offset: usize, buf: &mut [u8]);

    /// Copy `data` into the buffer at `offset`.
    fn write(&self, offset: usize, data: &[u8]);

    /// Whether the buffer is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bus address of byte `offset`.
    fn bus_addr(&self, offset: usize) -> Option<u64> {
        self.segments()
            .iter()
            .find(|s| offset >= s.offset && offset < s.offset + s.len)
            .map(|s| s.bus_addr + (offset - s.offset) as u64)
    }
}

/// Called once per device interrupt.
pub type InterruptHandler = Arc<dyn Fn() + Send + Sync>;

/// Host services for one PCIe function.
pub trait Platform: Send + Sync + std::fmt::Debug {
    /// Short description for logs.
    fn name(&self) -> String;

    /// Memory BARs in bus enumeration order. I/O port BARs are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus cannot be queried.
    fn memory_resources(&self) -> Result<Vec<MemoryResource>>;

    /// Map a BAR into the driver's address space.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if mapping fails.
    fn map(&self, resource: &MemoryResource) -> Result<Arc<dyn Mmio>>;

    /// Allocate `len` bytes of DMA memory, physically contiguous if asked.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` on platforms without DMA.
    fn alloc_dma(&self, len: usize, contiguous: bool) -> Result<Arc<dyn DmaMemory>>;

    /// Route the device interrupt to `handler`.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` on platforms without interrupt delivery.
    fn connect_interrupt(&self, handler: InterruptHandler) -> Result<()>;

    /// Stop delivering interrupts. Returns once no handler call is running.
    fn disconnect_interrupt(&self);
}

/// Merge page-sized runs with consecutive bus addresses into segments.
pub fn coalesce_pages(pages: &[u64], page_size: usize, len: usize) -> Vec<DmaSegment> {
    let mut out: Vec<DmaSegment> = Vec::new();
    let mut offset = 0;
    for &addr in pages {
        if offset >= len {
            break;
        }
        let run = page_size.min(len - offset);
        match out.last_mut() {
            Some(last) if last.bus_addr + last.len as u64 == addr => last.len += run,
            _ => out.push(DmaSegment {
                bus_addr: addr,
                offset,
                len: run,
            }),
        }
        offset += run;
    }
    out
}
