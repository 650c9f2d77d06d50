//! Pure Rust driver for the Xilinx DMA/Bridge Subsystem for PCI Express (XDMA).
//!
//! The IP exposes a config BAR with per-channel scatter/gather DMA engines,
//! an optional user-logic BAR and an optional DMA bypass BAR. This crate
//! finds those BARs, drives the engines and presents everything as named
//! device nodes.
//!
//! # Platforms
//!
//! ```text
//! VfioPlatform   VFIO/IOMMU: BARs, pinned DMA memory, MSI (production)
//! SysfsPlatform  sysfs resourceN mmap: discovery and registers only
//! SimPlatform    in-process model of the IP (tests, self-test)
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use xdma_driver::{DriverConfig, SimPlatform, XdmaDevice};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dev = XdmaDevice::attach(SimPlatform::with_defaults()?, DriverConfig::default())?;
//!
//! let h2c = dev.open("h2c_0")?;
//! let c2h = dev.open("c2h_0")?;
//! h2c.write(0x1000, b"loopback")?;
//!
//! let mut back = [0u8; 8];
//! c2h.read(0x1000, &mut back)?;
//! assert_eq!(&back, b"loopback");
//! # Ok(())
//! # }
//! ```
//!
//! # Node namespace
//!
//! `control`, `user`, `bypass`, `h2c_0..3`, `c2h_0..3`, `events_0..15`.
//! See [`node`] for what each accepts.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod bar;
pub mod config;
mod device;
pub mod discovery;
pub mod engine;
mod error;
pub mod interrupt;
pub mod mmio;
pub mod node;
pub mod perf;
pub mod platform;
pub mod queue;
mod sync;

/// Hardware identification constants (re-exported from xdma-chip).
pub mod pcie_ids {
    pub use xdma_chip::pcie::{is_xdma, lspci_filter, ALL_DEVICE_IDS, XILINX_VENDOR_ID};
}

pub use bar::{AccessWidth, Bars};
pub use config::DriverConfig;
pub use device::XdmaDevice;
pub use discovery::BarLayout;
pub use engine::{
    ConsumeStatus, Completed, DmaRequest, Engine, EngineId, EngineKind, EngineStatus, StreamRing,
    TransferHandle, TransferState,
};
pub use error::{Result, XdmaError};
pub use interrupt::{EventLine, IrqController, IrqTarget};
pub use node::{FileHandle, NodeKind};
pub use perf::PerfData;
pub use platform::{
    DmaMemory, DmaSegment, MemoryResource, Platform, SimBar, SimChannel, SimConfig, SimPlatform,
    SysfsPlatform, VfioPlatform,
};
pub use queue::{DispatchQueue, PendingIo};
pub use xdma_chip::Direction;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        ConsumeStatus, Direction, DriverConfig, FileHandle, NodeKind, PerfData, Platform, Result,
        SimConfig, SimPlatform, VfioPlatform, XdmaDevice, XdmaError,
    };
}
