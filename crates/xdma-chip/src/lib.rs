//! Silicon model for the Xilinx DMA/Bridge Subsystem for PCI Express (XDMA).
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the IP: register block layout, identifier decoding, the
//! scatter/gather descriptor format, PCIe identifiers and the control codes
//! exposed on DMA device nodes.
//!
//! Register offsets follow PG195 (DMA/Bridge Subsystem for PCI Express,
//! Product Guide), register space section.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`pcie`] | Vendor/device IDs |
//! | [`regs`] | Config BAR block map, engine/SGDMA/IRQ/config registers, bit definitions |
//! | [`desc`] | 32-byte descriptor and streaming write-back encodings |
//! | [`ioctl`] | Control codes accepted on `h2c_*` / `c2h_*` nodes |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod desc;
pub mod ioctl;
pub mod pcie;
pub mod regs;

/// Maximum number of DMA channels per direction.
pub const MAX_CHANNELS: usize = 4;

/// Number of user interrupt lines.
pub const MAX_USER_IRQ: usize = 16;

/// Maximum number of memory BARs the IP exposes (user, config, bypass).
pub const MAX_BARS: usize = 3;

/// Transfer direction as seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host-to-card (write).
    H2C = 0,
    /// Card-to-host (read).
    C2H = 1,
}

impl Direction {
    /// Both directions, H2C first (hardware block order).
    pub const ALL: [Self; 2] = [Self::H2C, Self::C2H];

    /// Lower-case prefix used in device node names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::H2C => "h2c",
            Self::C2H => "c2h",
        }
    }

    /// Index into per-direction tables.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
