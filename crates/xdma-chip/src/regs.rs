//! Config BAR register map.
//!
//! The config BAR is divided into 4 KiB blocks selected by address bits 15:12.
//! Engine and SGDMA blocks are further divided into 256-byte channel windows
//! selected by bits 11:8.
//!
//! ```text
//! 0x0000  H2C channel engines   (ch * 0x100)
//! 0x1000  C2H channel engines   (ch * 0x100)
//! 0x2000  IRQ block
//! 0x3000  Config block
//! 0x4000  H2C SGDMA             (ch * 0x100)
//! 0x5000  C2H SGDMA             (ch * 0x100)
//! 0x6000  SGDMA common
//! ```

use crate::Direction;

// ── Block layout ─────────────────────────────────────────────────────────────

/// Size of one register block.
pub const BLOCK_SIZE: usize = 0x1000;
/// Stride between channel windows inside an engine or SGDMA block.
pub const CHANNEL_STRIDE: usize = 0x100;

/// IRQ block offset within the config BAR.
pub const IRQ_BLOCK_OFFSET: usize = 2 * BLOCK_SIZE;
/// Config block offset within the config BAR.
pub const CONFIG_BLOCK_OFFSET: usize = 3 * BLOCK_SIZE;
/// SGDMA common block offset.
pub const SGDMA_COMMON_BLOCK_OFFSET: usize = 6 * BLOCK_SIZE;

/// Offset of the engine register window for `(dir, channel)`.
#[must_use]
pub const fn engine_offset(dir: Direction, channel: usize) -> usize {
    (dir as usize) * BLOCK_SIZE + channel * CHANNEL_STRIDE
}

/// Offset of the SGDMA register window for `(dir, channel)`.
#[must_use]
pub const fn sgdma_offset(dir: Direction, channel: usize) -> usize {
    (4 + dir as usize) * BLOCK_SIZE + channel * CHANNEL_STRIDE
}

/// Smallest config BAR that contains every block.
pub const CONFIG_BAR_MIN_SIZE: usize = 7 * BLOCK_SIZE;

// ── Identifier word ──────────────────────────────────────────────────────────

/// Mask selecting the subsystem magic of an identifier register.
pub const ID_MASK: u32 = 0xFFF0_0000;
/// Subsystem magic (`0x1FC`) in identifier bits 31:20.
pub const ID_MAGIC: u32 = 0x1FC0_0000;

/// Target field values (identifier bits 19:16).
pub mod target {
    /// H2C channel engine.
    pub const H2C: u32 = 0;
    /// C2H channel engine.
    pub const C2H: u32 = 1;
    /// IRQ block.
    pub const IRQ: u32 = 2;
    /// Config block.
    pub const CONFIG: u32 = 3;
    /// H2C SGDMA.
    pub const H2C_SGDMA: u32 = 4;
    /// C2H SGDMA.
    pub const C2H_SGDMA: u32 = 5;
    /// SGDMA common.
    pub const SGDMA_COMMON: u32 = 6;
}

/// Decoded identifier register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identifier(pub u32);

impl Identifier {
    /// Build an identifier word.
    #[must_use]
    pub const fn new(target: u32, stream: bool, channel: u32, version: u8) -> Self {
        Self(
            ID_MAGIC
                | ((target & 0xF) << 16)
                | ((stream as u32) << 15)
                | ((channel & 0xF) << 8)
                | version as u32,
        )
    }

    /// Subsystem magic present.
    #[must_use]
    pub const fn is_xdma(self) -> bool {
        self.0 & ID_MASK == ID_MAGIC
    }

    /// Target block.
    #[must_use]
    pub const fn target(self) -> u32 {
        (self.0 >> 16) & 0xF
    }

    /// AXI4-Stream interface (as opposed to AXI4 memory mapped).
    #[must_use]
    pub const fn is_stream(self) -> bool {
        self.0 & (1 << 15) != 0
    }

    /// Channel number.
    #[must_use]
    pub const fn channel(self) -> u32 {
        (self.0 >> 8) & 0xF
    }

    /// Raw IP version byte.
    #[must_use]
    pub const fn version(self) -> u8 {
        (self.0 & 0xFF) as u8
    }
}

/// IP core release encoded in the identifier version byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    /// Vivado 2015.4
    V2015_4,
    /// Vivado 2016.1
    V2016_1,
    /// Vivado 2016.2
    V2016_2,
    /// Vivado 2016.3
    V2016_3,
    /// Vivado 2016.4
    V2016_4,
    /// Vivado 2017.1
    V2017_1,
    /// Vivado 2017.2
    V2017_2,
    /// Vivado 2017.3
    V2017_3,
    /// Unrecognised version byte
    Unknown(u8),
}

impl IpVersion {
    /// Version this driver targets.
    pub const TARGET: Self = Self::V2017_1;

    /// Decode the identifier version byte.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::V2015_4,
            2 => Self::V2016_1,
            3 => Self::V2016_2,
            4 => Self::V2016_3,
            5 => Self::V2016_4,
            6 => Self::V2017_1,
            7 => Self::V2017_2,
            8 => Self::V2017_3,
            other => Self::Unknown(other),
        }
    }

    /// Raw version byte.
    #[must_use]
    pub const fn raw(self) -> u8 {
        match self {
            Self::V2015_4 => 1,
            Self::V2016_1 => 2,
            Self::V2016_2 => 3,
            Self::V2016_3 => 4,
            Self::V2016_4 => 5,
            Self::V2017_1 => 6,
            Self::V2017_2 => 7,
            Self::V2017_3 => 8,
            Self::Unknown(raw) => raw,
        }
    }
}

// ── Channel engine registers (relative to engine_offset) ────────────────────

/// Channel engine register offsets.
pub mod engine {
    /// Identifier.
    pub const IDENTIFIER: usize = 0x00;
    /// Control.
    pub const CONTROL: usize = 0x04;
    /// Control, write 1 to set.
    pub const CONTROL_W1S: usize = 0x08;
    /// Control, write 1 to clear.
    pub const CONTROL_W1C: usize = 0x0C;
    /// Status.
    pub const STATUS: usize = 0x40;
    /// Status, clear on read.
    pub const STATUS_RC: usize = 0x44;
    /// Completed descriptor count since the engine was last started.
    pub const COMPLETED_DESC_COUNT: usize = 0x48;
    /// Alignment requirements (address alignment, length granularity, address bits).
    pub const ALIGNMENTS: usize = 0x4C;
    /// Poll-mode write-back address, low.
    pub const POLL_WB_LO: usize = 0x88;
    /// Poll-mode write-back address, high.
    pub const POLL_WB_HI: usize = 0x8C;
    /// Interrupt enable mask.
    pub const INT_ENABLE_MASK: usize = 0x90;
    /// Interrupt enable mask, write 1 to set.
    pub const INT_ENABLE_MASK_W1S: usize = 0x94;
    /// Interrupt enable mask, write 1 to clear.
    pub const INT_ENABLE_MASK_W1C: usize = 0x98;
    /// Performance monitor control.
    pub const PERF_CTRL: usize = 0xC0;
    /// Performance cycle count, low.
    pub const PERF_CYC_LO: usize = 0xC4;
    /// Performance cycle count, high.
    pub const PERF_CYC_HI: usize = 0xC8;
    /// Performance data count, low.
    pub const PERF_DAT_LO: usize = 0xCC;
    /// Performance data count, high.
    pub const PERF_DAT_HI: usize = 0xD0;
}

/// Engine control register bits.
pub mod control {
    /// Start the engine.
    pub const RUN: u32 = 1 << 0;
    /// Interrupt on descriptor with STOP flag.
    pub const IE_DESC_STOPPED: u32 = 1 << 1;
    /// Interrupt on descriptor with COMPLETED flag.
    pub const IE_DESC_COMPLETED: u32 = 1 << 2;
    /// Interrupt on source/destination alignment mismatch.
    pub const IE_ALIGN_MISMATCH: u32 = 1 << 3;
    /// Interrupt on bad descriptor magic.
    pub const IE_MAGIC_STOPPED: u32 = 1 << 4;
    /// Interrupt on invalid length.
    pub const IE_INVALID_LENGTH: u32 = 1 << 5;
    /// Interrupt when the engine idles after a run.
    pub const IE_IDLE_STOPPED: u32 = 1 << 6;
    /// Interrupt on read error (5-bit field).
    pub const IE_READ_ERROR: u32 = 0x1F << 9;
    /// Interrupt on descriptor fetch error (5-bit field).
    pub const IE_DESC_ERROR: u32 = 0x1F << 19;
    /// Keep the AXI address fixed instead of incrementing.
    pub const NON_INCR_ADDR: u32 = 1 << 25;
    /// Enable poll-mode write-back.
    pub const POLL_MODE_WB: u32 = 1 << 26;

    /// Interrupt sources a transfer arms.
    pub const IE_ALL: u32 = IE_DESC_STOPPED
        | IE_DESC_COMPLETED
        | IE_ALIGN_MISMATCH
        | IE_MAGIC_STOPPED
        | IE_INVALID_LENGTH
        | IE_READ_ERROR
        | IE_DESC_ERROR;
}

/// Engine status register bits.
pub mod status {
    /// Engine is processing descriptors.
    pub const BUSY: u32 = 1 << 0;
    /// Stopped on a descriptor with STOP flag.
    pub const DESC_STOPPED: u32 = 1 << 1;
    /// Completed a descriptor with COMPLETED flag.
    pub const DESC_COMPLETED: u32 = 1 << 2;
    /// Source/destination alignment mismatch.
    pub const ALIGN_MISMATCH: u32 = 1 << 3;
    /// Descriptor magic mismatch.
    pub const MAGIC_STOPPED: u32 = 1 << 4;
    /// Invalid descriptor length.
    pub const INVALID_LENGTH: u32 = 1 << 5;
    /// Idle after stop.
    pub const IDLE_STOPPED: u32 = 1 << 6;
    /// Data read/write error field.
    pub const READ_ERROR: u32 = 0x1F << 9;
    /// Descriptor fetch error field.
    pub const DESC_ERROR: u32 = 0x1F << 19;

    /// Bits that indicate a failed transfer.
    pub const ERROR_MASK: u32 =
        ALIGN_MISMATCH | MAGIC_STOPPED | INVALID_LENGTH | READ_ERROR | DESC_ERROR;
}

/// Performance monitor control bits.
pub mod perf {
    /// Start counting.
    pub const RUN: u32 = 1 << 0;
    /// Clear counters.
    pub const CLEAR: u32 = 1 << 1;
    /// Start/stop automatically with the engine RUN bit.
    pub const AUTO: u32 = 1 << 2;
}

/// Decoded alignment register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignments {
    /// Required address alignment in bytes.
    pub address: u32,
    /// Required length granularity in bytes.
    pub length: u32,
    /// Number of valid address bits.
    pub address_bits: u32,
}

impl Alignments {
    /// Decode the raw register value.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self {
            address: (raw >> 16) & 0xFF,
            length: (raw >> 8) & 0xFF,
            address_bits: raw & 0xFF,
        }
    }

    /// Encode to the raw register value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        ((self.address & 0xFF) << 16) | ((self.length & 0xFF) << 8) | (self.address_bits & 0xFF)
    }
}

// ── SGDMA registers (relative to sgdma_offset) ───────────────────────────────

/// SGDMA register offsets.
pub mod sgdma {
    /// Identifier.
    pub const IDENTIFIER: usize = 0x00;
    /// First descriptor bus address, low.
    pub const FIRST_DESC_LO: usize = 0x80;
    /// First descriptor bus address, high.
    pub const FIRST_DESC_HI: usize = 0x84;
    /// Number of extra descriptors adjacent to the first.
    pub const FIRST_DESC_ADJACENT: usize = 0x88;
    /// Descriptor credits (credit mode only).
    pub const CREDITS: usize = 0x8C;
}

/// SGDMA common register offsets (relative to `SGDMA_COMMON_BLOCK_OFFSET`).
pub mod sgdma_common {
    /// Identifier.
    pub const IDENTIFIER: usize = 0x00;
    /// Descriptor credit mode enable, one bit per engine (H2C bits 3:0, C2H bits 19:16).
    pub const CREDIT_MODE_ENABLE: usize = 0x20;
    /// Credit mode enable, write 1 to set.
    pub const CREDIT_MODE_ENABLE_W1S: usize = 0x24;
    /// Credit mode enable, write 1 to clear.
    pub const CREDIT_MODE_ENABLE_W1C: usize = 0x28;

    /// Credit mode bit for an engine.
    #[must_use]
    pub const fn credit_bit(dir: crate::Direction, channel: usize) -> u32 {
        1 << (channel + 16 * dir as usize)
    }
}

// ── IRQ block (relative to IRQ_BLOCK_OFFSET) ─────────────────────────────────

/// IRQ block register offsets.
pub mod irq {
    /// Identifier.
    pub const IDENTIFIER: usize = 0x00;
    /// User interrupt enable mask.
    pub const USER_INT_ENABLE: usize = 0x04;
    /// User interrupt enable, write 1 to set.
    pub const USER_INT_ENABLE_W1S: usize = 0x08;
    /// User interrupt enable, write 1 to clear.
    pub const USER_INT_ENABLE_W1C: usize = 0x0C;
    /// Channel interrupt enable mask.
    pub const CHANNEL_INT_ENABLE: usize = 0x10;
    /// Channel interrupt enable, write 1 to set.
    pub const CHANNEL_INT_ENABLE_W1S: usize = 0x14;
    /// Channel interrupt enable, write 1 to clear.
    pub const CHANNEL_INT_ENABLE_W1C: usize = 0x18;
    /// Raw user interrupt requests.
    pub const USER_INT_REQUEST: usize = 0x40;
    /// Raw channel interrupt requests.
    pub const CHANNEL_INT_REQUEST: usize = 0x44;
    /// Masked user interrupt requests.
    pub const USER_INT_PENDING: usize = 0x48;
    /// Masked channel interrupt requests.
    pub const CHANNEL_INT_PENDING: usize = 0x4C;
    /// User vector number registers (4 lines per register), first.
    pub const USER_VECTOR_BASE: usize = 0x80;
    /// Number of user vector registers.
    pub const USER_VECTOR_COUNT: usize = 4;
    /// Channel vector number registers, first.
    pub const CHANNEL_VECTOR_BASE: usize = 0xA0;
    /// Number of channel vector registers.
    pub const CHANNEL_VECTOR_COUNT: usize = 2;

    /// Channel interrupt bit for an engine. H2C engines occupy the low bits,
    /// C2H engines follow the last H2C engine.
    #[must_use]
    pub const fn channel_bit(dir: crate::Direction, channel: usize, h2c_count: usize) -> u32 {
        match dir {
            crate::Direction::H2C => 1 << channel,
            crate::Direction::C2H => 1 << (h2c_count + channel),
        }
    }
}

// ── Config block (relative to CONFIG_BLOCK_OFFSET) ───────────────────────────

/// Config block register offsets.
pub mod config {
    /// Identifier (version byte in bits 7:0).
    pub const IDENTIFIER: usize = 0x00;
    /// PCIe max payload size.
    pub const MAX_PAYLOAD: usize = 0x04;
    /// PCIe max read request size.
    pub const MAX_READ_REQUEST: usize = 0x08;
    /// System ID.
    pub const SYSTEM_ID: usize = 0x0C;
    /// MSI enable.
    pub const MSI_ENABLE: usize = 0x10;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_offsets() {
        assert_eq!(engine_offset(Direction::H2C, 0), 0x0000);
        assert_eq!(engine_offset(Direction::C2H, 3), 0x1300);
        assert_eq!(sgdma_offset(Direction::H2C, 1), 0x4100);
        assert_eq!(sgdma_offset(Direction::C2H, 2), 0x5200);
        assert_eq!(IRQ_BLOCK_OFFSET, 0x2000);
        assert_eq!(CONFIG_BLOCK_OFFSET, 0x3000);
    }

    #[test]
    fn identifier_fields() {
        let id = Identifier::new(target::C2H, true, 2, 6);
        assert!(id.is_xdma());
        assert_eq!(id.target(), target::C2H);
        assert!(id.is_stream());
        assert_eq!(id.channel(), 2);
        assert_eq!(IpVersion::from_raw(id.version()), IpVersion::V2017_1);
        assert!(!Identifier(0xDEAD_BEEF).is_xdma());
    }

    #[test]
    fn channel_irq_bits() {
        assert_eq!(irq::channel_bit(Direction::H2C, 1, 4), 0b10);
        assert_eq!(irq::channel_bit(Direction::C2H, 0, 4), 1 << 4);
        assert_eq!(irq::channel_bit(Direction::C2H, 0, 2), 1 << 2);
    }

    #[test]
    fn version_roundtrip_unknown() {
        assert_eq!(IpVersion::from_raw(0x42), IpVersion::Unknown(0x42));
        assert_eq!(IpVersion::Unknown(0x42).raw(), 0x42);
    }
}
