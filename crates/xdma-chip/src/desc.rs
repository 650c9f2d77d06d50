//! Scatter/gather descriptor and streaming write-back encodings.
//!
//! A descriptor is 32 bytes, little endian:
//!
//! ```text
//! 0x00  control    magic 0xAD4B in 31:16, next-adjacent 13:8, flags 7:0
//! 0x04  length     bytes, 28 bits
//! 0x08  src        64-bit bus address (C2H stream: write-back slot)
//! 0x10  dst        64-bit bus address
//! 0x18  next       64-bit bus address of the next descriptor
//! ```
//!
//! Descriptors are fetched by the SGDMA in blocks; `next_adjacent` tells the
//! engine how many further descriptors follow contiguously in memory.

/// Encoded size of one descriptor.
pub const DESC_SIZE: usize = 32;

/// Descriptor magic in control bits 31:16.
pub const DESC_MAGIC: u32 = 0xAD4B;

/// Largest byte count a descriptor can carry.
pub const DESC_MAX_LEN: u32 = (1 << 28) - 1;

/// Largest byte count the driver places in one descriptor.
pub const MAX_DESC_BYTES: usize = 1 << 20;

/// Maximum `next_adjacent` value encodable in the control word.
pub const MAX_ADJACENT: u32 = 0x3F;

/// Descriptor control flags.
pub mod flags {
    /// Stop the engine after this descriptor.
    pub const STOP: u32 = 1 << 0;
    /// Report completion of this descriptor.
    pub const COMPLETED: u32 = 1 << 1;
    /// End of packet (streaming only).
    pub const EOP: u32 = 1 << 4;
}

/// One scatter/gather descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Descriptor {
    /// Control flags (see [`flags`]).
    pub flags: u32,
    /// Number of descriptors adjacent to the next one.
    pub next_adjacent: u32,
    /// Byte length.
    pub len: u32,
    /// Source bus address.
    pub src: u64,
    /// Destination bus address.
    pub dst: u64,
    /// Next descriptor bus address (0 terminates the chain).
    pub next: u64,
}

impl Descriptor {
    /// Control word including the magic.
    #[must_use]
    pub const fn control(&self) -> u32 {
        (DESC_MAGIC << 16) | ((self.next_adjacent & MAX_ADJACENT) << 8) | (self.flags & 0xFF)
    }

    /// Encode into the hardware layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; DESC_SIZE] {
        let mut out = [0u8; DESC_SIZE];
        out[0..4].copy_from_slice(&self.control().to_le_bytes());
        out[4..8].copy_from_slice(&(self.len & DESC_MAX_LEN).to_le_bytes());
        out[8..16].copy_from_slice(&self.src.to_le_bytes());
        out[16..24].copy_from_slice(&self.dst.to_le_bytes());
        out[24..32].copy_from_slice(&self.next.to_le_bytes());
        out
    }

    /// Decode from the hardware layout. Returns `None` when the magic is wrong.
    #[must_use]
    pub fn from_bytes(raw: &[u8; DESC_SIZE]) -> Option<Self> {
        let control = le32(raw, 0);
        if control >> 16 != DESC_MAGIC {
            return None;
        }
        Some(Self {
            flags: control & 0xFF,
            next_adjacent: (control >> 8) & MAX_ADJACENT,
            len: le32(raw, 4) & DESC_MAX_LEN,
            src: le64(raw, 8),
            dst: le64(raw, 16),
            next: le64(raw, 24),
        })
    }

    /// Whether the STOP flag is set.
    #[must_use]
    pub const fn is_stop(&self) -> bool {
        self.flags & flags::STOP != 0
    }

    /// Whether the COMPLETED flag is set.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.flags & flags::COMPLETED != 0
    }
}

/// Size of one streaming write-back slot.
pub const WB_SIZE: usize = 16;

/// Write-back status magic in bits 31:16.
pub const WB_MAGIC: u32 = 0x52B4;

/// End-of-packet flag in the write-back status.
pub const WB_EOP: u32 = 1 << 0;

/// Result the C2H streaming engine writes for each completed descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamWriteback {
    /// End of packet reached in this block.
    pub eop: bool,
    /// Bytes written into the block.
    pub len: u32,
}

impl StreamWriteback {
    /// Encode into a write-back slot.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; WB_SIZE] {
        let mut out = [0u8; WB_SIZE];
        let status = (WB_MAGIC << 16) | u32::from(self.eop);
        out[0..4].copy_from_slice(&status.to_le_bytes());
        out[4..8].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    /// Decode a write-back slot. Returns `None` until the engine has written it.
    #[must_use]
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < 8 {
            return None;
        }
        let status = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if status >> 16 != WB_MAGIC {
            return None;
        }
        Some(Self {
            eop: status & WB_EOP != 0,
            len: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        })
    }
}

fn le32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

fn le64(raw: &[u8], at: usize) -> u64 {
    u64::from(le32(raw, at)) | (u64::from(le32(raw, at + 4)) << 32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_word_layout() {
        let d = Descriptor {
            flags: flags::STOP | flags::COMPLETED,
            next_adjacent: 3,
            ..Descriptor::default()
        };
        assert_eq!(d.control(), 0xAD4B_0303);
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut raw = Descriptor::default().to_bytes();
        raw[3] = 0x00;
        assert!(Descriptor::from_bytes(&raw).is_none());
    }

    #[test]
    fn encoded_fields_land_at_hardware_offsets() {
        let d = Descriptor {
            flags: flags::EOP,
            next_adjacent: 0,
            len: 0x1234,
            src: 0x1_0000_2000,
            dst: 0x40,
            next: 0xFEED_0000,
        };
        let raw = d.to_bytes();
        assert_eq!(&raw[4..8], &0x1234u32.to_le_bytes());
        assert_eq!(&raw[8..16], &0x1_0000_2000u64.to_le_bytes());
        assert_eq!(Descriptor::from_bytes(&raw), Some(d));
    }

    #[test]
    fn writeback_needs_magic() {
        assert!(StreamWriteback::from_bytes(&[0u8; WB_SIZE]).is_none());
        let wb = StreamWriteback { eop: true, len: 4096 };
        assert_eq!(StreamWriteback::from_bytes(&wb.to_bytes()), Some(wb));
    }
}
