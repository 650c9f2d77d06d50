//! Mapped BARs and the register-window access path
//!
//! Control, user and bypass nodes read and write their BAR directly. Every
//! request is validated before the hardware is touched, then copied with the
//! widest access that divides both the length and the offset.

use crate::discovery::BarLayout;
use crate::error::{Result, XdmaError};
use crate::mmio::Mmio;
use crate::platform::MemoryResource;
use std::sync::Arc;
use xdma_chip::regs::IpVersion;

/// Register access width chosen for a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    /// 32-bit accesses.
    Word,
    /// 16-bit accesses.
    Half,
    /// 8-bit accesses.
    Byte,
}

impl AccessWidth {
    /// Widest width that divides both `offset` and `len`.
    pub const fn for_request(offset: usize, len: usize) -> Self {
        if len % 4 == 0 && offset % 4 == 0 {
            Self::Word
        } else if len % 2 == 0 && offset % 2 == 0 {
            Self::Half
        } else {
            Self::Byte
        }
    }

    /// Bytes per access.
    pub const fn bytes(self) -> usize {
        match self {
            Self::Word => 4,
            Self::Half => 2,
            Self::Byte => 1,
        }
    }
}

/// Mapped BARs of one device
#[derive(Debug)]
pub struct Bars {
    regions: Vec<Arc<dyn Mmio>>,
    resources: Vec<MemoryResource>,
    layout: BarLayout,
    version: IpVersion,
}

impl Bars {
    pub(crate) fn new(
        regions: Vec<Arc<dyn Mmio>>,
        resources: Vec<MemoryResource>,
        layout: BarLayout,
        version: IpVersion,
    ) -> Self {
        Self {
            regions,
            resources,
            layout,
            version,
        }
    }

    /// Layout found by discovery.
    pub const fn layout(&self) -> BarLayout {
        self.layout
    }

    /// IP release of the config block.
    pub const fn ip_version(&self) -> IpVersion {
        self.version
    }

    /// Bus resources behind the mapped BARs.
    pub fn resources(&self) -> &[MemoryResource] {
        &self.resources
    }

    /// The config BAR.
    pub fn config(&self) -> &Arc<dyn Mmio> {
        &self.regions[self.layout.config]
    }

    /// Mapped BAR by index.
    pub fn region(&self, index: usize) -> Option<&Arc<dyn Mmio>> {
        self.regions.get(index)
    }

    /// Reject requests that would touch nothing or fall outside the BAR.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for a zero length, an unknown BAR, or a range
    /// whose end reaches the BAR length.
    pub fn validate(&self, index: usize, offset: usize, len: usize) -> Result<&Arc<dyn Mmio>> {
        if len == 0 {
            return Err(XdmaError::invalid_request("zero-length BAR access"));
        }
        let region = self.regions.get(index).ok_or_else(|| {
            XdmaError::invalid_request(format!(
                "BAR{index} does not exist ({} mapped)",
                self.regions.len()
            ))
        })?;
        match offset.checked_add(len) {
            Some(end) if end < region.len() => Ok(region),
            _ => Err(XdmaError::invalid_request(format!(
                "BAR{index} access {offset:#x}+{len:#x} exceeds length {:#x}",
                region.len()
            ))),
        }
    }

    /// Copy from BAR `index` at `offset` into `buf`.
    ///
    /// # Errors
    ///
    /// See [`Bars::validate`].
    pub fn read(&self, index: usize, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let region = self.validate(index, offset, buf.len())?;
        let width = AccessWidth::for_request(offset, buf.len());
        tracing::trace!("BAR{index} read {offset:#x}+{:#x} as {width:?}", buf.len());

        for (i, chunk) in buf.chunks_exact_mut(width.bytes()).enumerate() {
            let at = offset + i * width.bytes();
            match width {
                AccessWidth::Word => chunk.copy_from_slice(&region.read32(at).to_le_bytes()),
                AccessWidth::Half => chunk.copy_from_slice(&region.read16(at).to_le_bytes()),
                AccessWidth::Byte => chunk[0] = region.read8(at),
            }
        }
        Ok(buf.len())
    }

    /// Copy `data` into BAR `index` at `offset`.
    ///
    /// # Errors
    ///
    /// See [`Bars::validate`].
    pub fn write(&self, index: usize, offset: usize, data: &[u8]) -> Result<usize> {
        let region = self.validate(index, offset, data.len())?;
        let width = AccessWidth::for_request(offset, data.len());
        tracing::trace!("BAR{index} write {offset:#x}+{:#x} as {width:?}", data.len());

        for (i, chunk) in data.chunks_exact(width.bytes()).enumerate() {
            let at = offset + i * width.bytes();
            match width {
                AccessWidth::Word => {
                    let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    region.write32(at, word);
                }
                AccessWidth::Half => region.write16(at, u16::from_le_bytes([chunk[0], chunk[1]])),
                AccessWidth::Byte => region.write8(at, chunk[0]),
            }
        }
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::derive_layout;
    use crate::mmio::RamRegion;

    fn bars() -> Bars {
        let regions: Vec<Arc<dyn Mmio>> = vec![Arc::new(RamRegion::new(0x100))];
        Bars::new(regions, Vec::new(), derive_layout(1, 0), IpVersion::TARGET)
    }

    #[test]
    fn width_selection() {
        assert_eq!(AccessWidth::for_request(0, 8), AccessWidth::Word);
        assert_eq!(AccessWidth::for_request(0, 6), AccessWidth::Half);
        assert_eq!(AccessWidth::for_request(2, 8), AccessWidth::Half);
        assert_eq!(AccessWidth::for_request(0, 3), AccessWidth::Byte);
        assert_eq!(AccessWidth::for_request(1, 4), AccessWidth::Byte);
    }

    #[test]
    fn rejects_out_of_range() {
        let b = bars();
        for (offset, len) in [(0, 0), (0x10, 0), (0, 0x100), (0xFC, 4), (0xFF, 1), (usize::MAX, 2)] {
            assert!(
                matches!(b.validate(0, offset, len), Err(XdmaError::InvalidRequest { .. })),
                "offset={offset:#x} len={len:#x}"
            );
        }
        assert!(b.validate(1, 0, 4).is_err());
        assert!(b.validate(0, 0xF8, 4).is_ok());
    }

    #[test]
    fn copies_round_trip_at_every_width() {
        let b = bars();
        b.write(0, 0x10, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        b.write(0, 0x22, &[9, 10]).unwrap();
        b.write(0, 0x31, &[11, 12, 13]).unwrap();

        let mut out = [0u8; 8];
        b.read(0, 0x10, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
        let mut half = [0u8; 2];
        b.read(0, 0x22, &mut half).unwrap();
        assert_eq!(half, [9, 10]);
        let mut odd = [0u8; 3];
        b.read(0, 0x31, &mut odd).unwrap();
        assert_eq!(odd, [11, 12, 13]);
    }
}
