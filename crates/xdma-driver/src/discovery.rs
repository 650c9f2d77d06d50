//! BAR and capability discovery
//!
//! Runs once at attach. Every memory BAR the bus reports is mapped; the
//! config BAR is the first one whose IRQ block and config block both carry
//! the subsystem magic. User and bypass BARs are positional:
//!
//! ```text
//! BARs  config  user  bypass
//!  1      0      -      -
//!  2      0      -      1
//!  2      1      0      -
//!  3      1      0      2
//! ```

use crate::bar::Bars;
use crate::error::{Result, XdmaError};
use crate::mmio::Mmio;
use crate::platform::Platform;
use std::sync::Arc;
use xdma_chip::regs::{self, Identifier, IpVersion};
use xdma_chip::MAX_BARS;

/// Which mapped BAR serves which function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarLayout {
    /// Number of mapped BARs.
    pub count: usize,
    /// DMA config BAR.
    pub config: usize,
    /// User logic BAR.
    pub user: Option<usize>,
    /// DMA bypass BAR.
    pub bypass: Option<usize>,
}

/// Positional user/bypass derivation for a config BAR at `config` of `count`.
pub const fn derive_layout(count: usize, config: usize) -> BarLayout {
    BarLayout {
        count,
        config,
        user: if config == 1 { Some(0) } else { None },
        bypass: if count - config == 2 {
            Some(count - 1)
        } else {
            None
        },
    }
}

/// Whether `region` holds the DMA config register space.
pub fn is_config_bar(region: &dyn Mmio) -> bool {
    if region.len() < regs::CONFIG_BLOCK_OFFSET + 4 {
        return false;
    }
    let irq_id = Identifier(region.read32(regs::IRQ_BLOCK_OFFSET + regs::irq::IDENTIFIER));
    let cfg_id = Identifier(region.read32(regs::CONFIG_BLOCK_OFFSET + regs::config::IDENTIFIER));
    tracing::trace!("Probe: irq id {:#010x}, config id {:#010x}", irq_id.0, cfg_id.0);
    irq_id.is_xdma() && cfg_id.is_xdma()
}

/// Locate the config BAR among mapped regions and derive the layout.
///
/// # Errors
///
/// Returns a configuration error if no region carries the identifiers.
pub fn identify(regions: &[Arc<dyn Mmio>]) -> Result<BarLayout> {
    let config = regions
        .iter()
        .position(|r| is_config_bar(r.as_ref()))
        .ok_or_else(|| {
            XdmaError::configuration(format!(
                "None of {} BARs carries the DMA config identifiers",
                regions.len()
            ))
        })?;

    let layout = derive_layout(regions.len(), config);
    tracing::info!(
        "BAR layout: config={}, user={:?}, bypass={:?} ({} mapped)",
        layout.config,
        layout.user,
        layout.bypass,
        layout.count
    );
    Ok(layout)
}

/// IP release read from the config block identifier.
pub fn ip_version(config: &dyn Mmio) -> IpVersion {
    let id = Identifier(config.read32(regs::CONFIG_BLOCK_OFFSET + regs::config::IDENTIFIER));
    IpVersion::from_raw(id.version())
}

/// Map every memory BAR of `platform` and identify the layout.
///
/// An IP version other than [`IpVersion::TARGET`] is logged, not refused.
///
/// # Errors
///
/// Returns a configuration error if the platform reports no memory BARs, a
/// mapping fails, or no config BAR is found.
pub fn map_bars(platform: &dyn Platform) -> Result<Bars> {
    let mut resources = platform.memory_resources()?;
    if resources.is_empty() {
        return Err(XdmaError::configuration("No memory BARs"));
    }
    if resources.len() > MAX_BARS {
        tracing::warn!(
            "{} memory BARs reported, using the first {MAX_BARS}",
            resources.len()
        );
        resources.truncate(MAX_BARS);
    }

    let regions = resources
        .iter()
        .map(|res| {
            tracing::debug!("BAR{}: start={:#x}, len={:#x}", res.bar, res.start, res.len);
            platform.map(res)
        })
        .collect::<Result<Vec<_>>>()?;

    let layout = identify(&regions)?;

    let version = ip_version(regions[layout.config].as_ref());
    if version == IpVersion::TARGET {
        tracing::info!("IP version {version:?}");
    } else {
        tracing::warn!(
            "IP version {version:?} differs from {:?}; continuing",
            IpVersion::TARGET
        );
    }

    Ok(Bars::new(regions, resources, layout, version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmio::RamRegion;

    #[test]
    fn positional_layouts() {
        assert_eq!(
            derive_layout(3, 1),
            BarLayout {
                count: 3,
                config: 1,
                user: Some(0),
                bypass: Some(2)
            }
        );
        assert_eq!(derive_layout(1, 0).user, None);
        assert_eq!(derive_layout(1, 0).bypass, None);
        assert_eq!(derive_layout(2, 0).bypass, Some(1));
        assert_eq!(derive_layout(2, 1).bypass, None);
        assert_eq!(derive_layout(2, 1).user, Some(0));
        assert_eq!(derive_layout(3, 2).user, None);
    }

    fn region_with_ids(irq: u32, cfg: u32) -> Arc<dyn Mmio> {
        let r = RamRegion::new(regs::CONFIG_BAR_MIN_SIZE);
        r.write32(regs::IRQ_BLOCK_OFFSET, irq);
        r.write32(regs::CONFIG_BLOCK_OFFSET, cfg);
        Arc::new(r)
    }

    #[test]
    fn both_identifiers_required() {
        let good = Identifier::new(regs::target::IRQ, false, 0, 6).0;
        let cfg = Identifier::new(regs::target::CONFIG, false, 0, 6).0;

        let regions = vec![
            region_with_ids(good, 0),
            region_with_ids(0, cfg),
            region_with_ids(good, cfg),
        ];
        let layout = identify(&regions).unwrap();
        assert_eq!(layout.config, 2);
        assert_eq!(layout.user, None);
        assert_eq!(ip_version(regions[2].as_ref()), IpVersion::V2017_1);
    }

    #[test]
    fn no_config_bar_is_fatal() {
        let regions: Vec<Arc<dyn Mmio>> =
            vec![Arc::new(RamRegion::new(0x8000)), Arc::new(RamRegion::new(0x100))];
        assert!(matches!(
            identify(&regions),
            Err(XdmaError::Configuration { .. })
        ));
    }
}
