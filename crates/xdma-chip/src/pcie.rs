//! PCIe identifiers for XDMA-based designs.
//!
//! The device ID is chosen by the FPGA designer in the IP customisation GUI;
//! the values below are the defaults of the Xilinx reference designs
//! (`0x9<gen><lanes>` for Gen1–Gen3, `0x7xxx` for 7-series example designs).

/// Xilinx PCI-SIG vendor ID.
pub const XILINX_VENDOR_ID: u16 = 0x10EE;

/// Default XDMA device IDs shipped with the reference designs.
pub const ALL_DEVICE_IDS: &[u16] = &[
    0x9011, 0x9012, 0x9014, 0x9018, 0x901F, // Gen1
    0x9021, 0x9022, 0x9024, 0x9028, 0x902F, // Gen2
    0x9031, 0x9032, 0x9034, 0x9038, 0x903F, // Gen3
    0x8011, 0x8012, 0x8014, 0x8018, 0x8021, 0x8022, 0x8024, 0x8028, // UltraScale+
    0x7011, 0x7012, 0x7014, 0x7018, 0x7021, 0x7022, 0x7024, 0x7028, // 7-series
    0x6828, 0x6830, 0x6928, 0x6930, 0x6A28, 0x6A30, 0x6D30,
    0x4808, 0x4828, 0x4908, 0x4A28, 0x4B28, 0x2808,
];

/// Returns `true` if `(vendor, device)` is a known XDMA reference design.
#[must_use]
pub fn is_xdma(vendor: u16, device: u16) -> bool {
    vendor == XILINX_VENDOR_ID && ALL_DEVICE_IDS.contains(&device)
}

/// `lspci -d` filter string for Xilinx devices.
#[must_use]
pub fn lspci_filter() -> String {
    format!("{XILINX_VENDOR_ID:04x}:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_ids() {
        assert!(is_xdma(0x10EE, 0x9038));
        assert!(!is_xdma(0x10EE, 0x0001));
        assert!(!is_xdma(0x1E7C, 0x9038));
        assert_eq!(lspci_filter(), "10ee:");
    }
}
