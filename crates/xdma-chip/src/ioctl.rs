//! Control codes accepted on DMA device nodes.
//!
//! Codes follow the Windows `CTL_CODE` layout with device type `0x22`
//! (unknown), `METHOD_BUFFERED` and `FILE_ANY_ACCESS`, so the numeric values
//! are identical to those the vendor tools issue.

/// Device type field of every control code.
pub const DEVICE_TYPE: u32 = 0x22;

/// Build a buffered, any-access control code for `function`.
#[must_use]
pub const fn ctl_code(function: u32) -> u32 {
    (DEVICE_TYPE << 16) | (function << 2)
}

/// Clear and start the engine performance counters.
pub const PERF_START: u32 = ctl_code(1);
/// Read the performance counters (32-byte `PerfData`).
pub const PERF_GET: u32 = ctl_code(2);
/// Read the address mode (4-byte `u32`, 0 = increment, 1 = fixed).
pub const ADDRMODE_GET: u32 = ctl_code(3);
/// Set the address mode (4-byte `u32`, 0 = increment, 1 = fixed).
pub const ADDRMODE_SET: u32 = ctl_code(4);

/// Decoded control code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCode {
    /// [`PERF_START`]
    PerfStart,
    /// [`PERF_GET`]
    PerfGet,
    /// [`ADDRMODE_GET`]
    AddrModeGet,
    /// [`ADDRMODE_SET`]
    AddrModeSet,
}

impl ControlCode {
    /// Decode a raw code. Unknown codes return `None`.
    #[must_use]
    pub const fn from_raw(code: u32) -> Option<Self> {
        match code {
            PERF_START => Some(Self::PerfStart),
            PERF_GET => Some(Self::PerfGet),
            ADDRMODE_GET => Some(Self::AddrModeGet),
            ADDRMODE_SET => Some(Self::AddrModeSet),
            _ => None,
        }
    }

    /// Raw code value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        match self {
            Self::PerfStart => PERF_START,
            Self::PerfGet => PERF_GET,
            Self::AddrModeGet => ADDRMODE_GET,
            Self::AddrModeSet => ADDRMODE_SET,
        }
    }
}

/// Size of the `PERF_GET` output structure.
pub const PERF_DATA_SIZE: usize = 32;

/// Size of the `ADDRMODE_GET` / `ADDRMODE_SET` payload.
pub const ADDRMODE_SIZE: usize = 4;
