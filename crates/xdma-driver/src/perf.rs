//! Engine performance counters
//!
//! Hardware counts clock and data cycles while its monitor runs; the driver
//! adds the bytes and wall time of every completed transfer since the last
//! `PERF_START`.

use bytemuck::{Pod, Zeroable};
use std::time::Duration;

/// `PERF_GET` output, 32 bytes, native layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PerfData {
    /// Bytes moved by completed transfers.
    pub bytes: u64,
    /// Wall time spent in those transfers, nanoseconds.
    pub elapsed_ns: u64,
    /// Hardware clock cycles while the monitor ran.
    pub clock_cycles: u64,
    /// Hardware cycles that moved data.
    pub data_cycles: u64,
}

impl PerfData {
    /// Bytes per second over the measured transfers.
    pub fn throughput(&self) -> f64 {
        if self.elapsed_ns == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.bytes as f64 * 1e9 / self.elapsed_ns as f64;
        rate
    }

    /// Fraction of monitored cycles that carried data.
    pub fn efficiency(&self) -> f64 {
        if self.clock_cycles == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = self.data_cycles as f64 / self.clock_cycles as f64;
        ratio
    }

    /// Wire encoding for the control path.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Software half of the counters.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PerfAccumulator {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl PerfAccumulator {
    pub fn record(&mut self, bytes: usize, elapsed: Duration) {
        self.bytes += bytes as u64;
        self.elapsed += elapsed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_32_bytes() {
        assert_eq!(std::mem::size_of::<PerfData>(), xdma_chip::ioctl::PERF_DATA_SIZE);
    }

    #[test]
    fn derived_rates() {
        let p = PerfData {
            bytes: 1_000_000,
            elapsed_ns: 1_000_000,
            clock_cycles: 200,
            data_cycles: 150,
        };
        assert!((p.throughput() - 1e9).abs() < 1.0);
        assert!((p.efficiency() - 0.75).abs() < 1e-9);
        assert!(PerfData::default().throughput().abs() < f64::EPSILON);
    }

    #[test]
    fn accumulator_sums() {
        let mut acc = PerfAccumulator::default();
        acc.record(100, Duration::from_micros(3));
        acc.record(28, Duration::from_micros(1));
        assert_eq!(acc.bytes, 128);
        assert_eq!(acc.elapsed, Duration::from_micros(4));
    }
}
