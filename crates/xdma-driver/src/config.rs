//! Driver configuration
//!
//! Values that the host normally supplies from its parameter store. The
//! environment stands in for that store: `XDMA_POLL_MODE`,
//! `XDMA_WAIT_TIMEOUT_MS` and `XDMA_RING_BLOCKS`.

use std::time::Duration;

/// Poll-mode override key.
pub const ENV_POLL_MODE: &str = "XDMA_POLL_MODE";
/// Blocking wait bound key (milliseconds).
pub const ENV_WAIT_TIMEOUT_MS: &str = "XDMA_WAIT_TIMEOUT_MS";
/// Streaming ring block count key.
pub const ENV_RING_BLOCKS: &str = "XDMA_RING_BLOCKS";

/// Default bound for ring consume and event wait.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Driver-wide settings applied at attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Complete transfers by polling instead of interrupts (every engine).
    pub poll_mode: bool,
    /// Bound for streaming consume and user event wait.
    pub wait_timeout: Duration,
    /// Number of blocks in each streaming ring.
    pub ring_blocks: usize,
    /// Size of one streaming ring block in bytes.
    pub ring_block_size: usize,
    /// Largest single DMA request.
    pub max_transfer_size: usize,
    /// Status polls before a poll-mode transfer or engine stop gives up.
    pub poll_budget: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_mode: false,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            ring_blocks: 64,
            ring_block_size: 4096,
            max_transfer_size: 8 << 20,
            poll_budget: 10_000_000,
        }
    }
}

impl DriverConfig {
    /// Defaults overridden by whatever the environment provides.
    ///
    /// Malformed values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(raw) = lookup(ENV_POLL_MODE) {
            match parse_flag(&raw) {
                Some(v) => cfg.poll_mode = v,
                None => tracing::warn!("Ignoring {ENV_POLL_MODE}={raw:?}: expected 0/1"),
            }
        }

        if let Some(raw) = lookup(ENV_WAIT_TIMEOUT_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => cfg.wait_timeout = Duration::from_millis(ms),
                _ => tracing::warn!("Ignoring {ENV_WAIT_TIMEOUT_MS}={raw:?}"),
            }
        }

        if let Some(raw) = lookup(ENV_RING_BLOCKS) {
            match raw.trim().parse::<usize>() {
                Ok(n) if n >= 2 => cfg.ring_blocks = n,
                _ => tracing::warn!("Ignoring {ENV_RING_BLOCKS}={raw:?}: need at least 2"),
            }
        }

        cfg
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults() {
        let cfg = DriverConfig::default();
        assert!(!cfg.poll_mode);
        assert_eq!(cfg.wait_timeout, Duration::from_secs(3));
        assert_eq!(cfg.ring_blocks * cfg.ring_block_size, 256 * 1024);
    }

    #[test]
    fn overrides_apply() {
        let cfg = DriverConfig::from_lookup(lookup(&[
            (ENV_POLL_MODE, "1"),
            (ENV_WAIT_TIMEOUT_MS, "250"),
            (ENV_RING_BLOCKS, "8"),
        ]));
        assert!(cfg.poll_mode);
        assert_eq!(cfg.wait_timeout, Duration::from_millis(250));
        assert_eq!(cfg.ring_blocks, 8);
    }

    #[test]
    fn malformed_values_keep_defaults() {
        let cfg = DriverConfig::from_lookup(lookup(&[
            (ENV_POLL_MODE, "maybe"),
            (ENV_WAIT_TIMEOUT_MS, "-5"),
            (ENV_RING_BLOCKS, "1"),
        ]));
        assert_eq!(cfg, DriverConfig::default());
    }
}
