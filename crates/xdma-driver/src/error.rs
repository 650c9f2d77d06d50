//! Error types for XDMA driver operations

use thiserror::Error;

/// Result type alias for XDMA operations
pub type Result<T> = std::result::Result<T, XdmaError>;

/// Errors that can occur during XDMA operations
#[derive(Debug, Error)]
pub enum XdmaError {
    /// Device bring-up failed (no config BAR, mapping failure)
    #[error("Configuration error: {reason}")]
    Configuration {
        /// Reason for failure
        reason: String,
    },

    /// Node or parameter does not refer to anything the device exposes
    #[error("Invalid parameter: {reason}")]
    InvalidParameter {
        /// Reason for rejection
        reason: String,
    },

    /// Request rejected before touching hardware
    #[error("Invalid request: {reason}")]
    InvalidRequest {
        /// Reason for rejection
        reason: String,
    },

    /// Operation not supported by the node or platform
    #[error("Not supported: {what}")]
    NotSupported {
        /// Unsupported operation
        what: String,
    },

    /// Descriptor build failure or hardware-reported fault
    #[error("Transfer failed: {reason}")]
    TransferFailed {
        /// Reason for failure
        reason: String,
    },

    /// Request was cancelled
    #[error("Request cancelled")]
    Cancelled,

    /// Handle used after the device was released
    #[error("Device has been released")]
    DeviceGone,

    /// I/O error during device communication
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl XdmaError {
    /// Create a configuration error
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            reason: reason.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Create a not supported error
    pub fn not_supported(what: impl Into<String>) -> Self {
        Self::NotSupported { what: what.into() }
    }

    /// Create a transfer failed error
    pub fn transfer_failed(reason: impl Into<String>) -> Self {
        Self::TransferFailed {
            reason: reason.into(),
        }
    }

    /// Whether this error is the cancelled terminal status
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helpers_build_matching_variants() {
        assert!(matches!(
            XdmaError::invalid_request("zero length"),
            XdmaError::InvalidRequest { .. }
        ));
        assert!(XdmaError::Cancelled.is_cancelled());
        assert!(!XdmaError::transfer_failed("x").is_cancelled());
        assert_eq!(
            XdmaError::not_supported("ioctl 0x1").to_string(),
            "Not supported: ioctl 0x1"
        );
    }
}
