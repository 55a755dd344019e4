//! Error types for test-bench operations.

use thiserror::Error;

/// Result type alias for bench operations.
pub type Result<T> = std::result::Result<T, BenchError>;

/// Error types for test-box communication and sequencing.
#[derive(Error, Debug)]
pub enum BenchError {
    /// Address or data byte not acknowledged; the device is absent, the
    /// battery has been pulled, or the bus is faulted.
    #[error("no device at bus address {address:#04x}")]
    NoDevice {
        /// Bus address of the device that did not acknowledge
        address: u8,
    },

    /// Transfer completed with a controller status other than idle
    #[error("bus transfer failed at address {address:#04x} (status {status:#04x})")]
    Transfer {
        /// Bus address of the device involved in the transfer
        address: u8,
        /// Raw controller status word
        status: u8,
    },

    /// Register address not present in the device's register map
    #[error("invalid register address: {address:#04x}")]
    InvalidRegister {
        /// Register address that was not found
        address: u8,
    },

    /// Write attempted on a read-only register
    #[error("register {address:#04x} is read only")]
    ReadOnly {
        /// Register address the write was aimed at
        address: u8,
    },

    /// Attempted to enable charge and discharge outputs at the same time
    #[error("cannot enable charge and discharge simultaneously")]
    MutualExclusion,

    /// Value does not fit the target register
    #[error("value out of range for register: {value:#06x}")]
    ValueOutOfRange {
        /// Offending value
        value: u32,
    },

    /// General I/O error (durable log persistence)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
