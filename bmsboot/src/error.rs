//! Error types for bmsboot.

use std::io;
use thiserror::Error;

use crate::protocol::command::CommandCode;

/// Result type for bmsboot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for bmsboot operations.
///
/// Every protocol and transport failure is recoverable at the session
/// controller boundary: the workflow aborts, the port is closed and the
/// controller accepts the next workflow.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The transport is closed.
    #[error("Serial port is not open")]
    PortNotOpen,

    /// The device did not report support for the command.
    #[error("Command not supported: {0}")]
    CommandNotSupported(CommandCode),

    /// NACK or unexpected byte after the command phase.
    #[error("Command rejected: {0}")]
    CommandRejected(CommandCode),

    /// NACK or unexpected byte after the address (or page) phase.
    #[error("Address rejected")]
    AddressRejected,

    /// NACK or unexpected byte after the length phase.
    #[error("Size rejected")]
    SizeRejected,

    /// The data phase of a write was not acknowledged.
    #[error("Data rejected")]
    DataRejected,

    /// Reply length did not match the protocol generation.
    #[error("Invalid reply length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected total frame length.
        expected: usize,
        /// Length declared by the device.
        actual: usize,
    },

    /// No or incomplete reply within the active timeout.
    #[error("Read timeout: received {received} of {expected} bytes")]
    ReadTimeout {
        /// Number of bytes requested.
        expected: usize,
        /// Number of bytes received before the timeout.
        received: usize,
    },

    /// Wake/mode-switch acknowledgement mismatch.
    #[error("Bad device response: 0x{0:02X}")]
    BadResponse(u8),

    /// The chunk loop was stopped by a cancellation request.
    #[error("Operation cancelled")]
    OperationCancelled,

    /// Firmware image exceeds the addressable limit.
    #[error("Firmware file is too big: {size} bytes (max {max})")]
    FirmwareTooLarge {
        /// Image size in bytes.
        size: usize,
        /// Largest accepted image size.
        max: usize,
    },

    /// Read-back data differs from what was written.
    #[error("Verification failed at 0x{address:08X}")]
    VerificationFailed {
        /// First differing address.
        address: u32,
    },

    /// Neither the application nor the bootloader answered.
    #[error("No device detected")]
    DeviceNotFound,

    /// A workflow is already running.
    #[error("Bootloader is busy")]
    Busy,

    /// Invalid settings input.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A workflow panicked. The session stays usable.
    #[error("Workflow aborted: {0}")]
    WorkflowPanicked(String),
}

impl Error {
    /// Whether the error came from the device refusing a frame phase.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::CommandRejected(_)
                | Self::AddressRejected
                | Self::SizeRejected
                | Self::DataRejected
        )
    }
}
