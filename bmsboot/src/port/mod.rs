//! Port abstraction for serial communication.
//!
//! The bootloader engine never talks to the `serialport` crate directly.
//! It goes through two seams:
//!
//! - [`Port`]: an open byte stream with a configurable timeout.
//! - [`Connector`]: opens a [`Port`] from a [`SerialConfig`].
//!
//! ```text
//! +--------------------+
//! | Session Controller |
//! +---------+----------+
//!           |
//!           v
//! +---------+----------+      +------------------+
//! |     Transport      +----->+    Connector     |
//! | (open/close, exact |      | (NativeConnector)|
//! |  reads, timeouts)  |      +--------+---------+
//! +---------+----------+               |
//!           |                          v
//!           |                 +--------+---------+
//!           +---------------->+    Port trait    |
//!                             | (NativePort)     |
//!                             +------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use bmsboot::port::{Port, SerialConfig};
//!
//! fn example<P: Port>(port: &mut P) -> std::io::Result<()> {
//!     port.write_all(&[0x00, 0xFF, 0x00])?;
//!
//!     let mut buf = [0u8; 1];
//!     port.read_exact(&mut buf)?;
//!     println!("Received: 0x{:02X}", buf[0]);
//!
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Default baud rate of the bootloader link.
pub const DEFAULT_BAUD: u32 = 38400;

/// Default per-session read timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Session-default read timeout.
    pub timeout: Duration,
    /// Data bits.
    pub data_bits: DataBits,
    /// Parity. The bootloader requires even parity.
    pub parity: Parity,
    /// Stop bits.
    pub stop_bits: StopBits,
    /// Flow control.
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: DEFAULT_TIMEOUT,
            data_bits: DataBits::Eight,
            parity: Parity::Even,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Same settings for a different port.
    #[must_use]
    pub fn for_port(&self, port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..self.clone()
        }
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    #[default]
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
}

/// Serial port information.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Product string (if available).
    pub product: Option<String>,
}

impl PortInfo {
    /// Port known only by name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            pid: None,
            product: None,
        }
    }
}

/// Open serial byte stream.
pub trait Port: Read + Write + Send {
    /// Set the read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Discard any buffered input and output.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

/// Opens ports for a [`Transport`](crate::transport::Transport).
///
/// Separated from [`Port`] so the session controller can reopen the link
/// between workflow steps and so tests can substitute an in-memory device.
pub trait Connector: Send + Sync {
    /// Open a port with the given configuration.
    fn connect(&self, config: &SerialConfig) -> Result<Box<dyn Port>>;

    /// List ports known to the platform.
    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        Ok(Vec::new())
    }
}

#[cfg(feature = "native")]
pub use native::{NativeConnector, NativePort};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_default() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 38400);
        assert_eq!(config.timeout, Duration::from_millis(100));
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.parity, Parity::Even);
        assert_eq!(config.stop_bits, StopBits::One);
        assert_eq!(config.flow_control, FlowControl::None);
    }

    #[test]
    fn test_serial_config_builder() {
        let config = SerialConfig::new("/dev/ttyUSB0", 115200).with_timeout(Duration::from_secs(5));

        assert_eq!(config.port_name, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.timeout, Duration::from_secs(5));

        let other = config.for_port("COM3");
        assert_eq!(other.port_name, "COM3");
        assert_eq!(other.baud_rate, 115200);
        assert_eq!(other.parity, Parity::Even);
    }
}
