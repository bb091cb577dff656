//! Byte-stream transport for the bootloader link.
//!
//! Wraps a [`Connector`] and the currently open [`Port`]. Reads are
//! exact-length: a caller either receives every byte it asked for or a
//! [`Error::ReadTimeout`], never a short buffer.

use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::port::{Connector, Port, SerialConfig};

/// Open/close-able serial link with exact-length reads.
pub struct Transport {
    connector: Arc<dyn Connector>,
    config: SerialConfig,
    port: Option<Box<dyn Port>>,
}

impl Transport {
    /// Create a closed transport.
    ///
    /// `config` supplies everything except the port name, which is given to
    /// [`open`](Self::open).
    pub fn new(connector: Arc<dyn Connector>, config: SerialConfig) -> Self {
        Self {
            connector,
            config,
            port: None,
        }
    }

    /// Connector used to open ports.
    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// Serial settings applied on open.
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    /// Open `port_name` and discard anything already buffered.
    ///
    /// An already open port is closed first.
    pub fn open(&mut self, port_name: &str) -> Result<()> {
        self.close()?;

        self.config.port_name = port_name.to_string();
        let mut port = self.connector.connect(&self.config)?;
        port.clear_buffers()?;
        debug!(
            "Opened {} @ {} baud (timeout {:?})",
            port.name(),
            port.baud_rate(),
            port.timeout()
        );
        self.port = Some(port);
        Ok(())
    }

    /// Reopen the last opened port.
    pub fn reopen(&mut self) -> Result<()> {
        let name = self.config.port_name.clone();
        if name.is_empty() {
            return Err(Error::PortNotOpen);
        }
        self.open(&name)
    }

    /// Close the port. No-op if already closed.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut port) = self.port.take() {
            debug!("Closing {}", port.name());
            port.close()?;
        }
        Ok(())
    }

    /// Whether a port is currently open.
    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Name of the open port.
    pub fn port_name(&self) -> Option<&str> {
        self.port.as_deref().map(|p| p.name())
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn Port>> {
        self.port.as_mut().ok_or(Error::PortNotOpen)
    }

    /// Send all bytes.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        trace!("TX {}", hex(bytes));
        self.port_mut()?.write_all_bytes(bytes)
    }

    /// Receive exactly `n` bytes within the active timeout.
    pub fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let port = self.port_mut()?;
        let timeout = port.timeout();
        let start = Instant::now();

        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            match port.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(Error::ReadTimeout {
                        expected: n,
                        received: filled,
                    });
                },
                Ok(k) => filled += k,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    return Err(Error::ReadTimeout {
                        expected: n,
                        received: filled,
                    });
                },
                Err(e) => return Err(Error::Io(e)),
            }

            if filled < n && start.elapsed() >= timeout {
                return Err(Error::ReadTimeout {
                    expected: n,
                    received: filled,
                });
            }
        }

        trace!("RX {}", hex(&buf));
        Ok(buf)
    }

    /// Receive a single byte.
    pub fn read_byte(&mut self) -> Result<u8> {
        Ok(self.read_exact(1)?[0])
    }

    /// Flush pending output.
    pub fn flush(&mut self) -> Result<()> {
        std::io::Write::flush(self.port_mut()?)?;
        Ok(())
    }

    /// Active read timeout.
    pub fn timeout(&self) -> Duration {
        self.port
            .as_deref()
            .map_or(self.config.timeout, |p| p.timeout())
    }

    /// Change the read timeout of the open port.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.port_mut()?.set_timeout(timeout)
    }

    /// Run `f` with a temporary timeout, restoring the previous one even
    /// when `f` fails.
    pub fn with_timeout<T>(
        &mut self,
        timeout: Duration,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let previous = self.timeout();
        self.set_timeout(timeout)?;
        let result = f(self);
        let restored = self.set_timeout(previous);
        let value = result?;
        restored?;
        Ok(value)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Space-separated uppercase hex, for frame traces.
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
