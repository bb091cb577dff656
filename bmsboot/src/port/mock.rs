//! In-memory port used by unit tests.
//!
//! Reads are served from a scripted queue and writes are captured. State is
//! shared so a test can inspect the traffic after the port has been handed to
//! a transport.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::port::{Connector, Port, PortInfo, SerialConfig};

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub read_buf: VecDeque<u8>,
    pub write_buf: Vec<u8>,
    /// Every timeout applied through `set_timeout`, in order.
    pub timeouts: Vec<Duration>,
    pub opens: usize,
    pub closes: usize,
    pub clears: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct MockPort {
    state: Arc<Mutex<MockState>>,
    name: String,
    timeout: Duration,
}

impl MockPort {
    pub fn new(response: &[u8]) -> Self {
        let port = Self {
            state: Arc::default(),
            name: "mock".to_string(),
            timeout: Duration::from_millis(100),
        };
        port.push(response);
        port
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn push(&self, bytes: &[u8]) {
        self.state().read_buf.extend(bytes.iter().copied());
    }

    pub fn written(&self) -> Vec<u8> {
        self.state().write_buf.clone()
    }

    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state().write_buf)
    }

    pub fn pending(&self) -> usize {
        self.state().read_buf.len()
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut state = self.state();
        if state.read_buf.is_empty() {
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.read_buf.len());
        for b in buf.iter_mut().take(n) {
            *b = state.read_buf.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.state().write_buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.state().timeouts.push(timeout);
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn baud_rate(&self) -> u32 {
        38400
    }

    fn clear_buffers(&mut self) -> Result<()> {
        // The scripted replies stand for bytes the device sends later
        self.state().clears += 1;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        self.state().closes += 1;
        Ok(())
    }
}

/// Hands out clones of one shared [`MockPort`].
#[derive(Debug, Clone)]
pub(crate) struct MockConnector {
    pub port: MockPort,
    /// Names that open successfully. Empty means every name opens.
    pub available: Vec<String>,
}

impl MockConnector {
    pub fn new(port: MockPort) -> Self {
        Self {
            port,
            available: Vec::new(),
        }
    }

    pub fn with_available(mut self, names: &[&str]) -> Self {
        self.available = names.iter().map(ToString::to_string).collect();
        self
    }
}

impl Connector for MockConnector {
    fn connect(&self, config: &SerialConfig) -> Result<Box<dyn Port>> {
        if !self.available.is_empty() && !self.available.contains(&config.port_name) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such port",
            )));
        }
        let mut port = self.port.clone();
        port.name.clone_from(&config.port_name);
        port.timeout = config.timeout;
        port.state().opens += 1;
        Ok(Box::new(port))
    }

    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        Ok(self.available.iter().map(PortInfo::named).collect())
    }
}
