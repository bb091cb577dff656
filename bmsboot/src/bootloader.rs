//! Command/framing engine for the serial bootloader.
//!
//! Every exchange follows the same shape: the command phase is sent and
//! acknowledged, then each parameter group (address, length, data) is sent
//! only after the previous group was acknowledged. A NACK or any unexpected
//! byte ends the exchange with the error matching the phase.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use bmsboot::{Bootloader, NativeConnector, ProtocolConfig, SerialConfig, Transport};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Transport::new(Arc::new(NativeConnector), SerialConfig::default());
//!     let mut bootloader = Bootloader::new(transport, ProtocolConfig::default());
//!
//!     bootloader.open("/dev/ttyUSB0")?;
//!     let identity = bootloader.initialize()?;
//!     println!("Ver: {}, PID: 0x{:04X}", identity.version, identity.product_id);
//!
//!     let data = bootloader.read(0x0800_0000, 16)?;
//!     println!("{data:02X?}");
//!     Ok(())
//! }
//! ```

use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::cipher::{CHALLENGE_LEN, answer_challenge};
use crate::protocol::command::{
    ACK, CapabilitySet, CommandCode, DeviceCommunicationCommand, DeviceIdentity, EraseMode,
    ExtendedEraseMode, Generation, MAX_TRANSFER, ResponseCode, Version,
};
use crate::transport::Transport;

/// Length of the GET_ID reply as declared by the device (length byte + 2).
const GET_ID_REPLY_LEN: usize = 3;

/// Maximum number of attempts for a write frame.
pub const DEFAULT_WRITE_RETRIES: usize = 3;

/// ACK timeout after a write data phase.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(2000);

/// ACK timeout after an erase parameter phase.
pub const DEFAULT_ERASE_TIMEOUT: Duration = Duration::from_millis(2000);

/// ACK timeout after the authorization response.
pub const DEFAULT_AUTHORIZE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Settle delay between the wake byte and a device communication frame.
pub const DEFAULT_WAKE_DELAY: Duration = Duration::from_millis(50);

/// Time given to the bootloader to start after the jump command.
pub const DEFAULT_BOOTLOADER_START_DELAY: Duration = Duration::from_millis(500);

/// Time given to the application to start after GO.
pub const DEFAULT_APP_START_DELAY: Duration = Duration::from_millis(1000);

/// Tunable protocol parameters.
///
/// The retry count and timeouts were measured on the target device; they
/// are not mandated by the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProtocolConfig {
    /// Wire format generation.
    pub generation: Generation,
    /// Attempts for a write frame before `DataRejected`.
    pub write_retries: usize,
    /// ACK timeout after write data.
    pub write_timeout: Duration,
    /// ACK timeout after erase parameters.
    pub erase_timeout: Duration,
    /// ACK timeout after the authorization response.
    pub authorize_timeout: Duration,
    /// Delay after the wake byte.
    pub wake_delay: Duration,
    /// Wait after jumping to the bootloader, before the port is reopened.
    pub bootloader_start_delay: Duration,
    /// Wait after jumping to the application.
    pub app_start_delay: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            generation: Generation::default(),
            write_retries: DEFAULT_WRITE_RETRIES,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            erase_timeout: DEFAULT_ERASE_TIMEOUT,
            authorize_timeout: DEFAULT_AUTHORIZE_TIMEOUT,
            wake_delay: DEFAULT_WAKE_DELAY,
            bootloader_start_delay: DEFAULT_BOOTLOADER_START_DELAY,
            app_start_delay: DEFAULT_APP_START_DELAY,
        }
    }
}

impl ProtocolConfig {
    /// Set the wire format generation.
    #[must_use]
    pub fn with_generation(mut self, generation: Generation) -> Self {
        self.generation = generation;
        self
    }

    /// Set the number of write attempts.
    #[must_use]
    pub fn with_write_retries(mut self, retries: usize) -> Self {
        self.write_retries = retries;
        self
    }
}

/// Bootloader command engine.
///
/// Owns the transport and the capability set reported by the device.
pub struct Bootloader {
    transport: Transport,
    config: ProtocolConfig,
    capabilities: CapabilitySet,
    version: Option<Version>,
    product_id: Option<u16>,
}

impl Bootloader {
    /// Create an engine over a (usually closed) transport.
    pub fn new(transport: Transport, config: ProtocolConfig) -> Self {
        Self {
            transport,
            config,
            capabilities: CapabilitySet::default(),
            version: None,
            product_id: None,
        }
    }

    /// Protocol parameters.
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Underlying transport.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Mutable access to the underlying transport.
    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    /// Open a port and start a new session.
    pub fn open(&mut self, port_name: &str) -> Result<()> {
        self.reset_session();
        self.transport.open(port_name)
    }

    /// Reopen the last port and start a new session.
    pub fn reopen(&mut self) -> Result<()> {
        self.reset_session();
        self.transport.reopen()
    }

    /// Close the port. No-op if closed.
    pub fn close(&mut self) -> Result<()> {
        self.transport.close()
    }

    /// Whether the port is open.
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    fn reset_session(&mut self) {
        self.capabilities.clear();
        self.version = None;
        self.product_id = None;
    }

    /// Capabilities reported by the last GET.
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Identity, once both GET and GET_ID succeeded in this session.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        Some(DeviceIdentity {
            version: self.version?,
            product_id: self.product_id?,
        })
    }

    /// Whether `code` may be dispatched now.
    pub fn supports(&self, code: CommandCode) -> bool {
        self.transport.is_open() && self.capabilities.supports(code)
    }

    fn require(&self, code: CommandCode) -> Result<()> {
        if self.supports(code) {
            Ok(())
        } else {
            Err(Error::CommandNotSupported(code))
        }
    }

    /// Read one reply byte and fail with `rejected` unless it is an ACK.
    fn expect_ack(&mut self, rejected: Error) -> Result<()> {
        let byte = self.transport.read_byte()?;
        match ResponseCode::from(byte) {
            ResponseCode::Ack => Ok(()),
            ResponseCode::Nack => {
                debug!("NACK: {rejected}");
                Err(rejected)
            },
            ResponseCode::Other(b) => {
                debug!("Unexpected reply 0x{b:02X}: {rejected}");
                Err(rejected)
            },
        }
    }

    fn send_command(&mut self, code: CommandCode) -> Result<()> {
        trace!("Sending {code}");
        let frame = self.config.generation.command_frame(code);
        self.transport.write(&frame)?;
        self.expect_ack(Error::CommandRejected(code))
    }

    fn send_address(&mut self, address: u32) -> Result<()> {
        let frame = self.config.generation.frame(&address.to_be_bytes());
        self.transport.write(&frame)?;
        self.expect_ack(Error::AddressRejected)
    }

    /// Send an erase parameter group and wait for the slow ACK.
    fn send_erase_parameters(&mut self, group: &[u8]) -> Result<()> {
        let frame = self.config.generation.frame(group);
        let timeout = self.config.erase_timeout;
        self.transport.write(&frame)?;
        self.transport
            .with_timeout(timeout, |t| t.read_byte())
            .and_then(|b| {
                if b == ACK {
                    Ok(())
                } else {
                    debug!("Erase parameters rejected: 0x{b:02X}");
                    Err(Error::AddressRejected)
                }
            })
    }

    fn read_trailing_ack(&mut self, code: CommandCode) -> Result<()> {
        if self.config.generation.trailing_ack() {
            self.expect_ack(Error::CommandRejected(code))?;
        }
        Ok(())
    }

    /// GET: bootloader version and supported commands.
    pub fn get(&mut self) -> Result<&CapabilitySet> {
        self.send_command(CommandCode::Get)?;

        let declared = usize::from(self.transport.read_byte()?) + 2;
        let expected = self.config.generation.get_reply_len();
        if declared != expected {
            return Err(Error::InvalidLength {
                expected,
                actual: declared,
            });
        }

        // Version byte followed by the command list
        let reply = self.transport.read_exact(declared - 1)?;
        self.read_trailing_ack(CommandCode::Get)?;

        let version = Version::from(reply[0]);
        self.capabilities = CapabilitySet::from_bytes(&reply[1..]);
        self.version = Some(version);
        debug!(
            "Bootloader {version}, commands: {:?}",
            self.capabilities
                .commands()
                .map(CommandCode::name)
                .collect::<Vec<_>>()
        );
        Ok(&self.capabilities)
    }

    /// GET_ID: 16-bit product id.
    pub fn get_id(&mut self) -> Result<u16> {
        self.send_command(CommandCode::GetId)?;

        let declared = usize::from(self.transport.read_byte()?) + 2;
        if declared != GET_ID_REPLY_LEN {
            return Err(Error::InvalidLength {
                expected: GET_ID_REPLY_LEN,
                actual: declared,
            });
        }

        let reply = self.transport.read_exact(declared - 1)?;
        self.read_trailing_ack(CommandCode::GetId)?;

        let pid = BigEndian::read_u16(&reply);
        self.product_id = Some(pid);
        debug!("Product id 0x{pid:04X}");
        Ok(pid)
    }

    /// Identify the device: GET, then GET_ID if supported.
    pub fn initialize(&mut self) -> Result<DeviceIdentity> {
        self.get()?;
        self.require(CommandCode::GetId)?;
        let product_id = self.get_id()?;
        Ok(DeviceIdentity {
            version: self.version.unwrap_or_default(),
            product_id,
        })
    }

    /// READ: `length` (1..=256) bytes from `address`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn read(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        self.require(CommandCode::Read)?;
        check_transfer_len(length)?;

        self.send_command(CommandCode::Read)?;
        self.send_address(address)?;
        self.transport.flush()?;

        // Checked above: 1..=256 fits after subtracting one
        let n = (length - 1) as u8;
        let frame = self.config.generation.frame(&[n]);
        self.transport.write(&frame)?;
        self.expect_ack(Error::SizeRejected)?;

        self.transport.read_exact(length)
    }

    /// WRITE: up to 256 bytes at `address`, retrying the whole frame when the
    /// data phase is not acknowledged.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.require(CommandCode::Write)?;
        check_transfer_len(data.len())?;

        let generation = self.config.generation;
        let n = (data.len() - 1) as u8;
        let mut payload = Vec::with_capacity(data.len() + 3);
        payload.push(n);
        payload.extend_from_slice(data);
        payload.extend(generation.checksum_with_preceding(n, data));

        let retries = self.config.write_retries.max(1);
        let timeout = self.config.write_timeout;
        for attempt in 1..=retries {
            self.send_command(CommandCode::Write)?;
            self.send_address(address)?;
            self.transport.write(&payload)?;

            let reply = self.transport.with_timeout(timeout, |t| t.read_byte())?;
            if reply == ACK {
                if attempt > 1 {
                    debug!("Write to 0x{address:08X} accepted on attempt {attempt}");
                }
                return Ok(());
            }
            warn!(
                "Write to 0x{address:08X} not acknowledged (attempt {attempt}/{retries}): 0x{reply:02X}"
            );
        }

        Err(Error::DataRejected)
    }

    /// GO: jump to `address`. The device leaves the bootloader after the
    /// address ACK.
    pub fn go(&mut self, address: u32) -> Result<()> {
        self.require(CommandCode::Go)?;
        self.send_command(CommandCode::Go)?;
        self.send_address(address)
    }

    /// ERASE a single page.
    pub fn erase(&mut self, page: u8) -> Result<()> {
        self.require(CommandCode::Erase)?;
        self.send_command(CommandCode::Erase)?;
        self.send_erase_parameters(&[0x00, page])
    }

    /// ERASE with a special selector.
    pub fn erase_special(&mut self, mode: EraseMode) -> Result<()> {
        self.require(CommandCode::Erase)?;
        self.send_command(CommandCode::Erase)?;
        self.send_erase_parameters(&[mode as u8])
    }

    /// EXT_ERASE a single page.
    pub fn extended_erase(&mut self, page: u16) -> Result<()> {
        self.require(CommandCode::ExtendedErase)?;
        self.send_command(CommandCode::ExtendedErase)?;
        let [hi, lo] = page.to_be_bytes();
        self.send_erase_parameters(&[0x00, 0x00, hi, lo])
    }

    /// EXT_ERASE with a special selector.
    pub fn extended_erase_special(&mut self, mode: ExtendedEraseMode) -> Result<()> {
        self.require(CommandCode::ExtendedErase)?;
        self.send_command(CommandCode::ExtendedErase)?;
        self.send_erase_parameters(&(mode as u16).to_be_bytes())
    }

    fn unprotect(&mut self, code: CommandCode) -> Result<()> {
        self.require(code)?;
        self.send_command(code)?;
        for _ in 1..self.config.generation.unprotect_acks() {
            self.expect_ack(Error::CommandRejected(code))?;
        }
        Ok(())
    }

    /// WR_UNPROTECT: remove write protection from all sectors.
    pub fn write_unprotect(&mut self) -> Result<()> {
        self.unprotect(CommandCode::WriteUnprotect)
    }

    /// RD_UNPROTECT: remove read protection (the device mass-erases).
    pub fn read_unprotect(&mut self) -> Result<()> {
        self.unprotect(CommandCode::ReadUnprotect)
    }

    /// Challenge-response authorization.
    ///
    /// The device sends a random value encrypted with its own key; the host
    /// proves it knows both key pairs by returning the value encrypted with
    /// the host key.
    pub fn authorize(&mut self) -> Result<()> {
        let code = CommandCode::Randomize;
        self.send_command(code)?;

        let mut challenge = [0u8; CHALLENGE_LEN];
        challenge.copy_from_slice(&self.transport.read_exact(CHALLENGE_LEN)?);
        let response = answer_challenge(&challenge);

        let frame = self.config.generation.frame(&response);
        self.transport.write(&frame)?;

        let timeout = self.config.authorize_timeout;
        let reply = self.transport.with_timeout(timeout, |t| t.read_byte())?;
        if reply != ACK {
            debug!("Authorization refused: 0x{reply:02X}");
            return Err(Error::CommandRejected(code));
        }

        info!("Authorized");
        Ok(())
    }

    /// Wake the application firmware and send a mode command.
    pub fn send_device_communication_command(
        &mut self,
        command: DeviceCommunicationCommand,
    ) -> Result<()> {
        trace!("Sending {command:?}");
        self.transport
            .write(&[DeviceCommunicationCommand::WAKE_BYTE])?;
        thread::sleep(self.config.wake_delay);
        self.transport.write(&command.frame())?;

        let reply = self.transport.read_byte()?;
        if reply != DeviceCommunicationCommand::RESPONSE_OK {
            return Err(Error::BadResponse(reply));
        }
        Ok(())
    }
}

fn check_transfer_len(length: usize) -> Result<()> {
    if length == 0 || length > MAX_TRANSFER {
        return Err(Error::Config(format!(
            "transfer length {length} outside 1..={MAX_TRANSFER}"
        )));
    }
    Ok(())
}
