//! Bootloader command codes, response codes and frame encoding.
//!
//! ## Frame Format (current generation)
//!
//! ```text
//! +---------+----------+     +-----+     +-----------------+----------+     +-----+
//! | command | CRC16 BE | --> | ACK | --> | parameter group | CRC16 BE | --> | ACK | ...
//! +---------+----------+     +-----+     +-----------------+----------+     +-----+
//! |  1 byte | 2 bytes  |                 |    variable     | 2 bytes  |
//! ```
//!
//! The legacy generation replaces every CRC-16 with a single XOR byte.

use std::collections::BTreeSet;
use std::fmt;

use crate::protocol::crc::{crc16, crc16_with_preceding, xor_checksum};

/// ACK byte.
pub const ACK: u8 = 0x79;

/// NACK byte.
pub const NACK: u8 = 0x1F;

/// Largest payload of a single read or write frame.
pub const MAX_TRANSFER: usize = 256;

/// Bootloader command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum CommandCode {
    /// Baud-rate detection byte.
    Init = 0x7F,
    /// Version and supported commands.
    Get = 0x00,
    /// Version and read protection status.
    GetProtection = 0x01,
    /// Product id.
    GetId = 0x02,
    /// Read up to 256 bytes.
    Read = 0x11,
    /// Jump to an address.
    Go = 0x21,
    /// Write up to 256 bytes.
    Write = 0x31,
    /// Erase with one-byte page numbers.
    Erase = 0x43,
    /// Erase with two-byte page numbers.
    ExtendedErase = 0x44,
    /// Enable write protection.
    WriteProtect = 0x63,
    /// Disable write protection.
    WriteUnprotect = 0x73,
    /// Enable read protection.
    ReadProtect = 0x82,
    /// Disable read protection.
    ReadUnprotect = 0x92,
    /// Generate an authorization challenge.
    Randomize = 0x93,
}

impl CommandCode {
    /// All known command codes.
    pub const ALL: [Self; 14] = [
        Self::Init,
        Self::Get,
        Self::GetProtection,
        Self::GetId,
        Self::Read,
        Self::Go,
        Self::Write,
        Self::Erase,
        Self::ExtendedErase,
        Self::WriteProtect,
        Self::WriteUnprotect,
        Self::ReadProtect,
        Self::ReadUnprotect,
        Self::Randomize,
    ];

    /// Look up a command code from its wire value.
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| *c as u8 == value)
    }

    /// Protocol name of the command.
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Get => "GET",
            Self::GetProtection => "GET_PROT",
            Self::GetId => "GET_ID",
            Self::Read => "READ",
            Self::Go => "GO",
            Self::Write => "WRITE",
            Self::Erase => "ERASE",
            Self::ExtendedErase => "EXT_ERASE",
            Self::WriteProtect => "WR_PROTECT",
            Self::WriteUnprotect => "WR_UNPROTECT",
            Self::ReadProtect => "RD_PROTECT",
            Self::ReadUnprotect => "RD_UNPROTECT",
            Self::Randomize => "RANDOMIZE",
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), *self as u8)
    }
}

/// Single-byte reply to a frame phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    /// Accepted.
    Ack,
    /// Rejected.
    Nack,
    /// Anything else.
    Other(u8),
}

impl From<u8> for ResponseCode {
    fn from(value: u8) -> Self {
        match value {
            ACK => Self::Ack,
            NACK => Self::Nack,
            other => Self::Other(other),
        }
    }
}

/// Special selector for the classic ERASE command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EraseMode {
    /// Erase all pages.
    Global = 0xFF,
}

/// Special selector for the EXT_ERASE command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ExtendedEraseMode {
    /// Erase all pages.
    Global = 0xFFFF,
    /// Erase bank 1.
    Bank1 = 0xFFFE,
    /// Erase bank 2.
    Bank2 = 0xFFFD,
}

/// Out-of-protocol commands understood by the application firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommunicationCommand {
    /// Enter production mode.
    EnableProductionMode,
    /// Leave production mode.
    DisableProductionMode,
    /// Reboot into the bootloader. Requires production mode.
    JumpToBootloader,
}

impl DeviceCommunicationCommand {
    /// Byte sent before every frame to wake the device.
    pub const WAKE_BYTE: u8 = 0x00;

    /// Acknowledgement of a device communication frame.
    pub const RESPONSE_OK: u8 = 0xE2;

    const PREAMBLE: [u8; 4] = [0xAA, 0xAA, 0xAA, 0x08];

    /// Sub-command byte of the frame.
    pub fn subcommand(self) -> u8 {
        match self {
            Self::EnableProductionMode => 0x01,
            Self::DisableProductionMode => 0x02,
            Self::JumpToBootloader => 0x0A,
        }
    }

    /// The 8-byte frame: preamble, sub-command, zero, CRC-16 high, low.
    pub fn frame(self) -> [u8; 8] {
        let mut frame = [0u8; 8];
        frame[..4].copy_from_slice(&Self::PREAMBLE);
        frame[4] = self.subcommand();
        let crc = crc16(&frame[..6]).to_be_bytes();
        frame[6..].copy_from_slice(&crc);
        frame
    }
}

/// Commands the connected device reported in its GET reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    codes: BTreeSet<u8>,
}

impl CapabilitySet {
    /// Build from raw command bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            codes: bytes.iter().copied().collect(),
        }
    }

    /// Whether the device reported `code`.
    pub fn supports(&self, code: CommandCode) -> bool {
        self.codes.contains(&(code as u8))
    }

    /// Known commands in the set.
    pub fn commands(&self) -> impl Iterator<Item = CommandCode> + '_ {
        self.codes.iter().filter_map(|b| CommandCode::from_u8(*b))
    }

    /// Whether the set is empty (no identification yet).
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Forget all capabilities.
    pub fn clear(&mut self) {
        self.codes.clear();
    }
}

/// Bootloader version, one nibble each.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
}

impl From<u8> for Version {
    fn from(value: u8) -> Self {
        Self {
            major: value >> 4,
            minor: value & 0x0F,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Identity reported by GET and GET_ID.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Bootloader version.
    pub version: Version,
    /// Product id.
    pub product_id: u16,
}

/// Wire format generation of the bootloader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum Generation {
    /// Two-byte CRC-16 checksums, 10-byte GET reply.
    #[default]
    Crc16,
    /// One-byte XOR checksums, 13-byte GET reply ending in an ACK.
    Xor,
}

impl Generation {
    /// Total GET reply length, ACK and length byte included.
    pub fn get_reply_len(self) -> usize {
        match self {
            Self::Crc16 => 10,
            Self::Xor => 13,
        }
    }

    /// Whether GET/GET_ID replies end with an extra ACK byte.
    pub fn trailing_ack(self) -> bool {
        matches!(self, Self::Xor)
    }

    /// Number of ACKs that close a protection-toggle command.
    pub fn unprotect_acks(self) -> usize {
        match self {
            Self::Crc16 => 1,
            Self::Xor => 2,
        }
    }

    /// Checksum bytes protecting `group`.
    ///
    /// XOR groups follow the usual rule: a single byte is sent with its
    /// complement, longer groups with the plain XOR of their bytes.
    pub fn checksum(self, group: &[u8]) -> Vec<u8> {
        match self {
            Self::Crc16 => crc16(group).to_be_bytes().to_vec(),
            Self::Xor if group.len() == 1 => vec![xor_checksum(group)],
            Self::Xor => vec![!xor_checksum(group)],
        }
    }

    /// Checksum over `data` with `preceding` folded in first.
    pub fn checksum_with_preceding(self, preceding: u8, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Crc16 => crc16_with_preceding(preceding, data)
                .to_be_bytes()
                .to_vec(),
            Self::Xor => vec![!xor_checksum(data) ^ preceding],
        }
    }

    /// `group` followed by its checksum.
    pub fn frame(self, group: &[u8]) -> Vec<u8> {
        let mut frame = group.to_vec();
        frame.extend(self.checksum(group));
        frame
    }

    /// Command phase frame.
    pub fn command_frame(self, code: CommandCode) -> Vec<u8> {
        self.frame(&[code as u8])
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Crc16 => "crc16",
            Self::Xor => "xor",
        })
    }
}

impl std::str::FromStr for Generation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "crc16" | "crc" | "current" => Ok(Self::Crc16),
            "xor" | "legacy" => Ok(Self::Xor),
            other => Err(format!("unknown protocol generation: {other}")),
        }
    }
}
