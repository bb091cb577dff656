//! User-facing session settings.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::firmware::MAX_FIRMWARE_SIZE;

/// Flash address where user code starts. Page numbers count from here.
pub const USER_CODE_BASE: u32 = 0x0800_0000;

/// User-code addresses are aligned down to 256 bytes.
const USER_CODE_ALIGN_MASK: u32 = 0xFFFF_FF00;

/// Erasable page size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PageSize {
    /// 128-byte pages.
    B128,
    /// 256-byte pages.
    #[default]
    B256,
    /// 2 KiB pages.
    B2048,
}

impl PageSize {
    /// Page size in bytes.
    pub fn bytes(self) -> u32 {
        match self {
            Self::B128 => 128,
            Self::B256 => 256,
            Self::B2048 => 2048,
        }
    }
}

impl FromStr for PageSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "128" => Ok(Self::B128),
            "256" => Ok(Self::B256),
            "2048" => Ok(Self::B2048),
            other => Err(Error::Config(format!(
                "invalid page size '{other}' (expected 128, 256 or 2048)"
            ))),
        }
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes())
    }
}

/// Parse a hex user-code address, align it to 256 bytes and clamp it to
/// [`USER_CODE_BASE`].
///
/// ```
/// use bmsboot::session::parse_user_code_address;
///
/// assert_eq!(parse_user_code_address("8000123").unwrap(), 0x0800_0100);
/// assert_eq!(parse_user_code_address("0x100").unwrap(), 0x0800_0000);
/// ```
pub fn parse_user_code_address(input: &str) -> Result<u32> {
    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let value = u32::from_str_radix(digits, 16)
        .map_err(|e| Error::Config(format!("invalid hex address '{input}': {e}")))?;
    Ok((value & USER_CODE_ALIGN_MASK).max(USER_CODE_BASE))
}

/// Format an address the way it is shown to users.
pub fn format_address(address: u32) -> String {
    format!("{address:08X}")
}

/// Settings a workflow reads when it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Firmware image to program.
    pub firmware_path: Option<PathBuf>,
    /// Serial port of the device.
    pub port: Option<String>,
    /// Erase page size.
    pub page_size: PageSize,
    /// Erase the whole flash instead of the pages the image covers.
    pub global_erase: bool,
    /// Where the image is programmed and where GO jumps.
    pub user_code_address: u32,
    /// Read the image back after programming.
    pub verify: bool,
    /// Write the validation marker around programming and erasing.
    pub mark_valid: bool,
    /// Bytes fetched by the read workflow.
    pub read_length: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            firmware_path: None,
            port: None,
            page_size: PageSize::default(),
            global_erase: false,
            user_code_address: USER_CODE_BASE,
            verify: false,
            mark_valid: true,
            read_length: MAX_FIRMWARE_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_parse() {
        assert_eq!("128".parse::<PageSize>().unwrap(), PageSize::B128);
        assert_eq!(" 2048 ".parse::<PageSize>().unwrap().bytes(), 2048);
        assert!("512".parse::<PageSize>().is_err());
        assert_eq!(PageSize::default().to_string(), "256");
    }

    #[test]
    fn test_user_code_address_masked() {
        assert_eq!(parse_user_code_address("8000123").unwrap(), 0x0800_0100);
        assert_eq!(parse_user_code_address("0x080012FF").unwrap(), 0x0800_1200);
        assert_eq!(parse_user_code_address("0X08004000").unwrap(), 0x0800_4000);
    }

    #[test]
    fn test_user_code_address_clamped() {
        assert_eq!(parse_user_code_address("0").unwrap(), USER_CODE_BASE);
        assert_eq!(parse_user_code_address("7FFFFFF").unwrap(), USER_CODE_BASE);
    }

    #[test]
    fn test_user_code_address_invalid() {
        assert!(parse_user_code_address("").is_err());
        assert!(parse_user_code_address("0x").is_err());
        assert!(parse_user_code_address("hello").is_err());
        assert!(parse_user_code_address("123456789").is_err());
    }

    #[test]
    fn test_format_address() {
        assert_eq!(format_address(0x0800_0100), "08000100");
    }
}
