//! Raw firmware images.

use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Error, Result};

/// Largest image the bootloader accepts.
pub const MAX_FIRMWARE_SIZE: usize = 0xFFFF;

/// Binary image to be programmed at the user-code address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    path: Option<PathBuf>,
    data: Vec<u8>,
}

impl FirmwareImage {
    /// Load an image from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        debug!("Loaded {} ({} bytes)", path.display(), data.len());
        let mut image = Self::from_bytes(data)?;
        image.path = Some(path.to_path_buf());
        Ok(image)
    }

    /// Wrap an in-memory image.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::Config("firmware file is empty".into()));
        }
        if data.len() > MAX_FIRMWARE_SIZE {
            return Err(Error::FirmwareTooLarge {
                size: data.len(),
                max: MAX_FIRMWARE_SIZE,
            });
        }
        Ok(Self { path: None, data })
    }

    /// Source file, if loaded from disk.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Image bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Image size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always false: empty images are rejected on load.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x20, 0x00, 0x50, 0x00]).unwrap();

        let image = FirmwareImage::from_file(file.path()).unwrap();
        assert_eq!(image.len(), 4);
        assert_eq!(image.data(), &[0x20, 0x00, 0x50, 0x00]);
        assert_eq!(image.path(), Some(file.path()));
    }

    #[test]
    fn test_size_limit() {
        assert!(FirmwareImage::from_bytes(vec![0; MAX_FIRMWARE_SIZE]).is_ok());
        assert!(matches!(
            FirmwareImage::from_bytes(vec![0; MAX_FIRMWARE_SIZE + 1]),
            Err(Error::FirmwareTooLarge {
                size: 0x10000,
                max: 0xFFFF
            })
        ));
    }

    #[test]
    fn test_empty_and_missing() {
        assert!(matches!(
            FirmwareImage::from_bytes(Vec::new()),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            FirmwareImage::from_file("/nonexistent/firmware.bin"),
            Err(Error::Io(_))
        ));
    }
}
