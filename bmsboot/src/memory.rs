//! Chunked memory operations on top of the command engine.
//!
//! Transfers are split into frames of at most [`MAX_TRANSFER`] bytes,
//! processed in increasing address order. The cancellation token is checked
//! before every chunk, never in the middle of one: chunks that were already
//! acknowledged stay programmed.

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};

use crate::bootloader::Bootloader;
use crate::error::{Error, Result};
use crate::protocol::command::{CommandCode, EraseMode, ExtendedEraseMode, MAX_TRANSFER};

/// Address written to flag the firmware as valid.
pub const VALID_MARKER_ADDRESS: u32 = 0xFFFF_FFFF;

/// Address written to flag the firmware as invalid.
pub const INVALID_MARKER_ADDRESS: u32 = 0xFFFF_FFFE;

/// Payload of a validation marker write.
pub const VALIDATION_MARKER: [u8; 4] = [0x55; 4];

/// Shared cancellation flag for chunk loops.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// New, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Bytes processed so far in a chunk loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    /// Bytes transferred.
    pub bytes_processed: usize,
    /// Bytes requested.
    pub bytes_total: usize,
}

impl TransferProgress {
    /// Integer percentage, 0..=100.
    #[allow(clippy::cast_possible_truncation)]
    pub fn percent(&self) -> u8 {
        if self.bytes_total == 0 {
            return 0;
        }
        (self.bytes_processed.min(self.bytes_total) * 100 / self.bytes_total) as u8
    }
}

fn chunk_address(base: u32, offset: usize) -> Result<u32> {
    u32::try_from(offset)
        .ok()
        .and_then(|o| base.checked_add(o))
        .ok_or_else(|| {
            Error::Config(format!(
                "range past end of address space at 0x{base:08X}+{offset}"
            ))
        })
}

/// Pages touched by `length` bytes at `address`, numbered from `base`.
///
/// Addresses below `base` are treated as `base`.
pub fn pages_in_range(base: u32, address: u32, length: usize, page_size: u32) -> Range<u32> {
    let page_size = u64::from(page_size.max(1));
    let start = u64::from(address.saturating_sub(base));
    let Some(last) = (length as u64).checked_sub(1) else {
        return 0..0;
    };

    let page = |offset: u64| u32::try_from(offset / page_size).unwrap_or(u32::MAX);
    page(start)..page(start + last).saturating_add(1)
}

impl Bootloader {
    /// Read `length` bytes from `address`.
    pub fn read_memory<F>(
        &mut self,
        address: u32,
        length: usize,
        mut progress: F,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>>
    where
        F: FnMut(TransferProgress),
    {
        debug!("Reading {length} bytes from 0x{address:08X}");
        let mut data = Vec::with_capacity(length);

        while data.len() < length {
            if cancel.is_cancelled() {
                info!("Read cancelled after {} bytes", data.len());
                return Err(Error::OperationCancelled);
            }

            let chunk = (length - data.len()).min(MAX_TRANSFER);
            let chunk_addr = chunk_address(address, data.len())?;
            let bytes = self.read(chunk_addr, chunk)?;
            data.extend_from_slice(&bytes);

            progress(TransferProgress {
                bytes_processed: data.len(),
                bytes_total: length,
            });
        }

        Ok(data)
    }

    /// Write `data` starting at `address`.
    pub fn write_memory<F>(
        &mut self,
        address: u32,
        data: &[u8],
        mut progress: F,
        cancel: &CancelToken,
    ) -> Result<()>
    where
        F: FnMut(TransferProgress),
    {
        debug!("Writing {} bytes to 0x{address:08X}", data.len());
        let mut offset = 0;

        for chunk in data.chunks(MAX_TRANSFER) {
            if cancel.is_cancelled() {
                info!("Write cancelled after {offset} bytes");
                return Err(Error::OperationCancelled);
            }

            self.write(chunk_address(address, offset)?, chunk)?;
            offset += chunk.len();

            progress(TransferProgress {
                bytes_processed: offset,
                bytes_total: data.len(),
            });
        }

        Ok(())
    }

    /// Read `expected.len()` bytes back and compare.
    pub fn verify_memory<F>(
        &mut self,
        address: u32,
        expected: &[u8],
        progress: F,
        cancel: &CancelToken,
    ) -> Result<()>
    where
        F: FnMut(TransferProgress),
    {
        let actual = self.read_memory(address, expected.len(), progress, cancel)?;
        match expected.iter().zip(&actual).position(|(a, b)| a != b) {
            Some(offset) => Err(Error::VerificationFailed {
                address: chunk_address(address, offset)?,
            }),
            None => Ok(()),
        }
    }

    /// Erase one page with whichever erase command the device supports.
    pub fn erase_page(&mut self, page: u32) -> Result<()> {
        if self.supports(CommandCode::Erase) {
            let page = u8::try_from(page)
                .map_err(|_| Error::Config(format!("page {page} out of range for ERASE")))?;
            self.erase(page)
        } else if self.supports(CommandCode::ExtendedErase) {
            let page = u16::try_from(page)
                .map_err(|_| Error::Config(format!("page {page} out of range for EXT_ERASE")))?;
            self.extended_erase(page)
        } else {
            Err(Error::CommandNotSupported(CommandCode::Erase))
        }
    }

    /// Erase every page covering `length` bytes at `address`.
    pub fn erase_range(
        &mut self,
        base: u32,
        address: u32,
        length: usize,
        page_size: u32,
        cancel: &CancelToken,
    ) -> Result<()> {
        for page in pages_in_range(base, address, length, page_size) {
            if cancel.is_cancelled() {
                return Err(Error::OperationCancelled);
            }
            debug!("Erasing page {page}");
            self.erase_page(page)?;
        }
        Ok(())
    }

    /// Erase the whole flash.
    pub fn global_erase(&mut self) -> Result<()> {
        if self.supports(CommandCode::Erase) {
            self.erase_special(EraseMode::Global)
        } else if self.supports(CommandCode::ExtendedErase) {
            self.extended_erase_special(ExtendedEraseMode::Global)
        } else {
            Err(Error::CommandNotSupported(CommandCode::Erase))
        }
    }

    /// Start execution at `address`.
    pub fn jump(&mut self, address: u32) -> Result<()> {
        info!("Jumping to 0x{address:08X}");
        self.go(address)
    }

    /// Write the validation marker.
    pub fn mark_firmware(&mut self, valid: bool) -> Result<()> {
        let address = if valid {
            VALID_MARKER_ADDRESS
        } else {
            INVALID_MARKER_ADDRESS
        };
        debug!("Marking firmware {}", if valid { "valid" } else { "invalid" });
        self.write(address, &VALIDATION_MARKER)
    }
}
