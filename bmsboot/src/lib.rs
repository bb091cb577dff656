//! # bmsboot
//!
//! A library for programming BMS controllers through their serial
//! bootloader.
//!
//! The crate covers the whole host side of the link:
//!
//! - byte transport over a serial port with exact-length reads
//! - CRC-16 and legacy XOR checksums
//! - the challenge-response cipher used for authorization
//! - the command/framing engine (GET, GET_ID, READ, WRITE, GO, ERASE, ...)
//! - chunked memory operations with progress and cancellation
//! - a session controller that detects the device mode and runs write,
//!   erase and read workflows on a background worker
//!
//! ## Features
//!
//! - `native` (default): serial ports via the `serialport` crate
//! - `serde`: serialization support for configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use bmsboot::session::{Callbacks, Controller, Settings};
//! use bmsboot::{NativeConnector, ProtocolConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings {
//!         port: Some("/dev/ttyUSB0".into()),
//!         firmware_path: Some("firmware.bin".into()),
//!         ..Settings::default()
//!     };
//!     let observer = Callbacks::default()
//!         .on_log(|line| println!("{line}"))
//!         .on_progress(|percent| println!("{percent}%"));
//!
//!     let controller = Controller::new(
//!         settings,
//!         ProtocolConfig::default(),
//!         Arc::new(NativeConnector),
//!         Arc::new(observer),
//!     )?;
//!     controller.start_write()?.wait()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bootloader;
pub mod error;
pub mod firmware;
pub mod host;
pub mod memory;
pub mod port;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativeConnector, NativePort};
pub use {
    bootloader::{Bootloader, ProtocolConfig},
    error::{Error, Result},
    firmware::{FirmwareImage, MAX_FIRMWARE_SIZE},
    host::{default_candidates, describe_port, scan_ports},
    memory::{CancelToken, TransferProgress},
    port::{Connector, Port, PortInfo, SerialConfig},
    protocol::{CapabilitySet, CommandCode, DeviceIdentity, Generation, Version},
    session::{
        Callbacks, Controller, DeviceStatus, Observer, PageSize, Settings, WorkflowHandle,
        WorkflowOutcome,
    },
    transport::Transport,
};
