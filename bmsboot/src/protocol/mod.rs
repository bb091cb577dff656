//! Wire protocol building blocks.

pub mod cipher;
pub mod command;
pub mod crc;

// Re-export common types
pub use command::{
    ACK, CapabilitySet, CommandCode, DeviceCommunicationCommand, DeviceIdentity, EraseMode,
    ExtendedEraseMode, Generation, MAX_TRANSFER, NACK, ResponseCode, Version,
};
