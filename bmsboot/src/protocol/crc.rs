//! Frame checksums.
//!
//! Two generations of the bootloader protocol use different checksums:
//!
//! - legacy: a one-byte XOR fold seeded with `0xFF`
//! - current: CRC-16 with the reflected `0xA001` polynomial, seed `0`,
//!   transmitted high byte first

/// Reflected CRC-16 polynomial.
const CRC16_POLY: u16 = 0xA001;

/// XOR fold of `data`, seeded with `0xFF`.
///
/// For a single byte this is its complement, which is how command codes are
/// protected in the legacy generation.
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0xFF, |acc, b| acc ^ b)
}

/// Fold one byte into a running CRC-16.
pub fn crc16_update(crc: u16, byte: u8) -> u16 {
    let mut crc = crc ^ u16::from(byte);
    for _ in 0..8 {
        crc = if crc & 0x0001 != 0 {
            (crc >> 1) ^ CRC16_POLY
        } else {
            crc >> 1
        };
    }
    crc
}

/// CRC-16 of `data`, seed `0`.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0, |crc, &b| crc16_update(crc, b))
}

/// CRC-16 of `data` with `preceding` folded in first.
///
/// Write frames protect the length byte and the payload with one checksum.
pub fn crc16_with_preceding(preceding: u8, data: &[u8]) -> u16 {
    data.iter()
        .fold(crc16_update(0, preceding), |crc, &b| crc16_update(crc, b))
}
