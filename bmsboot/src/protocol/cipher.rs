//! Symbol cipher for the authorization handshake.
//!
//! Each byte is shifted by [`SEED_OFFSET`] and raised to a key exponent
//! modulo a small modulus, producing a signed 16-bit symbol. Arithmetic is
//! 32-bit with truncating remainder, matching the device firmware exactly
//! (bytes below the offset produce negative symbols).
//!
//! ## Challenge
//!
//! ```text
//! device -> host   4 x i16 LE   random bytes encrypted with the device key
//! host   -> device 4 x i16 LE   same bytes re-encrypted with the host key
//! ```

use byteorder::{ByteOrder, LittleEndian};

/// Offset applied to every symbol before exponentiation.
pub const SEED_OFFSET: i32 = 96;

/// Number of random bytes in a challenge.
pub const CHALLENGE_BYTES: usize = 4;

/// Wire size of an encrypted challenge.
pub const CHALLENGE_LEN: usize = CHALLENGE_BYTES * 2;

/// Modulus and exponents of one party.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPair {
    /// Modulus `n`.
    pub modulus: i32,
    /// Public exponent `e`.
    pub public_exponent: u32,
    /// Private exponent `d`.
    pub private_exponent: u32,
}

/// Keys identifying the device.
pub const DEVICE_KEYS: KeyPair = KeyPair {
    modulus: 2651,
    public_exponent: 7,
    private_exponent: 2743,
};

/// Keys identifying the host.
pub const HOST_KEYS: KeyPair = KeyPair {
    modulus: 1243,
    public_exponent: 3,
    private_exponent: 1867,
};

fn mod_pow(base: i32, exponent: u32, modulus: i32) -> i32 {
    let mut k = 1i32;
    for _ in 0..exponent {
        k = (k * base) % modulus;
    }
    k
}

/// Encrypt one byte: `((value - offset)^e mod n) + offset`.
#[allow(clippy::cast_possible_truncation)]
pub fn encrypt(value: u8, modulus: i32, exponent: u32) -> i16 {
    let k = mod_pow(i32::from(value) - SEED_OFFSET, exponent, modulus);
    (k + SEED_OFFSET) as i16
}

/// Decrypt one symbol back to a byte.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn decrypt(symbol: i16, modulus: i32, exponent: u32) -> u8 {
    let k = mod_pow(i32::from(symbol) - SEED_OFFSET, exponent, modulus);
    (k + SEED_OFFSET) as u8
}

impl KeyPair {
    /// Encrypt with the public exponent.
    pub fn encrypt(&self, value: u8) -> i16 {
        encrypt(value, self.modulus, self.public_exponent)
    }

    /// Decrypt with the private exponent.
    pub fn decrypt(&self, symbol: i16) -> u8 {
        decrypt(symbol, self.modulus, self.private_exponent)
    }
}

/// Recover the device's random value and re-encrypt it for the host.
pub fn answer_challenge(challenge: &[u8; CHALLENGE_LEN]) -> [u8; CHALLENGE_LEN] {
    let mut response = [0u8; CHALLENGE_LEN];
    for (symbol_in, symbol_out) in challenge
        .chunks_exact(2)
        .zip(response.chunks_exact_mut(2))
    {
        let value = DEVICE_KEYS.decrypt(LittleEndian::read_i16(symbol_in));
        LittleEndian::write_i16(symbol_out, HOST_KEYS.encrypt(value));
    }
    response
}
