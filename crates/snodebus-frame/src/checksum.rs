//! The bus's rolling 16-bit checksum.
//!
//! Not a CRC: each byte rotates the register left by one bit and is then
//! XORed in. Devices compute exactly this, so it must stay bit-exact.

/// Initial register value.
pub const CHECKSUM_SEED: u16 = 0x1021;

/// Compute the checksum over `bytes`.
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(CHECKSUM_SEED, |reg, &byte| reg.rotate_left(1) ^ u16::from(byte))
}

/// Returns true if `expected` is the checksum of `bytes`.
pub fn verify(expected: u16, bytes: &[u8]) -> bool {
    checksum(bytes) == expected
}
