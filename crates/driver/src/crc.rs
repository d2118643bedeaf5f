//! CRC-16 used for the L2 frame trailer.
//!
//! Polynomial 0x8005, initial value 0, MSB first, no final xor. The chip
//! transmits the result low byte first.

const CRC16_POLYNOMIAL: u16 = 0x8005;

/// Size of the frame trailer in bytes.
pub const CRC_LEN: usize = 2;

/// Compute the CRC-16 of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC16_POLYNOMIAL
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Trailer bytes as they appear on the wire.
#[inline]
pub fn trailer(data: &[u8]) -> [u8; CRC_LEN] {
    crc16(data).to_le_bytes()
}

/// Decode a wire trailer back into the CRC value.
#[inline]
pub fn decode_trailer(bytes: [u8; CRC_LEN]) -> u16 {
    u16::from_le_bytes(bytes)
}
