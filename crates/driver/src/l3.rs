//! L3 encrypted packet format and command result codes.
//!
//! # Packet Format
//!
//! - 2 bytes: plaintext size (little-endian)
//! - N bytes: AES-GCM ciphertext of `[command id | data]` or `[result | data]`
//! - 16 bytes: tag

use std::fmt;

use zeroize::Zeroizing;

use crate::crypto::TAG_LEN;
use crate::error::{Error, Result};

/// Size field length.
pub const L3_SIZE_LEN: usize = 2;
/// Command id length.
pub const L3_CMD_ID_LEN: usize = 1;
/// Result code length.
pub const L3_RESULT_LEN: usize = 1;
/// Largest command data following the command id.
pub const L3_CMD_DATA_MAX: usize = 4097;
/// Largest plaintext of a command or result.
pub const L3_PLAINTEXT_MAX: usize = L3_CMD_ID_LEN + L3_CMD_DATA_MAX;
/// Largest encrypted packet.
pub const L3_PACKET_MAX: usize = L3_SIZE_LEN + L3_PLAINTEXT_MAX + TAG_LEN;

/// Command ids understood by the chip.
pub mod command {
    /// Echo the payload back.
    pub const PING: u8 = 0x01;
    /// Write a user data slot.
    pub const R_MEM_DATA_WRITE: u8 = 0x40;
    /// Read a user data slot.
    pub const R_MEM_DATA_READ: u8 = 0x41;
    /// Erase a user data slot.
    pub const R_MEM_DATA_ERASE: u8 = 0x42;
    /// Return bytes from the chip's TRNG.
    pub const RANDOM_VALUE_GET: u8 = 0x50;
    /// Generate a key in an ECC slot.
    pub const ECC_KEY_GENERATE: u8 = 0x60;
    /// Read the public half of an ECC slot.
    pub const ECC_KEY_READ: u8 = 0x62;
    /// Erase an ECC slot.
    pub const ECC_KEY_ERASE: u8 = 0x63;
    /// Sign a digest with a P-256 key.
    pub const ECDSA_SIGN: u8 = 0x70;
}

/// Result code carried in the first plaintext byte of an L3 result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// Command succeeded.
    Ok,
    /// Command failed.
    Fail,
    /// The pairing key of this session lacks permission.
    Unauthorized,
    /// Command id not recognised.
    InvalidCommand,
    /// Command specific failure (0x10..).
    Specific(u8),
}

impl ResultCode {
    /// Decode a raw result byte.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0xC3 => ResultCode::Ok,
            0x3C => ResultCode::Fail,
            0x01 => ResultCode::Unauthorized,
            0x02 => ResultCode::InvalidCommand,
            other => ResultCode::Specific(other),
        }
    }

    /// Raw result byte.
    pub fn as_byte(self) -> u8 {
        match self {
            ResultCode::Ok => 0xC3,
            ResultCode::Fail => 0x3C,
            ResultCode::Unauthorized => 0x01,
            ResultCode::InvalidCommand => 0x02,
            ResultCode::Specific(byte) => byte,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResultCode::Ok => "ok",
            ResultCode::Fail => "fail",
            ResultCode::Unauthorized => "unauthorized",
            ResultCode::InvalidCommand => "invalid command",
            ResultCode::Specific(_) => "command specific",
        };
        write!(f, "{} ({:#04x})", name, self.as_byte())
    }
}

/// Wrap a sealed plaintext (ciphertext followed by tag) into a packet.
pub fn encode_packet(sealed: &[u8]) -> Result<Vec<u8>> {
    let size = sealed
        .len()
        .checked_sub(TAG_LEN)
        .ok_or_else(|| Error::Crypto("sealed payload shorter than tag".to_string()))?;
    if size > L3_PLAINTEXT_MAX {
        return Err(Error::PayloadTooLarge {
            size,
            max: L3_PLAINTEXT_MAX,
        });
    }

    let mut packet = Vec::with_capacity(L3_SIZE_LEN + sealed.len());
    packet.extend_from_slice(&(size as u16).to_le_bytes());
    packet.extend_from_slice(sealed);
    Ok(packet)
}

/// Strip the size field from a received packet, returning ciphertext and tag.
pub fn decode_packet(packet: &[u8]) -> Result<&[u8]> {
    if packet.len() < L3_SIZE_LEN + L3_RESULT_LEN + TAG_LEN {
        return Err(Error::UnexpectedResponse(format!(
            "l3 packet of {} bytes is too short",
            packet.len()
        )));
    }
    let size = u16::from_le_bytes([packet[0], packet[1]]) as usize;
    let sealed = &packet[L3_SIZE_LEN..];
    if size + TAG_LEN != sealed.len() {
        return Err(Error::UnexpectedResponse(format!(
            "l3 size field {} does not match packet of {} bytes",
            size,
            packet.len()
        )));
    }
    Ok(sealed)
}

/// Decrypted result of a secure command.
pub struct L3Response {
    /// Result code.
    pub result: ResultCode,
    /// Bytes after the result code.
    pub data: Zeroizing<Vec<u8>>,
}

impl L3Response {
    /// Split a decrypted result plaintext.
    pub fn from_plaintext(plaintext: &[u8]) -> Result<Self> {
        let (&result, data) = plaintext
            .split_first()
            .ok_or_else(|| Error::UnexpectedResponse("empty l3 result".to_string()))?;
        Ok(Self {
            result: ResultCode::from_byte(result),
            data: Zeroizing::new(data.to_vec()),
        })
    }

    /// The data, provided the command succeeded.
    pub fn into_ok(self) -> Result<Zeroizing<Vec<u8>>> {
        match self.result {
            ResultCode::Ok => Ok(self.data),
            other => Err(Error::CommandFailed(other)),
        }
    }
}

impl fmt::Debug for L3Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("L3Response")
            .field("result", &self.result)
            .field("data_len", &self.data.len())
            .finish()
    }
}
