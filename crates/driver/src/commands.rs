//! Typed wrappers for the chip's L3 command set.

use zeroize::Zeroizing;

use crate::crypto::{CryptoProvider, DIGEST_LEN, P256_SIGNATURE_LEN};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::l3::{command, L3Response};
use crate::link::LinkDriver;

/// Largest ping payload.
pub const PING_LEN_MAX: usize = 4096;
/// Largest random value request.
pub const RANDOM_VALUE_LEN_MAX: usize = 255;
/// Largest user data slot content.
pub const R_MEM_DATA_SIZE_MAX: usize = 444;
/// Highest user data slot index.
pub const R_MEM_DATA_SLOT_MAX: u16 = 511;
/// Highest ECC key slot index.
pub const ECC_SLOT_MAX: u16 = 31;

/// Result padding before data in several responses.
const RESPONSE_PADDING: usize = 3;
const ECC_KEY_READ_PADDING: usize = 13;
const ECDSA_SIGN_CMD_PADDING: usize = 13;
const ECDSA_SIGN_RES_PADDING: usize = 15;

/// Curve of an ECC key slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EccCurve {
    /// NIST P-256, used for ECDSA.
    P256,
    /// Ed25519, used for EdDSA.
    Ed25519,
}

impl EccCurve {
    /// Curve id on the wire.
    pub fn id(self) -> u8 {
        match self {
            EccCurve::P256 => 0x01,
            EccCurve::Ed25519 => 0x02,
        }
    }

    /// Decode a curve id.
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x01 => Some(EccCurve::P256),
            0x02 => Some(EccCurve::Ed25519),
            _ => None,
        }
    }

    /// Public key length reported by `ECC_Key_Read`.
    pub fn public_key_len(self) -> usize {
        match self {
            EccCurve::P256 => 64,
            EccCurve::Ed25519 => 32,
        }
    }
}

/// How an ECC key got into its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EccKeyOrigin {
    /// Generated on the chip.
    Generated,
    /// Imported by the host.
    Stored,
}

/// Public half of an ECC key slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EccKeyInfo {
    /// Curve.
    pub curve: EccCurve,
    /// Origin.
    pub origin: EccKeyOrigin,
    /// Public key; `x || y` for P-256.
    pub public_key: Vec<u8>,
}

fn check_slot(slot: u16, max: u16) -> Result<()> {
    if slot > max {
        return Err(Error::InvalidArgument(format!(
            "slot {} exceeds {}",
            slot, max
        )));
    }
    Ok(())
}

fn short_response(what: &str, len: usize) -> Error {
    Error::UnexpectedResponse(format!("{} response of {} bytes", what, len))
}

impl<L: LinkDriver, C: CryptoProvider> Device<L, C> {
    fn secure_command(&mut self, command_id: u8, payload: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let response: L3Response = self.dispatch_secure_command(command_id, payload)?;
        response.into_ok()
    }

    /// Echo `data` through the encrypted channel.
    pub fn ping(&mut self, data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if data.len() > PING_LEN_MAX {
            return Err(Error::PayloadTooLarge {
                size: data.len(),
                max: PING_LEN_MAX,
            });
        }
        let echoed = self.secure_command(command::PING, data)?;
        if echoed.as_slice() != data {
            return Err(Error::UnexpectedResponse("ping echo differs".to_string()));
        }
        Ok(echoed)
    }

    /// `len` bytes from the chip's TRNG.
    pub fn random_value_get(&mut self, len: usize) -> Result<Zeroizing<Vec<u8>>> {
        if len > RANDOM_VALUE_LEN_MAX {
            return Err(Error::PayloadTooLarge {
                size: len,
                max: RANDOM_VALUE_LEN_MAX,
            });
        }
        let data = self.secure_command(command::RANDOM_VALUE_GET, &[len as u8])?;
        if data.len() != RESPONSE_PADDING + len {
            return Err(short_response("random value", data.len()));
        }
        Ok(Zeroizing::new(data[RESPONSE_PADDING..].to_vec()))
    }

    /// Write a user data slot. The slot must be empty.
    pub fn r_mem_data_write(&mut self, slot: u16, data: &[u8]) -> Result<()> {
        check_slot(slot, R_MEM_DATA_SLOT_MAX)?;
        if data.is_empty() {
            return Err(Error::InvalidArgument("empty user data".to_string()));
        }
        if data.len() > R_MEM_DATA_SIZE_MAX {
            return Err(Error::PayloadTooLarge {
                size: data.len(),
                max: R_MEM_DATA_SIZE_MAX,
            });
        }
        let mut payload = Zeroizing::new(Vec::with_capacity(3 + data.len()));
        payload.extend_from_slice(&slot.to_le_bytes());
        payload.push(0);
        payload.extend_from_slice(data);
        self.secure_command(command::R_MEM_DATA_WRITE, &payload)?;
        Ok(())
    }

    /// Read a user data slot; `None` when the slot is empty.
    pub fn r_mem_data_read(&mut self, slot: u16) -> Result<Option<Zeroizing<Vec<u8>>>> {
        check_slot(slot, R_MEM_DATA_SLOT_MAX)?;
        let data = self.secure_command(command::R_MEM_DATA_READ, &slot.to_le_bytes())?;
        if data.len() < RESPONSE_PADDING {
            return Err(short_response("user data read", data.len()));
        }
        if data.len() == RESPONSE_PADDING {
            return Ok(None);
        }
        Ok(Some(Zeroizing::new(data[RESPONSE_PADDING..].to_vec())))
    }

    /// Erase a user data slot.
    pub fn r_mem_data_erase(&mut self, slot: u16) -> Result<()> {
        check_slot(slot, R_MEM_DATA_SLOT_MAX)?;
        self.secure_command(command::R_MEM_DATA_ERASE, &slot.to_le_bytes())?;
        Ok(())
    }

    /// Generate a key inside an ECC slot.
    pub fn ecc_key_generate(&mut self, slot: u16, curve: EccCurve) -> Result<()> {
        check_slot(slot, ECC_SLOT_MAX)?;
        let [lo, hi] = slot.to_le_bytes();
        self.secure_command(command::ECC_KEY_GENERATE, &[lo, hi, curve.id()])?;
        Ok(())
    }

    /// Read the public key and metadata of an ECC slot.
    pub fn ecc_key_read(&mut self, slot: u16) -> Result<EccKeyInfo> {
        check_slot(slot, ECC_SLOT_MAX)?;
        let data = self.secure_command(command::ECC_KEY_READ, &slot.to_le_bytes())?;
        let header = 2 + ECC_KEY_READ_PADDING;
        if data.len() < header {
            return Err(short_response("ecc key read", data.len()));
        }
        let curve = EccCurve::from_id(data[0])
            .ok_or_else(|| Error::UnexpectedResponse(format!("unknown curve {:#04x}", data[0])))?;
        let origin = match data[1] {
            0x01 => EccKeyOrigin::Generated,
            0x02 => EccKeyOrigin::Stored,
            other => {
                return Err(Error::UnexpectedResponse(format!(
                    "unknown key origin {:#04x}",
                    other
                )))
            }
        };
        let public_key = data[header..].to_vec();
        if public_key.len() != curve.public_key_len() {
            return Err(short_response("ecc key read", data.len()));
        }
        Ok(EccKeyInfo {
            curve,
            origin,
            public_key,
        })
    }

    /// Erase an ECC slot.
    pub fn ecc_key_erase(&mut self, slot: u16) -> Result<()> {
        check_slot(slot, ECC_SLOT_MAX)?;
        self.secure_command(command::ECC_KEY_ERASE, &slot.to_le_bytes())?;
        Ok(())
    }

    /// Sign a SHA-256 digest with the P-256 key in `slot`, returning `r || s`.
    pub fn ecdsa_sign(
        &mut self,
        slot: u16,
        digest: &[u8; DIGEST_LEN],
    ) -> Result<[u8; P256_SIGNATURE_LEN]> {
        check_slot(slot, ECC_SLOT_MAX)?;
        let mut payload = [0u8; 2 + ECDSA_SIGN_CMD_PADDING + DIGEST_LEN];
        payload[..2].copy_from_slice(&slot.to_le_bytes());
        payload[2 + ECDSA_SIGN_CMD_PADDING..].copy_from_slice(digest);

        let data = self.secure_command(command::ECDSA_SIGN, &payload)?;
        if data.len() != ECDSA_SIGN_RES_PADDING + P256_SIGNATURE_LEN {
            return Err(short_response("ecdsa sign", data.len()));
        }
        let mut signature = [0u8; P256_SIGNATURE_LEN];
        signature.copy_from_slice(&data[ECDSA_SIGN_RES_PADDING..]);
        Ok(signature)
    }
}
