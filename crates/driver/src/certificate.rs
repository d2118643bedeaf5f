//! Certificate store read through Get_Info, and extraction of the chip's
//! static X25519 key from the device certificate.
//!
//! # Store Layout
//!
//! - 1 byte: store version (1)
//! - 1 byte: certificate count (4)
//! - 2 bytes per certificate: DER length (big-endian)
//! - DER certificates, device certificate first

use crate::error::{Error, Result};

/// Store format version.
pub const CERT_STORE_VERSION: u8 = 1;
/// Certificates in the store.
pub const CERT_STORE_CERTIFICATES: usize = 4;
/// Header length.
pub const CERT_STORE_HEADER_LEN: usize = 2 + 2 * CERT_STORE_CERTIFICATES;
/// Bytes per Get_Info block.
pub const GET_INFO_BLOCK_LEN: usize = 128;
/// Blocks readable from the store.
pub const CERT_STORE_MAX_BLOCKS: usize = 30;

/// DER encoding of the X25519 algorithm identifier (OID 1.3.101.110).
const X25519_OID: [u8; 5] = [0x06, 0x03, 0x2B, 0x65, 0x6E];
/// DER BIT STRING header of a 32-byte key.
const X25519_KEY_PREFIX: [u8; 3] = [0x03, 0x21, 0x00];

/// Parsed certificate store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateStore {
    certificates: Vec<Vec<u8>>,
}

impl CertificateStore {
    /// Total store length announced by a header.
    pub fn required_len(header: &[u8]) -> Result<usize> {
        if header.len() < CERT_STORE_HEADER_LEN {
            return Err(Error::UnexpectedResponse(format!(
                "certificate store header of {} bytes",
                header.len()
            )));
        }
        if header[0] != CERT_STORE_VERSION {
            return Err(Error::UnexpectedResponse(format!(
                "certificate store version {}",
                header[0]
            )));
        }
        if header[1] as usize != CERT_STORE_CERTIFICATES {
            return Err(Error::UnexpectedResponse(format!(
                "certificate store holds {} certificates",
                header[1]
            )));
        }
        let body: usize = header[2..CERT_STORE_HEADER_LEN]
            .chunks_exact(2)
            .map(|len| u16::from_be_bytes([len[0], len[1]]) as usize)
            .sum();
        let total = CERT_STORE_HEADER_LEN + body;
        if total > CERT_STORE_MAX_BLOCKS * GET_INFO_BLOCK_LEN {
            return Err(Error::UnexpectedResponse(format!(
                "certificate store of {} bytes exceeds readable area",
                total
            )));
        }
        Ok(total)
    }

    /// Parse a raw store.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let total = Self::required_len(raw)?;
        if raw.len() < total {
            return Err(Error::UnexpectedResponse(format!(
                "certificate store truncated: {} of {} bytes",
                raw.len(),
                total
            )));
        }

        let mut offset = CERT_STORE_HEADER_LEN;
        let mut certificates = Vec::with_capacity(CERT_STORE_CERTIFICATES);
        for len in raw[2..CERT_STORE_HEADER_LEN].chunks_exact(2) {
            let len = u16::from_be_bytes([len[0], len[1]]) as usize;
            certificates.push(raw[offset..offset + len].to_vec());
            offset += len;
        }
        Ok(Self { certificates })
    }

    /// Serialize certificates into the store layout.
    pub fn encode(certificates: &[Vec<u8>]) -> Vec<u8> {
        let mut raw = vec![CERT_STORE_VERSION, certificates.len() as u8];
        for cert in certificates {
            raw.extend_from_slice(&(cert.len() as u16).to_be_bytes());
        }
        for cert in certificates {
            raw.extend_from_slice(cert);
        }
        raw
    }

    /// All certificates, device certificate first.
    pub fn certificates(&self) -> &[Vec<u8>] {
        &self.certificates
    }

    /// The device certificate.
    pub fn device(&self) -> &[u8] {
        self.certificates.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// The chip's static X25519 public key.
    pub fn chip_static_public(&self) -> Result<[u8; 32]> {
        x25519_public_key(self.device()).ok_or_else(|| {
            Error::UnexpectedResponse("device certificate has no x25519 key".to_string())
        })
    }
}

/// Find the X25519 subject public key in a DER certificate.
pub fn x25519_public_key(der: &[u8]) -> Option<[u8; 32]> {
    let oid_at = der
        .windows(X25519_OID.len())
        .position(|w| w == X25519_OID)?;
    let rest = &der[oid_at + X25519_OID.len()..];
    let prefix_at = rest
        .windows(X25519_KEY_PREFIX.len())
        .position(|w| w == X25519_KEY_PREFIX)?;
    let key_start = prefix_at + X25519_KEY_PREFIX.len();
    rest.get(key_start..key_start + 32)?.try_into().ok()
}

/// Minimal DER-shaped device certificate carrying `public_key`.
pub fn device_certificate_with_key(public_key: &[u8; 32]) -> Vec<u8> {
    // SEQUENCE { SEQUENCE { OID x25519 } BIT STRING key }
    let mut spki = vec![0x30, 0x05];
    spki.extend_from_slice(&X25519_OID);
    spki.extend_from_slice(&X25519_KEY_PREFIX);
    spki.extend_from_slice(public_key);

    let mut der = vec![0x30, spki.len() as u8 + 2, 0x30, spki.len() as u8];
    der.extend_from_slice(&spki);
    der
}
