//! Name-based secret vault on top of the secure channel.
//!
//! Secrets live in the chip's user data slots and signing keys in its ECC
//! slots. Names are mapped onto slots by two in-memory [`SlotCatalog`]s.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use driver::{
    ChipMode, CryptoProvider, Device, EccCurve, Error as DriverError, LinkDriver, PairingKeySlot,
    RustCrypto, SessionState,
};
use serde::Serialize;
use zeroize::Zeroizing;

use crate::catalog::{validate_name, SecretMetadata, SlotCatalog};
use crate::config::Config;
use crate::error::{Result, VaultError};

/// Protocol version reported by [`Vault::discover`].
pub const AVP_VERSION: &str = "0.1.0";

/// Prefix of every session id.
pub const SESSION_ID_PREFIX: &str = "avp_sess_";

/// Chip random bytes behind a session id (hex encoded to 32 characters).
const SESSION_ID_RANDOM_LEN: usize = 16;

/// Length of attestation challenges and nonces.
const CHALLENGE_LEN: usize = 32;

const MANUFACTURER: &str = "Tropic Square";
const MODEL: &str = "TROPIC01";

/// Domain separator of `hw_attest` digests.
const ATTEST_DOMAIN: &[u8] = b"avp-attest-v1";

/// What the vault offers, available without a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discovery {
    pub version: String,
    pub conformance: String,
    pub attestation: bool,
    pub rotation: bool,
    pub hardware_signing: bool,
    pub max_secrets: usize,
}

/// An authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// `avp_sess_` followed by 32 hex characters of chip randomness.
    pub id: String,
    pub workspace: String,
    pub ttl_secs: u64,
    /// Unix seconds.
    pub created_at: u64,
    /// Unix seconds.
    pub expires_at: u64,
}

/// Result of a hardware challenge or a secret attestation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attestation {
    /// The chip signature verified against the attestation public key.
    pub verified: bool,
    pub manufacturer: String,
    pub model: String,
    /// `major.minor.patch` of the application firmware.
    pub firmware_version: String,
    /// Hex encoded chip id block.
    pub serial: String,
    /// Name of the attested secret; `None` for a plain challenge.
    pub subject: Option<String>,
    pub challenge: Vec<u8>,
    /// Raw `r || s`.
    pub signature: Vec<u8>,
    /// Attestation public key, `x || y`.
    pub public_key: Vec<u8>,
    /// Device certificate from the chip's certificate store.
    pub certificate: Vec<u8>,
}

/// A named signing key held by the chip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SigningKey {
    pub name: String,
    pub slot: u16,
    pub version: u32,
    /// P-256 public key, `x || y`.
    pub public_key: Vec<u8>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Format `[build, patch, minor, major]` as `major.minor.patch`.
fn format_firmware_version(raw: [u8; 4]) -> String {
    let [_build, patch, minor, major] = raw;
    format!("{}.{}.{}", major, minor, patch)
}

/// Secret vault backed by one chip.
pub struct Vault<L: LinkDriver, C: CryptoProvider = RustCrypto> {
    device: Device<L, C>,
    config: Config,
    secrets: SlotCatalog,
    signing_keys: SlotCatalog,
    attestation_key: Option<[u8; 64]>,
    session: Option<SessionInfo>,
}

impl<L: LinkDriver> Vault<L> {
    /// Create a vault over `link` with the default crypto provider.
    pub fn new(link: L, config: Config) -> Self {
        Self::with_crypto(link, RustCrypto, config)
    }
}

impl<L: LinkDriver, C: CryptoProvider> Vault<L, C> {
    /// Create a vault with a custom crypto provider.
    pub fn with_crypto(link: L, crypto: C, config: Config) -> Self {
        let mut device = Device::with_crypto(link, crypto, config.link.clone());
        device.set_session_ttl(Some(config.session.ttl()));
        let storage = &config.storage;
        Self {
            device,
            secrets: SlotCatalog::new(storage.first_data_slot, storage.data_slot_count),
            signing_keys: SlotCatalog::new(storage.first_signing_slot, storage.signing_slot_count),
            attestation_key: None,
            session: None,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The underlying device handle.
    pub fn device(&self) -> &Device<L, C> {
        &self.device
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Bring the chip up. Returns the mode it settled in.
    pub fn init(&mut self) -> Result<ChipMode> {
        let mode = self.device.init()?;
        if mode != ChipMode::Ready {
            tracing::warn!(mode = %mode, "chip did not reach application mode");
        }
        Ok(mode)
    }

    /// Close any session and release the link.
    ///
    /// The catalogs survive so a later `init` and `authenticate` find the
    /// same secrets.
    pub fn deinit(&mut self) -> Result<()> {
        self.session = None;
        self.attestation_key = None;
        self.device.deinit()?;
        Ok(())
    }

    /// Capabilities of this vault. Needs no session.
    pub fn discover(&self) -> Discovery {
        Discovery {
            version: AVP_VERSION.to_string(),
            conformance: "hardware".to_string(),
            attestation: true,
            rotation: true,
            hardware_signing: self.signing_keys.capacity() > 0,
            max_secrets: self.secrets.capacity(),
        }
    }

    // ========================================================================
    // Session
    // ========================================================================

    /// Open a secure session with the host pairing key pair.
    ///
    /// `workspace` defaults to the configured one. Any previous session is
    /// aborted first.
    pub fn authenticate(
        &mut self,
        workspace: Option<&str>,
        pairing_private: &[u8; 32],
        pairing_public: &[u8; 32],
    ) -> Result<SessionInfo> {
        let slot = PairingKeySlot::new(self.config.session.pairing_slot).ok_or_else(|| {
            VaultError::Internal(format!(
                "pairing slot {} out of range",
                self.config.session.pairing_slot
            ))
        })?;

        if self.session.take().is_some() {
            self.device.abort_session();
        }
        self.device.start_secure_session(pairing_private, pairing_public, slot)?;

        let random = match self.device.random_value_get(SESSION_ID_RANDOM_LEN) {
            Ok(random) => random,
            Err(err) => {
                self.device.abort_session();
                return Err(err.into());
            }
        };
        let created_at = unix_now();
        let ttl_secs = self.config.session.ttl_secs;
        let info = SessionInfo {
            id: format!("{}{}", SESSION_ID_PREFIX, hex::encode(random.as_slice())),
            workspace: workspace
                .unwrap_or(&self.config.session.workspace)
                .to_string(),
            ttl_secs,
            created_at,
            expires_at: created_at + ttl_secs,
        };
        tracing::info!(workspace = %info.workspace, ttl_secs, "vault session opened");
        self.session = Some(info.clone());
        Ok(info)
    }

    /// The current session record, if one was opened and not closed.
    pub fn session(&self) -> Option<&SessionInfo> {
        self.session.as_ref()
    }

    /// True while the secure session is live and inside its time-to-live.
    pub fn session_active(&self) -> bool {
        self.session.is_some()
            && self.device.session().is_active()
            && !self.ttl_elapsed()
    }

    /// End the session. Returns false when none was open.
    pub fn close(&mut self) -> bool {
        let had_session = self.session.take().is_some();
        let aborted = self.device.abort_session();
        if had_session {
            tracing::info!("vault session closed");
        }
        had_session || aborted
    }

    fn ttl_elapsed(&self) -> bool {
        let ttl = self.device.session_ttl().unwrap_or(Duration::MAX);
        self.device
            .session()
            .established_at()
            .is_some_and(|established| established.elapsed() >= ttl)
    }

    fn require_session(&self) -> Result<()> {
        if self.session.is_none() {
            return Err(VaultError::NotInitialized);
        }
        match self.device.session_state() {
            SessionState::Active if self.ttl_elapsed() => Err(VaultError::SessionExpired),
            SessionState::Active => Ok(()),
            SessionState::Expired => Err(VaultError::SessionExpired),
            _ => Err(VaultError::NotInitialized),
        }
    }

    // ========================================================================
    // Secrets
    // ========================================================================

    /// Store `value` under `name`, rotating it if the name exists.
    pub fn store(&mut self, name: &str, value: &[u8]) -> Result<SecretMetadata> {
        validate_name(name)?;
        if value.is_empty() {
            return Err(VaultError::EmptyValue);
        }
        let max = self.config.storage.max_value_len;
        if value.len() > max {
            return Err(VaultError::ValueTooLarge {
                size: value.len(),
                max,
            });
        }
        self.require_session()?;

        let (slot, rotating) = match self.secrets.get(name) {
            Some(existing) => (existing.slot, true),
            None => (self.secrets.free_slot()?, false),
        };
        // Slots only accept writes when empty.
        self.device.r_mem_data_erase(slot)?;
        if let Err(err) = self.device.r_mem_data_write(slot, value) {
            if rotating {
                // The previous value went with the erase.
                tracing::warn!(slot, error = %err, "rotation failed after erase; secret dropped");
                self.secrets.remove(name);
            }
            return Err(err.into());
        }

        let metadata = self.secrets.record(name, slot, value.len(), unix_now()).clone();
        tracing::debug!(slot, version = metadata.version, "secret stored");
        Ok(metadata)
    }

    /// Read back the value stored under `name`.
    pub fn retrieve(&mut self, name: &str) -> Result<Zeroizing<Vec<u8>>> {
        validate_name(name)?;
        self.require_session()?;

        let slot = self
            .secrets
            .get(name)
            .map(|entry| entry.slot)
            .ok_or_else(|| VaultError::SecretNotFound(name.to_string()))?;
        match self.device.r_mem_data_read(slot)? {
            Some(value) => Ok(value),
            None => {
                tracing::warn!(slot, "catalog entry points at an empty slot");
                self.secrets.remove(name);
                Err(VaultError::SecretNotFound(name.to_string()))
            }
        }
    }

    /// Erase the secret under `name`. Returns false when there was none.
    pub fn delete(&mut self, name: &str) -> Result<bool> {
        validate_name(name)?;
        self.require_session()?;

        let Some(slot) = self.secrets.get(name).map(|entry| entry.slot) else {
            return Ok(false);
        };
        self.device.r_mem_data_erase(slot)?;
        self.secrets.remove(name);
        tracing::debug!(slot, "secret deleted");
        Ok(true)
    }

    /// Metadata of every stored secret, ordered by name.
    pub fn list(&self) -> Result<Vec<SecretMetadata>> {
        self.require_session()?;
        Ok(self.secrets.list())
    }

    // ========================================================================
    // Hardware extension
    // ========================================================================

    /// Prove the chip holds the attestation key by signing a fresh challenge.
    pub fn hw_challenge(&mut self) -> Result<Attestation> {
        self.require_session()?;
        let challenge = self.device.random_value_get(CHALLENGE_LEN)?;
        let digest = self.device.crypto().sha256(&[challenge.as_slice()]);
        self.attest(None, challenge.to_vec(), &digest)
    }

    /// Bind the secret `name` and its slot to a chip signature.
    pub fn hw_attest(&mut self, name: &str) -> Result<Attestation> {
        validate_name(name)?;
        self.require_session()?;
        let entry = self
            .secrets
            .get(name)
            .cloned()
            .ok_or_else(|| VaultError::SecretNotFound(name.to_string()))?;

        let nonce = self.device.random_value_get(CHALLENGE_LEN)?;
        let digest = self.device.crypto().sha256(&[
            ATTEST_DOMAIN,
            entry.name.as_bytes(),
            &entry.slot.to_le_bytes(),
            &entry.version.to_le_bytes(),
            nonce.as_slice(),
        ]);
        self.attest(Some(entry.name), nonce.to_vec(), &digest)
    }

    /// Create (or rotate) the chip-resident signing key `name`.
    pub fn generate_signing_key(&mut self, name: &str) -> Result<SigningKey> {
        validate_name(name)?;
        self.require_session()?;

        let slot = match self.signing_keys.get(name) {
            Some(existing) => existing.slot,
            None => self.signing_keys.free_slot()?,
        };
        self.device.ecc_key_erase(slot)?;
        self.device.ecc_key_generate(slot, EccCurve::P256)?;
        let info = self.device.ecc_key_read(slot)?;

        let entry = self
            .signing_keys
            .record(name, slot, info.public_key.len(), unix_now());
        tracing::debug!(slot, version = entry.version, "signing key generated");
        Ok(SigningKey {
            name: entry.name.clone(),
            slot,
            version: entry.version,
            public_key: info.public_key,
        })
    }

    /// Sign SHA-256(`data`) with the chip-resident key `key_name`.
    pub fn hw_sign(&mut self, key_name: &str, data: &[u8]) -> Result<[u8; 64]> {
        validate_name(key_name)?;
        self.require_session()?;

        let slot = self
            .signing_keys
            .get(key_name)
            .map(|entry| entry.slot)
            .ok_or_else(|| VaultError::SecretNotFound(key_name.to_string()))?;
        let digest = self.device.crypto().sha256(&[data]);
        Ok(self.device.ecdsa_sign(slot, &digest)?)
    }

    /// Metadata of every signing key, ordered by name.
    pub fn signing_keys(&self) -> Result<Vec<SecretMetadata>> {
        self.require_session()?;
        Ok(self.signing_keys.list())
    }

    fn attest(
        &mut self,
        subject: Option<String>,
        challenge: Vec<u8>,
        digest: &[u8; 32],
    ) -> Result<Attestation> {
        let public_key = self.attestation_public_key()?;
        let slot = self.config.storage.attestation_key_slot;
        let signature = self.device.ecdsa_sign(slot, digest)?;
        let verified = self
            .device
            .crypto()
            .ecdsa_p256_verify(&public_key, digest, &signature)?;
        if !verified {
            tracing::warn!(slot, "attestation signature did not verify");
        }

        let serial = hex::encode(self.device.chip_id()?);
        let firmware_version = format_firmware_version(self.device.firmware_version()?);
        let certificate = self.device.certificate_store()?.device().to_vec();

        Ok(Attestation {
            verified,
            manufacturer: MANUFACTURER.to_string(),
            model: MODEL.to_string(),
            firmware_version,
            serial,
            subject,
            challenge,
            signature: signature.to_vec(),
            public_key: public_key.to_vec(),
            certificate,
        })
    }

    /// Public half of the attestation key, generating the key on first use.
    fn attestation_public_key(&mut self) -> Result<[u8; 64]> {
        if let Some(key) = self.attestation_key {
            return Ok(key);
        }
        let slot = self.config.storage.attestation_key_slot;
        let info = match self.device.ecc_key_read(slot) {
            Ok(info) if info.curve == EccCurve::P256 => info,
            Ok(_) | Err(DriverError::CommandFailed(_)) => {
                tracing::info!(slot, "provisioning attestation key");
                self.device.ecc_key_erase(slot)?;
                self.device.ecc_key_generate(slot, EccCurve::P256)?;
                self.device.ecc_key_read(slot)?
            }
            Err(err) => return Err(err.into()),
        };
        let key: [u8; 64] = info.public_key.as_slice().try_into().map_err(|_| {
            VaultError::Internal(format!(
                "attestation key of {} bytes",
                info.public_key.len()
            ))
        })?;
        self.attestation_key = Some(key);
        Ok(key)
    }
}

impl<L: LinkDriver, C: CryptoProvider> std::fmt::Debug for Vault<L, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("device", &self.device)
            .field("workspace", &self.session.as_ref().map(|s| s.workspace.as_str()))
            .field("secrets", &self.secrets.len())
            .field("signing_keys", &self.signing_keys.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driver::l3::command;
    use driver::mock::{MockLink, SimulatedChip};
    use driver::ResultCode;

    fn vault(seed: u64) -> (Vault<MockLink>, [u8; 32], [u8; 32]) {
        let (vault, _chip, private, public) = vault_with_chip(seed);
        (vault, private, public)
    }

    fn vault_with_chip(seed: u64) -> (Vault<MockLink>, SimulatedChip, [u8; 32], [u8; 32]) {
        let chip = SimulatedChip::new(seed);
        let (private, public) = chip.provision_pairing_key(PairingKeySlot::SLOT_0);
        let mut vault = Vault::new(MockLink::with_chip(&chip), Config::default());
        vault.init().unwrap();
        (vault, chip, private, public)
    }

    #[test]
    fn test_format_firmware_version() {
        assert_eq!(format_firmware_version([7, 3, 2, 1]), "1.2.3");
    }

    #[test]
    fn test_discover_without_session() {
        let (vault, _, _) = vault(1);
        let discovery = vault.discover();

        assert_eq!(discovery.version, "0.1.0");
        assert_eq!(discovery.conformance, "hardware");
        assert!(discovery.attestation);
        assert!(discovery.rotation);
        assert!(discovery.hardware_signing);
        assert_eq!(discovery.max_secrets, 128);
    }

    #[test]
    fn test_operations_need_session() {
        let (mut vault, _, _) = vault(2);

        assert!(matches!(vault.store("a", b"x"), Err(VaultError::NotInitialized)));
        assert!(matches!(vault.retrieve("a"), Err(VaultError::NotInitialized)));
        assert!(matches!(vault.list(), Err(VaultError::NotInitialized)));
        assert!(matches!(vault.hw_challenge(), Err(VaultError::NotInitialized)));
        assert!(!vault.session_active());
    }

    #[test]
    fn test_session_id_shape() {
        let (mut vault, private, public) = vault(3);
        let session = vault.authenticate(None, &private, &public).unwrap();

        assert!(session.id.starts_with(SESSION_ID_PREFIX));
        assert_eq!(session.id.len(), SESSION_ID_PREFIX.len() + 32);
        assert!(session.id[SESSION_ID_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
        assert_eq!(session.workspace, "default");
        assert_eq!(session.expires_at - session.created_at, 300);
        assert!(vault.session_active());
    }

    #[test]
    fn test_input_validation_precedes_session_check() {
        let (mut vault, _, _) = vault(4);

        assert!(matches!(vault.store("9lives", b"x"), Err(VaultError::InvalidName(_))));
        assert!(matches!(vault.store("ok", b""), Err(VaultError::EmptyValue)));
        assert!(matches!(
            vault.store("ok", &[0u8; 445]),
            Err(VaultError::ValueTooLarge { size: 445, max: 444 })
        ));
    }

    #[test]
    fn test_debug_does_not_leak_session_id() {
        let (mut vault, private, public) = vault(5);
        let session = vault.authenticate(Some("ci"), &private, &public).unwrap();
        let debug = format!("{:?}", vault);

        assert!(debug.contains("ci"));
        assert!(!debug.contains(&session.id));
    }

    #[test]
    fn test_failed_session_id_draw_aborts_session() {
        let (mut vault, chip, private, public) = vault_with_chip(6);
        chip.fail_next_command(command::RANDOM_VALUE_GET, ResultCode::Fail);

        let err = vault.authenticate(None, &private, &public).unwrap_err();

        assert!(matches!(
            err,
            VaultError::Hardware(DriverError::CommandFailed(ResultCode::Fail))
        ));
        assert!(vault.session().is_none());
        assert_eq!(vault.device().session_state(), SessionState::Aborted);
        assert!(vault.device().session().is_zeroized());
        assert!(!chip.has_session());
        assert!(!vault.session_active());
    }

    #[test]
    fn test_failed_rotation_drops_erased_secret() {
        let (mut vault, chip, private, public) = vault_with_chip(7);
        vault.authenticate(None, &private, &public).unwrap();
        let stored = vault.store("api_key", b"v1").unwrap();

        chip.fail_next_command(command::R_MEM_DATA_WRITE, ResultCode::Fail);
        let err = vault.store("api_key", b"v2").unwrap_err();

        assert!(matches!(
            err,
            VaultError::Hardware(DriverError::CommandFailed(ResultCode::Fail))
        ));
        assert_eq!(chip.r_mem_slot(stored.slot), None);
        assert!(matches!(
            vault.retrieve("api_key"),
            Err(VaultError::SecretNotFound(_))
        ));
        assert!(vault.list().unwrap().is_empty());
    }

    #[test]
    fn test_failed_first_write_leaves_catalog_untouched() {
        let (mut vault, chip, private, public) = vault_with_chip(8);
        vault.authenticate(None, &private, &public).unwrap();

        chip.fail_next_command(command::R_MEM_DATA_WRITE, ResultCode::Fail);
        assert!(vault.store("fresh", b"value").is_err());

        assert!(vault.list().unwrap().is_empty());
        let stored = vault.store("fresh", b"value").unwrap();
        assert_eq!(stored.version, 1);
    }
}
