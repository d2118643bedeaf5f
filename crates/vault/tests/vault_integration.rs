//! Integration tests for the vault against the simulated chip.
//!
//! These tests cover:
//! - Secret storage, rotation, listing and deletion
//! - Session lifecycle and failure handling
//! - Hardware attestation and chip-resident signing keys
//! - Building a vault from a configuration file

use driver::crypto::{CryptoProvider, RustCrypto};
use driver::mock::{MockLink, SimulatedChip};
use driver::{ChipMode, Error as DriverError, PairingKeySlot};
use tempfile::TempDir;
use vault::{Config, Vault, VaultError};

type Keys = ([u8; 32], [u8; 32]);

fn setup_with(seed: u64, config: Config) -> (Vault<MockLink>, SimulatedChip, Keys) {
    let chip = SimulatedChip::new(seed);
    let keys = chip.provision_pairing_key(PairingKeySlot::SLOT_0);
    let mut vault = Vault::new(MockLink::with_chip(&chip), config);
    assert_eq!(vault.init().unwrap(), ChipMode::Ready);
    (vault, chip, keys)
}

/// An initialised vault with an open session.
fn authenticated(seed: u64) -> (Vault<MockLink>, SimulatedChip, Keys) {
    let (mut vault, chip, keys) = setup_with(seed, Config::default());
    vault.authenticate(None, &keys.0, &keys.1).unwrap();
    (vault, chip, keys)
}

fn verify(public_key: &[u8], data: &[u8], signature: &[u8]) -> bool {
    let digest = RustCrypto.sha256(&[data]);
    RustCrypto
        .ecdsa_p256_verify(
            public_key.try_into().unwrap(),
            &digest,
            signature.try_into().unwrap(),
        )
        .unwrap()
}

// =============================================================================
// Secret Storage Tests
// =============================================================================

#[test]
fn test_store_retrieve_list_delete() {
    let (mut vault, chip, _) = authenticated(10);

    let first = vault.store("db_password", b"hunter2").unwrap();
    let second = vault.store("api.key-v2", b"sk_live_123").unwrap();
    assert_eq!(first.slot, 0);
    assert_eq!(second.slot, 1);
    assert_eq!(first.version, 1);
    assert_eq!(chip.r_mem_slot(0).unwrap(), b"hunter2");

    assert_eq!(vault.retrieve("db_password").unwrap().as_slice(), b"hunter2");
    assert_eq!(vault.retrieve("api.key-v2").unwrap().as_slice(), b"sk_live_123");

    let names: Vec<_> = vault.list().unwrap().into_iter().map(|m| m.name).collect();
    assert_eq!(names, vec!["api.key-v2", "db_password"]);

    assert!(vault.delete("db_password").unwrap());
    assert!(chip.r_mem_slot(0).is_none());
    assert!(matches!(
        vault.retrieve("db_password"),
        Err(VaultError::SecretNotFound(name)) if name == "db_password"
    ));
    assert!(!vault.delete("db_password").unwrap());
    assert_eq!(vault.list().unwrap().len(), 1);
}

#[test]
fn test_rotation_reuses_slot_and_bumps_version() {
    let (mut vault, chip, _) = authenticated(11);

    vault.store("token", b"v1").unwrap();
    let rotated = vault.store("token", b"version-two").unwrap();

    assert_eq!(rotated.slot, 0);
    assert_eq!(rotated.version, 2);
    assert_eq!(rotated.value_len, 11);
    assert!(rotated.updated_at >= rotated.created_at);
    assert_eq!(chip.r_mem_slot(0).unwrap(), b"version-two");
    assert_eq!(vault.retrieve("token").unwrap().as_slice(), b"version-two");
}

#[test]
fn test_freed_slot_is_reused() {
    let (mut vault, _, _) = authenticated(12);

    vault.store("a", b"1").unwrap();
    vault.store("b", b"2").unwrap();
    vault.delete("a").unwrap();

    assert_eq!(vault.store("c", b"3").unwrap().slot, 0);
}

#[test]
fn test_capacity_exceeded() {
    let mut config = Config::default();
    config.storage.data_slot_count = 2;
    let (mut vault, _, keys) = setup_with(13, config);
    vault.authenticate(None, &keys.0, &keys.1).unwrap();

    vault.store("a", b"1").unwrap();
    vault.store("b", b"2").unwrap();
    assert!(matches!(
        vault.store("c", b"3"),
        Err(VaultError::CapacityExceeded(2))
    ));
    // Rotating an existing name still works at capacity.
    assert_eq!(vault.store("a", b"11").unwrap().version, 2);
    assert_eq!(vault.discover().max_secrets, 2);
}

#[test]
fn test_largest_value_round_trips() {
    let (mut vault, _, _) = authenticated(14);
    let value = vec![0x5A; 444];

    vault.store("blob", &value).unwrap();

    assert_eq!(vault.retrieve("blob").unwrap().as_slice(), value.as_slice());
}

#[test]
fn test_invalid_names_rejected() {
    let (mut vault, _, _) = authenticated(15);

    for name in ["", "1st", "with space", "semi;colon"] {
        assert!(matches!(vault.store(name, b"x"), Err(VaultError::InvalidName(_))));
        assert!(matches!(vault.retrieve(name), Err(VaultError::InvalidName(_))));
    }
}

// =============================================================================
// Session Tests
// =============================================================================

#[test]
fn test_authenticate_uses_workspace() {
    let (mut vault, _, keys) = setup_with(20, Config::default());

    let session = vault.authenticate(Some("payments"), &keys.0, &keys.1).unwrap();

    assert_eq!(session.workspace, "payments");
    assert_eq!(session.ttl_secs, 300);
    assert_eq!(vault.session(), Some(&session));
    assert!(vault.session_active());
}

#[test]
fn test_reauthenticate_issues_new_session() {
    let (mut vault, _, keys) = authenticated(21);
    let first = vault.session().cloned().unwrap();

    let second = vault.authenticate(None, &keys.0, &keys.1).unwrap();

    assert_ne!(first.id, second.id);
    assert!(vault.session_active());
}

#[test]
fn test_wrong_pairing_key_fails_authentication() {
    let (mut vault, _, keys) = setup_with(22, Config::default());
    let mut wrong_private = keys.0;
    wrong_private[0] ^= 0xFF;

    let err = vault.authenticate(None, &wrong_private, &keys.1).unwrap_err();

    assert!(matches!(err, VaultError::AuthenticationFailed(_)));
    assert_eq!(err.code(), "AUTHENTICATION_FAILED");
    assert!(!vault.session_active());
    assert!(matches!(vault.list(), Err(VaultError::NotInitialized)));
}

#[test]
fn test_close_ends_session() {
    let (mut vault, chip, _) = authenticated(23);
    vault.store("a", b"1").unwrap();

    assert!(vault.close());
    assert!(!chip.has_session());
    assert!(!vault.session_active());
    assert!(matches!(vault.retrieve("a"), Err(VaultError::NotInitialized)));
    assert!(!vault.close());
}

#[test]
fn test_zero_ttl_session_expires_on_first_use() {
    let mut config = Config::default();
    config.session.ttl_secs = 0;
    let (mut vault, _, keys) = setup_with(24, config);

    let err = vault.authenticate(None, &keys.0, &keys.1).unwrap_err();

    assert!(matches!(err, VaultError::SessionExpired));
    assert!(!vault.session_active());
}

#[test]
fn test_tampered_result_faults_session() {
    let (mut vault, chip, _) = authenticated(25);
    vault.store("a", b"1").unwrap();

    chip.tamper_next_result();
    let err = vault.retrieve("a").unwrap_err();

    assert!(matches!(err, VaultError::Hardware(DriverError::SessionFault(_))));
    assert!(!vault.session_active());
    assert!(matches!(vault.retrieve("a"), Err(VaultError::NotInitialized)));
}

#[test]
fn test_catalog_survives_reinit() {
    let (mut vault, _, keys) = authenticated(26);
    vault.store("persistent", b"still here").unwrap();

    vault.deinit().unwrap();
    assert!(!vault.session_active());
    assert_eq!(vault.init().unwrap(), ChipMode::Ready);
    vault.authenticate(None, &keys.0, &keys.1).unwrap();

    assert_eq!(vault.retrieve("persistent").unwrap().as_slice(), b"still here");
}

#[test]
fn test_chip_stuck_in_startup() {
    let chip = SimulatedChip::new(27).with_invalid_firmware();
    let keys = chip.provision_pairing_key(PairingKeySlot::SLOT_0);
    let mut vault = Vault::new(MockLink::with_chip(&chip), Config::default());

    assert_eq!(vault.init().unwrap(), ChipMode::Startup);
    let err = vault.authenticate(None, &keys.0, &keys.1).unwrap_err();

    assert!(matches!(
        err,
        VaultError::Hardware(DriverError::NotReady(ChipMode::Startup))
    ));
    assert_eq!(err.code(), "HARDWARE_ERROR");
}

// =============================================================================
// Hardware Extension Tests
// =============================================================================

#[test]
fn test_hw_challenge_verifies() {
    let (mut vault, _, _) = authenticated(30);

    let attestation = vault.hw_challenge().unwrap();

    assert!(attestation.verified);
    assert_eq!(attestation.manufacturer, "Tropic Square");
    assert_eq!(attestation.model, "TROPIC01");
    assert_eq!(attestation.firmware_version, "1.2.0");
    assert_eq!(attestation.serial.len(), 256);
    assert!(attestation.subject.is_none());
    assert_eq!(attestation.challenge.len(), 32);
    assert!(!attestation.certificate.is_empty());
    assert!(verify(
        &attestation.public_key,
        &attestation.challenge,
        &attestation.signature
    ));
}

#[test]
fn test_hw_challenge_reuses_attestation_key() {
    let (mut vault, _, _) = authenticated(31);

    let first = vault.hw_challenge().unwrap();
    let second = vault.hw_challenge().unwrap();

    assert_eq!(first.public_key, second.public_key);
    assert_ne!(first.challenge, second.challenge);
}

#[test]
fn test_hw_attest_secret() {
    let (mut vault, _, _) = authenticated(32);
    vault.store("db_password", b"hunter2").unwrap();

    let attestation = vault.hw_attest("db_password").unwrap();

    assert!(attestation.verified);
    assert_eq!(attestation.subject.as_deref(), Some("db_password"));
    assert!(matches!(
        vault.hw_attest("missing"),
        Err(VaultError::SecretNotFound(_))
    ));
}

#[test]
fn test_signing_key_signs_and_rotates() {
    let (mut vault, _, _) = authenticated(33);

    let key = vault.generate_signing_key("release").unwrap();
    assert_eq!(key.slot, 1);
    assert_eq!(key.version, 1);
    assert_eq!(key.public_key.len(), 64);

    let signature = vault.hw_sign("release", b"artifact bytes").unwrap();
    assert!(verify(&key.public_key, b"artifact bytes", &signature));
    assert!(!verify(&key.public_key, b"other bytes", &signature));

    let rotated = vault.generate_signing_key("release").unwrap();
    assert_eq!(rotated.slot, 1);
    assert_eq!(rotated.version, 2);
    assert_ne!(rotated.public_key, key.public_key);

    let signature = vault.hw_sign("release", b"artifact bytes").unwrap();
    assert!(verify(&rotated.public_key, b"artifact bytes", &signature));
    assert_eq!(vault.signing_keys().unwrap().len(), 1);
}

#[test]
fn test_hw_sign_unknown_key() {
    let (mut vault, _, _) = authenticated(34);

    assert!(matches!(
        vault.hw_sign("nope", b"data"),
        Err(VaultError::SecretNotFound(_))
    ));
}

// =============================================================================
// Configuration Tests
// =============================================================================

#[test]
fn test_vault_from_config_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[session]
workspace = "ops"
ttl_secs = 120

[storage]
first_data_slot = 200
data_slot_count = 4
"#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    config.validate().unwrap();
    let (mut vault, chip, keys) = setup_with(40, config);

    let session = vault.authenticate(None, &keys.0, &keys.1).unwrap();
    let stored = vault.store("cfg", b"value").unwrap();

    assert_eq!(session.workspace, "ops");
    assert_eq!(session.ttl_secs, 120);
    assert_eq!(stored.slot, 200);
    assert_eq!(chip.r_mem_slot(200).unwrap(), b"value");
    assert_eq!(vault.discover().max_secrets, 4);
}
