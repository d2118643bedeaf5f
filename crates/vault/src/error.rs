//! Error types for the vault.

use driver::Error as DriverError;
use thiserror::Error;

/// Vault operation errors.
#[derive(Debug, Error)]
pub enum VaultError {
    // Session errors
    /// No authenticated session, or the device was never initialised.
    #[error("not initialized")]
    NotInitialized,

    /// The chip rejected the pairing key or the handshake did not verify.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The session outlived its time-to-live.
    #[error("session expired")]
    SessionExpired,

    // Catalog errors
    /// No secret or key is stored under this name.
    #[error("secret not found: {0}")]
    SecretNotFound(String),

    /// Every slot in the configured range is taken.
    #[error("capacity exceeded: all {0} slots are in use")]
    CapacityExceeded(usize),

    /// The name breaks the naming rules.
    #[error("invalid secret name: {0}")]
    InvalidName(String),

    /// The value is longer than a slot holds.
    #[error("value of {size} bytes exceeds maximum of {max}")]
    ValueTooLarge {
        /// Offered value length.
        size: usize,
        /// Largest accepted length.
        max: usize,
    },

    /// Zero-length values cannot be stored.
    #[error("empty secret value")]
    EmptyValue,

    // Backend errors
    /// The driver stack failed.
    #[error("hardware error: {0}")]
    Hardware(#[source] DriverError),

    /// A signature or key failed verification.
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Broken internal invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

impl VaultError {
    /// Stable code for the error, suitable for wire responses.
    pub fn code(&self) -> &'static str {
        match self {
            VaultError::NotInitialized => "NOT_INITIALIZED",
            VaultError::AuthenticationFailed(_) => "AUTHENTICATION_FAILED",
            VaultError::SessionExpired => "SESSION_EXPIRED",
            VaultError::SecretNotFound(_) => "SECRET_NOT_FOUND",
            VaultError::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
            VaultError::InvalidName(_) => "INVALID_NAME",
            VaultError::ValueTooLarge { .. } | VaultError::EmptyValue => "INVALID_VALUE",
            VaultError::Hardware(_) => "HARDWARE_ERROR",
            VaultError::Crypto(_) => "CRYPTO_ERROR",
            VaultError::Internal(_) => "INTERNAL",
        }
    }
}

impl From<DriverError> for VaultError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::AuthenticationFailed(reason) => VaultError::AuthenticationFailed(reason),
            DriverError::SessionExpired => VaultError::SessionExpired,
            DriverError::NoSession(_) => VaultError::NotInitialized,
            DriverError::Crypto(reason) => VaultError::Crypto(reason),
            other => VaultError::Hardware(other),
        }
    }
}

/// Result type for vault operations.
pub type Result<T> = std::result::Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;
    use driver::{ChipMode, SessionState};

    #[test]
    fn test_vault_error_display() {
        assert_eq!(VaultError::NotInitialized.to_string(), "not initialized");
        assert_eq!(VaultError::SessionExpired.to_string(), "session expired");
        assert_eq!(
            VaultError::SecretNotFound("db_password".to_string()).to_string(),
            "secret not found: db_password"
        );
        assert_eq!(
            VaultError::CapacityExceeded(128).to_string(),
            "capacity exceeded: all 128 slots are in use"
        );
        assert_eq!(
            VaultError::ValueTooLarge { size: 500, max: 444 }.to_string(),
            "value of 500 bytes exceeds maximum of 444"
        );
    }

    #[test]
    fn test_hardware_error_display() {
        let err = VaultError::Hardware(DriverError::NotReady(ChipMode::Startup));
        assert_eq!(err.to_string(), "hardware error: chip not ready: mode is startup");
    }

    #[test]
    fn test_driver_error_mapping() {
        assert!(matches!(
            VaultError::from(DriverError::AuthenticationFailed("tag".to_string())),
            VaultError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            VaultError::from(DriverError::SessionExpired),
            VaultError::SessionExpired
        ));
        assert!(matches!(
            VaultError::from(DriverError::NoSession(SessionState::Aborted)),
            VaultError::NotInitialized
        ));
        assert!(matches!(
            VaultError::from(DriverError::Timeout { attempts: 3 }),
            VaultError::Hardware(DriverError::Timeout { attempts: 3 })
        ));
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(VaultError::NotInitialized.code(), "NOT_INITIALIZED");
        assert_eq!(VaultError::InvalidName("1x".to_string()).code(), "INVALID_NAME");
        assert_eq!(VaultError::EmptyValue.code(), "INVALID_VALUE");
        assert_eq!(
            VaultError::Hardware(DriverError::ChipCrc).code(),
            "HARDWARE_ERROR"
        );
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<VaultError>();
    }
}
