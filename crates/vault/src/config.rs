//! Configuration management for the vault.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/tropic-vault/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use driver::{PollBudget, TransportConfig, ECC_SLOT_MAX, PAIRING_KEY_SLOTS, R_MEM_DATA_SIZE_MAX, R_MEM_DATA_SLOT_MAX};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("pairing_slot must be between 0 and 3, got {0}")]
    InvalidPairingSlot(u8),

    #[error("ttl_secs must be between 1 and 86400, got {0}")]
    InvalidSessionTtl(u64),

    #[error("workspace must not be empty")]
    EmptyWorkspace,

    #[error("poll budget must be greater than 0")]
    InvalidPollBudget,

    #[error("data slots {first}..{first}+{count} must be non-empty and end at or below slot 511")]
    InvalidDataSlots { first: u16, count: u16 },

    #[error("max_value_len must be between 1 and 444, got {0}")]
    InvalidMaxValueLen(usize),

    #[error("ecc slot must be at most 31, got {0}")]
    InvalidEccSlot(u16),

    #[error("attestation_key_slot {0} overlaps the signing key slots")]
    OverlappingEccSlots(u16),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Longest accepted session time-to-live, in seconds.
const MAX_SESSION_TTL_SECS: u64 = 24 * 60 * 60;

/// Main configuration structure for the vault.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Link timing and polling.
    pub link: TransportConfig,

    /// Secure session configuration.
    pub session: SessionConfig,

    /// Chip slot layout.
    pub storage: StorageConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
}

/// Secure session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Pairing key slot used for the handshake (0-3).
    pub pairing_slot: u8,

    /// Session time-to-live in seconds.
    pub ttl_secs: u64,

    /// Workspace used when `authenticate` is given none.
    pub workspace: String,
}

/// Chip slot layout used by the vault.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// First user data slot holding secrets.
    pub first_data_slot: u16,

    /// Number of user data slots available for secrets.
    pub data_slot_count: u16,

    /// Largest secret value in bytes.
    pub max_value_len: usize,

    /// ECC slot holding the attestation key.
    pub attestation_key_slot: u16,

    /// First ECC slot for named signing keys.
    pub first_signing_slot: u16,

    /// Number of ECC slots for named signing keys.
    pub signing_slot_count: u16,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pairing_slot: 0,
            ttl_secs: 300, // 5 minutes
            workspace: "default".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            first_data_slot: 0,
            data_slot_count: 128,
            max_value_len: R_MEM_DATA_SIZE_MAX,
            attestation_key_slot: 0,
            first_signing_slot: 1,
            signing_slot_count: 31,
        }
    }
}

impl SessionConfig {
    /// The time-to-live as a duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tropic-vault")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TROPIC_VAULT_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TROPIC_VAULT_SESSION_TTL: Override session time-to-live in seconds
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("TROPIC_VAULT_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }

        if let Ok(ttl) = std::env::var("TROPIC_VAULT_SESSION_TTL") {
            if !ttl.is_empty() {
                match ttl.parse::<u64>() {
                    Ok(secs) => {
                        tracing::info!("Overriding session ttl from environment: {}s", secs);
                        self.session.ttl_secs = secs;
                    }
                    Err(_) => {
                        tracing::warn!("Ignoring non-numeric TROPIC_VAULT_SESSION_TTL: {}", ttl);
                    }
                }
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        if self.session.pairing_slot >= PAIRING_KEY_SLOTS {
            return Err(ConfigError::InvalidPairingSlot(self.session.pairing_slot));
        }
        if self.session.ttl_secs == 0 || self.session.ttl_secs > MAX_SESSION_TTL_SECS {
            return Err(ConfigError::InvalidSessionTtl(self.session.ttl_secs));
        }
        if self.session.workspace.is_empty() {
            return Err(ConfigError::EmptyWorkspace);
        }

        match self.link.poll_budget {
            PollBudget::Attempts(0) | PollBudget::ElapsedMs(0) => {
                return Err(ConfigError::InvalidPollBudget)
            }
            _ => {}
        }

        let storage = &self.storage;
        let last_data_slot = u32::from(storage.first_data_slot) + u32::from(storage.data_slot_count);
        if storage.data_slot_count == 0 || last_data_slot > u32::from(R_MEM_DATA_SLOT_MAX) + 1 {
            return Err(ConfigError::InvalidDataSlots {
                first: storage.first_data_slot,
                count: storage.data_slot_count,
            });
        }
        if storage.max_value_len == 0 || storage.max_value_len > R_MEM_DATA_SIZE_MAX {
            return Err(ConfigError::InvalidMaxValueLen(storage.max_value_len));
        }

        if storage.attestation_key_slot > ECC_SLOT_MAX {
            return Err(ConfigError::InvalidEccSlot(storage.attestation_key_slot));
        }
        if storage.signing_slot_count > 0 {
            let last_signing = storage
                .first_signing_slot
                .saturating_add(storage.signing_slot_count - 1);
            if last_signing > ECC_SLOT_MAX {
                return Err(ConfigError::InvalidEccSlot(last_signing));
            }
            if (storage.first_signing_slot..=last_signing).contains(&storage.attestation_key_slot) {
                return Err(ConfigError::OverlappingEccSlots(storage.attestation_key_slot));
            }
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Save configuration to the default path.
    pub fn save_default(&self) -> Result<()> {
        self.save(default_config_path())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
