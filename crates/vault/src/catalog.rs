//! Host-side name to slot catalog.
//!
//! The chip stores raw bytes per slot and knows nothing about names; the
//! catalog maps names onto a contiguous slot range and hands out the lowest
//! free slot.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{Result, VaultError};

/// Longest accepted secret or key name.
pub const MAX_NAME_LEN: usize = 255;

/// Check a secret or key name.
///
/// Names are 1 to 255 ASCII characters, start with a letter and continue
/// with letters, digits, `_`, `.` or `-`.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(VaultError::InvalidName("name is empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(VaultError::InvalidName(format!(
            "name of {} bytes exceeds {}",
            name.len(),
            MAX_NAME_LEN
        )));
    }

    let mut chars = name.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphabetic()) {
        return Err(VaultError::InvalidName(format!(
            "{:?} must start with a letter",
            name
        )));
    }
    if let Some(bad) = chars.find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))) {
        return Err(VaultError::InvalidName(format!(
            "{:?} contains {:?}",
            name, bad
        )));
    }
    Ok(())
}

/// Public description of one catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretMetadata {
    /// Entry name.
    pub name: String,
    /// Chip slot holding the entry.
    pub slot: u16,
    /// Unix seconds of the first store.
    pub created_at: u64,
    /// Unix seconds of the last store.
    pub updated_at: u64,
    /// Starts at 1, incremented on each rotation.
    pub version: u32,
    /// Stored length in bytes.
    pub value_len: usize,
}

/// Names mapped onto `first_slot..first_slot + capacity`.
#[derive(Debug, Clone)]
pub struct SlotCatalog {
    first_slot: u16,
    capacity: u16,
    entries: BTreeMap<String, SecretMetadata>,
}

impl SlotCatalog {
    pub fn new(first_slot: u16, capacity: u16) -> Self {
        Self {
            first_slot,
            capacity,
            entries: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&SecretMetadata> {
        self.entries.get(name)
    }

    /// Lowest slot in the range not owned by any entry.
    pub fn free_slot(&self) -> Result<u16> {
        (0..self.capacity)
            .map(|offset| self.first_slot + offset)
            .find(|slot| !self.entries.values().any(|entry| entry.slot == *slot))
            .ok_or(VaultError::CapacityExceeded(self.capacity()))
    }

    /// Record a store of `value_len` bytes under `name` in `slot`.
    ///
    /// A known name keeps its creation time and has its version bumped.
    pub fn record(&mut self, name: &str, slot: u16, value_len: usize, now: u64) -> &SecretMetadata {
        let entry = self
            .entries
            .entry(name.to_string())
            .and_modify(|entry| {
                entry.slot = slot;
                entry.updated_at = now;
                entry.version += 1;
                entry.value_len = value_len;
            })
            .or_insert_with(|| SecretMetadata {
                name: name.to_string(),
                slot,
                created_at: now,
                updated_at: now,
                version: 1,
                value_len,
            });
        entry
    }

    pub fn remove(&mut self, name: &str) -> Option<SecretMetadata> {
        self.entries.remove(name)
    }

    /// Entries ordered by name.
    pub fn list(&self) -> Vec<SecretMetadata> {
        self.entries.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
