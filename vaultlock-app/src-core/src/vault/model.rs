//! Persisted session records.
//!
//! These are the only shapes in which anything derived from the master key
//! reaches disk: the key wrapped under a password-derived key, and a one-way
//! fingerprint of that password-derived key. Byte fields are hex in JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Algorithm tag written into every [`PersistedSession`].
pub const SESSION_ALGORITHM: &str = "aes-256-gcm";

/// The master key wrapped under one password-derived key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKeySlot {
    /// Matches [`FingerprintPassword::key_id`] of the password that opens it.
    pub key_id: Uuid,
    #[serde(with = "hex")]
    pub nonce: Vec<u8>,
    #[serde(with = "hex")]
    pub ciphertext: Vec<u8>,
}

/// Encrypted-at-rest form of the master key.
///
/// Normally holds exactly one slot. While a password change is in flight it
/// briefly holds two: the retired slot is only pruned after the new
/// fingerprint is durable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub algorithm: String,
    pub slots: Vec<WrappedKeySlot>,
}

impl PersistedSession {
    pub fn new(slot: WrappedKeySlot) -> Self {
        Self {
            algorithm: SESSION_ALGORITHM.to_string(),
            slots: vec![slot],
        }
    }

    pub fn slot(&self, key_id: &Uuid) -> Option<&WrappedKeySlot> {
        self.slots.iter().find(|slot| &slot.key_id == key_id)
    }

    /// Copy with `slot` added, replacing any slot with the same id.
    pub fn with_slot(&self, slot: WrappedKeySlot) -> Self {
        let mut slots: Vec<_> = self
            .slots
            .iter()
            .filter(|s| s.key_id != slot.key_id)
            .cloned()
            .collect();
        slots.push(slot);
        Self {
            algorithm: self.algorithm.clone(),
            slots,
        }
    }

    /// Copy holding only the slot `key_id`, or `None` if there is no such slot.
    pub fn retain_only(&self, key_id: &Uuid) -> Option<Self> {
        self.slot(key_id).map(|slot| Self {
            algorithm: self.algorithm.clone(),
            slots: vec![slot.clone()],
        })
    }
}

/// Verifier for the master password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintPassword {
    pub key_id: Uuid,
    #[serde(with = "hex")]
    pub salt: Vec<u8>,
    /// SHA-256 over a domain tag and the password-derived key.
    #[serde(with = "hex")]
    pub hash: Vec<u8>,
}

/// Biometrically wrapped copy of the master key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintBiometric {
    #[serde(with = "hex")]
    pub iv: Vec<u8>,
    #[serde(with = "hex")]
    pub encrypted_master_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// KDF version the password half was derived with.
    pub version: u32,
    pub master: FingerprintPassword,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub biometric: Option<FingerprintBiometric>,
}

/// Non-secret facts about the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub last_password_use: Option<DateTime<Utc>>,
}
