//! Key material wrappers.
//!
//! Both types zeroize on drop and never print their bytes.

use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::crypto::{random_bytes, KEY_SIZE};
use crate::error::{VaultError, VaultResult};

/// The live symmetric key that decrypts the vault.
///
/// Only ever exists in memory. It reaches disk exclusively in wrapped form
/// (see [`crate::vault::PersistedSession`]).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_SIZE],
}

impl MasterKey {
    /// Generate a fresh random master key.
    pub fn generate() -> Self {
        Self {
            key: random_bytes::<KEY_SIZE>(),
        }
    }

    /// Build a key from unwrapped bytes.
    ///
    /// The input is not consumed; callers holding it in a buffer should
    /// zeroize that buffer themselves.
    pub fn from_slice(slice: &[u8]) -> VaultResult<Self> {
        if slice.len() != KEY_SIZE {
            return Err(VaultError::Corrupted(format!(
                "Master key must be {} bytes, got {}",
                KEY_SIZE,
                slice.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(slice);
        Ok(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl PartialEq for MasterKey {
    fn eq(&self, other: &Self) -> bool {
        self.key.ct_eq(&other.key).into()
    }
}

impl Eq for MasterKey {}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log the actual key material
        f.debug_struct("MasterKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Key derived from the master password. Wraps and unwraps the master key.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PasswordKey {
    key: [u8; KEY_SIZE],
}

impl PasswordKey {
    pub fn from_bytes(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl std::fmt::Debug for PasswordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}
