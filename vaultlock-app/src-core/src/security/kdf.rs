//! Password-based key derivation.
//!
//! The session core only needs "password + salt in, 256-bit key out". The
//! algorithm sits behind [`KeyDerivation`] so the crypto-primitives layer can
//! swap it; the default is Argon2id.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::crypto::KEY_SIZE;
use super::keys::PasswordKey;
use crate::error::{VaultError, VaultResult};

/// Salt size in bytes (128 bits)
pub const SALT_SIZE: usize = 16;

/// Version tag persisted next to every fingerprint derived with Argon2id.
pub const KDF_VERSION_ARGON2ID: u32 = 1;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    /// 64 MB, 3 passes, 4 lanes.
    fn default() -> Self {
        Self {
            memory_kib: 65536,
            iterations: 3,
            parallelism: 4,
        }
    }
}

/// Password-derived-key function supplied by the crypto-primitives layer.
///
/// Implementations are CPU-heavy and synchronous; the session manager always
/// calls them from a blocking pool.
pub trait KeyDerivation: Send + Sync {
    /// Version tag stored in the fingerprint. A stored fingerprint with a
    /// different version can never match.
    fn version(&self) -> u32;

    fn derive(&self, password: &[u8], salt: &[u8]) -> VaultResult<PasswordKey>;
}

/// Argon2id key derivation.
#[derive(Debug, Clone)]
pub struct Argon2Kdf {
    params: KdfParams,
}

impl Argon2Kdf {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> KdfParams {
        self.params
    }
}

impl Default for Argon2Kdf {
    fn default() -> Self {
        Self::new(KdfParams::default())
    }
}

impl KeyDerivation for Argon2Kdf {
    fn version(&self) -> u32 {
        KDF_VERSION_ARGON2ID
    }

    fn derive(&self, password: &[u8], salt: &[u8]) -> VaultResult<PasswordKey> {
        let params = Params::new(
            self.params.memory_kib,
            self.params.iterations,
            self.params.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| VaultError::KeyDerivation(format!("Invalid Argon2 params: {}", e)))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key_bytes = [0u8; KEY_SIZE];
        argon2
            .hash_password_into(password, salt, &mut key_bytes)
            .map_err(|e| VaultError::KeyDerivation(e.to_string()))?;

        debug!("Derived {}-byte key from password", key_bytes.len());
        Ok(PasswordKey::from_bytes(key_bytes))
    }
}
