//! Password verification and master-key wrapping.
//!
//! The password-derived key never touches disk. What does: a SHA-256 hash of
//! it under a domain tag (the fingerprint) and the master key sealed under it
//! (a key slot). Slot ciphertext binds the slot id as associated data, so a
//! slot cannot be swapped for another one without failing authentication.

use std::sync::Arc;

use subtle::ConstantTimeEq;
use uuid::Uuid;
use zeroize::Zeroize;

use crate::error::{VaultError, VaultResult};
use crate::security::crypto::{self, random_bytes, NONCE_SIZE};
use crate::security::kdf::SALT_SIZE;
use crate::security::{KeyDerivation, MasterKey, PasswordKey};
use crate::vault::{FingerprintPassword, WrappedKeySlot};

const FINGERPRINT_DOMAIN: &[u8] = b"vaultlock.fingerprint.v1";
const SLOT_DOMAIN: &[u8] = b"vaultlock.slot.v1";

/// A password-derived key together with the fingerprint data it came from.
pub(crate) struct PasswordMaterial {
    pub key_id: Uuid,
    pub salt: Vec<u8>,
    pub key: PasswordKey,
}

impl PasswordMaterial {
    /// Fresh salt and slot id for a new password.
    pub async fn generate(kdf: Arc<dyn KeyDerivation>, password: &str) -> VaultResult<Self> {
        let salt = random_bytes::<SALT_SIZE>().to_vec();
        let key = derive(kdf, password, salt.clone()).await?;
        Ok(Self {
            key_id: Uuid::new_v4(),
            salt,
            key,
        })
    }

    /// Re-derive the key a stored fingerprint was made from.
    pub async fn recover(
        kdf: Arc<dyn KeyDerivation>,
        password: &str,
        stored: &FingerprintPassword,
    ) -> VaultResult<Self> {
        let key = derive(kdf, password, stored.salt.clone()).await?;
        Ok(Self {
            key_id: stored.key_id,
            salt: stored.salt.clone(),
            key,
        })
    }

    pub fn fingerprint(&self) -> FingerprintPassword {
        FingerprintPassword {
            key_id: self.key_id,
            salt: self.salt.clone(),
            hash: fingerprint_hash(&self.key).to_vec(),
        }
    }

    /// Constant-time comparison against a stored fingerprint.
    pub fn matches(&self, stored: &FingerprintPassword) -> bool {
        let hash = fingerprint_hash(&self.key);
        stored.key_id == self.key_id && bool::from(hash.as_slice().ct_eq(&stored.hash))
    }

    pub fn wrap(&self, master: &MasterKey) -> VaultResult<WrappedKeySlot> {
        let nonce = random_bytes::<NONCE_SIZE>();
        let ciphertext = crypto::encrypt_with_nonce(
            self.key.as_bytes(),
            &nonce,
            master.as_bytes(),
            &slot_aad(&self.key_id),
        )?;
        Ok(WrappedKeySlot {
            key_id: self.key_id,
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    /// Unwrap a slot. Failure here means the slot is unusable, not that the
    /// password was wrong: the password was already checked against the
    /// fingerprint.
    pub fn unwrap(&self, slot: &WrappedKeySlot) -> VaultResult<MasterKey> {
        let mut plaintext = crypto::decrypt_with_nonce(
            self.key.as_bytes(),
            &slot.nonce,
            &slot.ciphertext,
            &slot_aad(&slot.key_id),
        )
        .map_err(|_| VaultError::Corrupted("stored master key could not be decrypted".into()))?;
        let master = MasterKey::from_slice(&plaintext);
        plaintext.zeroize();
        master
    }
}

fn fingerprint_hash(key: &PasswordKey) -> [u8; 32] {
    crypto::sha256(&[FINGERPRINT_DOMAIN, key.as_bytes()])
}

fn slot_aad(key_id: &Uuid) -> Vec<u8> {
    let mut aad = SLOT_DOMAIN.to_vec();
    aad.extend_from_slice(key_id.as_bytes());
    aad
}

async fn derive(
    kdf: Arc<dyn KeyDerivation>,
    password: &str,
    salt: Vec<u8>,
) -> VaultResult<PasswordKey> {
    let mut password = password.as_bytes().to_vec();
    tokio::task::spawn_blocking(move || {
        let key = kdf.derive(&password, &salt);
        password.zeroize();
        key
    })
    .await
    .map_err(|e| VaultError::KeyDerivation(e.to_string()))?
}
