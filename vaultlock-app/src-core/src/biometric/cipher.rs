//! Deferred-materialization cipher handle.
//!
//! A handle is constructed before the biometric prompt resolves, so its IV
//! is known up front, but it only receives key material once `materialize`
//! runs after the user authenticated. Until then `encode` refuses to work.

use std::sync::{Mutex, MutexGuard};

use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{VaultError, VaultResult};
use crate::security::crypto::{self, random_bytes, KEY_SIZE, NONCE_SIZE};

const BIOMETRIC_AAD: &[u8] = b"vaultlock.biometric";

pub type CipherKey = Zeroizing<[u8; KEY_SIZE]>;

/// What a materializer gets to see of the handle it binds.
#[derive(Debug, Clone, Copy)]
pub struct CipherParams {
    pub for_encryption: bool,
    pub iv: [u8; NONCE_SIZE],
}

/// Supplies key material for a handle. Runs at most once.
pub type Materializer = Box<dyn FnOnce(CipherParams) -> VaultResult<CipherKey> + Send>;

enum CipherState {
    Pending(Materializer),
    Ready(CipherKey),
    /// Encrypt-mode handle that already produced its ciphertext.
    Spent,
    Failed,
}

pub struct BiometricCipherHandle {
    for_encryption: bool,
    iv: [u8; NONCE_SIZE],
    state: Mutex<CipherState>,
}

impl BiometricCipherHandle {
    /// Encrypt-mode handle with a fresh random IV.
    pub fn for_encryption(materialize: Materializer) -> Self {
        Self {
            for_encryption: true,
            iv: random_bytes::<NONCE_SIZE>(),
            state: Mutex::new(CipherState::Pending(materialize)),
        }
    }

    /// Decrypt-mode handle for data sealed under `iv`.
    pub fn for_decryption(iv: &[u8], materialize: Materializer) -> VaultResult<Self> {
        let iv: [u8; NONCE_SIZE] = iv.try_into().map_err(|_| {
            VaultError::Corrupted(format!(
                "Biometric IV must be {} bytes, got {}",
                NONCE_SIZE,
                iv.len()
            ))
        })?;
        Ok(Self {
            for_encryption: false,
            iv,
            state: Mutex::new(CipherState::Pending(materialize)),
        })
    }

    pub fn is_for_encryption(&self) -> bool {
        self.for_encryption
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn is_materialized(&self) -> bool {
        matches!(*self.lock(), CipherState::Ready(_) | CipherState::Spent)
    }

    /// Bind key material. Calling it again after success is a no-op.
    ///
    /// Blocking: materializers may talk to the OS keychain.
    pub fn materialize(&self) -> VaultResult<()> {
        let mut state = self.lock();
        let materializer = match std::mem::replace(&mut *state, CipherState::Failed) {
            CipherState::Pending(materializer) => materializer,
            other @ (CipherState::Ready(_) | CipherState::Spent) => {
                *state = other;
                return Ok(());
            }
            CipherState::Failed => {
                return Err(VaultError::CipherMisuse(
                    "materialize already failed on this cipher".into(),
                ))
            }
        };

        let key = materializer(CipherParams {
            for_encryption: self.for_encryption,
            iv: self.iv,
        })?;
        *state = CipherState::Ready(key);
        debug!(
            "Materialized biometric cipher (for_encryption={})",
            self.for_encryption
        );
        Ok(())
    }

    /// Encrypt or decrypt `input`, depending on the handle's mode.
    ///
    /// Calls are serialized per handle. An encrypt-mode handle encodes once:
    /// a second encryption would reuse the IV.
    pub fn encode(&self, input: &[u8]) -> VaultResult<Vec<u8>> {
        let mut state = self.lock();
        let output = match &*state {
            CipherState::Ready(key) if self.for_encryption => {
                crypto::encrypt_with_nonce(&key[..], &self.iv, input, BIOMETRIC_AAD)?
            }
            CipherState::Ready(key) => {
                crypto::decrypt_with_nonce(&key[..], &self.iv, input, BIOMETRIC_AAD)
                    .map_err(|_| {
                        VaultError::BiometricFailed(
                            "biometric data could not be decrypted".into(),
                        )
                    })?
            }
            CipherState::Pending(_) | CipherState::Failed => {
                return Err(VaultError::CipherNotMaterialized)
            }
            CipherState::Spent => {
                return Err(VaultError::CipherMisuse(
                    "encrypt cipher was already used; its IV cannot be reused".into(),
                ))
            }
        };

        if self.for_encryption {
            *state = CipherState::Spent;
        }
        Ok(output)
    }

    fn lock(&self) -> MutexGuard<'_, CipherState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for BiometricCipherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BiometricCipherHandle")
            .field("for_encryption", &self.for_encryption)
            .field("materialized", &self.is_materialized())
            .finish()
    }
}
