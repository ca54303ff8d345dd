use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use vaultlock_keychain::{Error as KeychainError, SecretStore};
use zeroize::{Zeroize, Zeroizing};

use super::{
    BiometricCipherHandle, BiometricCipherProvider, BiometricPurpose, BiometricStatus,
    CipherCreationError, Materializer,
};
use crate::error::{VaultError, VaultResult};
use crate::security::crypto::{random_bytes, KEY_SIZE};

/// Keychain account holding the biometric unlock key.
pub const BIOMETRIC_UNLOCK_ACCOUNT: &str = "biometric_unlock";

/// Cipher for platforms without a hardware-bound biometric cipher API.
///
/// The key lives in the OS keychain, which gates access with the platform's
/// own user-presence check. Nothing touches the keychain until
/// materialization: an encrypt cipher generates and stores a new key, a
/// decrypt cipher reads the stored one.
pub struct KeychainBiometricCipher {
    secrets: Arc<dyn SecretStore>,
}

impl KeychainBiometricCipher {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl BiometricCipherProvider for KeychainBiometricCipher {
    async fn availability(&self) -> BiometricStatus {
        let secrets = self.secrets.clone();
        match tokio::task::spawn_blocking(move || secrets.check_availability()).await {
            Ok(Ok(status)) if status.available => BiometricStatus::Available,
            Ok(Ok(status)) => BiometricStatus::Unavailable {
                reason: status
                    .unavailable_reason
                    .unwrap_or_else(|| "keychain unavailable".into()),
            },
            Ok(Err(e)) => BiometricStatus::Unavailable {
                reason: e.to_string(),
            },
            Err(e) => BiometricStatus::Unavailable {
                reason: e.to_string(),
            },
        }
    }

    async fn create_cipher(
        &self,
        purpose: BiometricPurpose,
    ) -> Result<BiometricCipherHandle, CipherCreationError> {
        let secrets = self.secrets.clone();
        debug!("Created keychain biometric cipher ({:?})", purpose);

        Ok(match purpose {
            BiometricPurpose::Encrypt => {
                let materialize: Materializer = Box::new(move |_| {
                    let key = Zeroizing::new(random_bytes::<KEY_SIZE>());
                    secrets.store_secret(BIOMETRIC_UNLOCK_ACCOUNT, &key[..])?;
                    info!("Stored new biometric unlock key in keychain");
                    Ok(key)
                });
                BiometricCipherHandle::for_encryption(materialize)
            }
            BiometricPurpose::Decrypt { iv } => {
                let materialize: Materializer = Box::new(move |_| {
                    let mut stored = match secrets.retrieve_secret(BIOMETRIC_UNLOCK_ACCOUNT) {
                        Ok(stored) => stored,
                        Err(KeychainError::SecretNotFound) => {
                            return Err(VaultError::BiometricInvalidated)
                        }
                        Err(e) if e.is_invalidated() => {
                            return Err(VaultError::BiometricInvalidated)
                        }
                        Err(e) => return Err(e.into()),
                    };
                    let key: Result<[u8; KEY_SIZE], _> = stored.as_slice().try_into();
                    stored.zeroize();
                    key.map(Zeroizing::new)
                        .map_err(|_| VaultError::BiometricInvalidated)
                });
                BiometricCipherHandle::for_decryption(&iv, materialize)?
            }
        })
    }

    async fn delete_cipher(&self) -> VaultResult<()> {
        let secrets = self.secrets.clone();
        tokio::task::spawn_blocking(move || secrets.delete_secret(BIOMETRIC_UNLOCK_ACCOUNT))
            .await
            .map_err(|e| VaultError::Keystore(e.to_string()))??;
        Ok(())
    }
}
