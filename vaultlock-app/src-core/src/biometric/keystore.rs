use async_trait::async_trait;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::{
    BiometricCipherHandle, BiometricCipherProvider, BiometricPurpose, BiometricStatus,
    CipherCreationError,
};
use crate::error::{VaultError, VaultResult};
use crate::storage::{Keystore, KeystoreError};

/// Keystore alias of the hardware-bound biometric key.
pub const BIOMETRIC_KEY_ALIAS: &str = "biometrics";

/// Cipher over a key the platform keystore holds and revokes on its own when
/// the biometric enrollment changes. The key is resolved when the cipher is
/// created; materialization only binds it.
pub struct KeystoreBiometricCipher {
    keystore: Keystore,
}

impl KeystoreBiometricCipher {
    pub fn new(keystore: Keystore) -> Self {
        Self { keystore }
    }
}

#[async_trait]
impl BiometricCipherProvider for KeystoreBiometricCipher {
    async fn availability(&self) -> BiometricStatus {
        match self.keystore.check_availability().await {
            Ok(status) if status.available => BiometricStatus::Available,
            Ok(status) => BiometricStatus::Unavailable {
                reason: status
                    .unavailable_reason
                    .unwrap_or_else(|| "keystore unavailable".into()),
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
        let key = match &purpose {
            BiometricPurpose::Encrypt => self.keystore.get_or_create_key(BIOMETRIC_KEY_ALIAS).await,
            BiometricPurpose::Decrypt { .. } => {
                match self.keystore.get_key(BIOMETRIC_KEY_ALIAS).await {
                    Ok(Some(key)) => Ok(key),
                    Ok(None) => {
                        warn!("Biometric key {} is missing", BIOMETRIC_KEY_ALIAS);
                        return Err(CipherCreationError::KeyInvalidated);
                    }
                    Err(e) => Err(e),
                }
            }
        };

        let key = match key {
            Ok(key) => key,
            Err(KeystoreError::Invalidated(alias)) => {
                warn!("Biometric key {} was invalidated", alias);
                return Err(CipherCreationError::KeyInvalidated);
            }
            Err(e) => return Err(VaultError::from(e).into()),
        };

        debug!("Created keystore biometric cipher ({:?})", purpose);
        let materialize: super::Materializer =
            Box::new(move |_| Ok(Zeroizing::new(*key.as_bytes())));

        Ok(match purpose {
            BiometricPurpose::Encrypt => BiometricCipherHandle::for_encryption(materialize),
            BiometricPurpose::Decrypt { iv } => {
                BiometricCipherHandle::for_decryption(&iv, materialize)?
            }
        })
    }

    async fn delete_cipher(&self) -> VaultResult<()> {
        self.keystore.delete_key(BIOMETRIC_KEY_ALIAS).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vaultlock_keychain::MemorySecretStore;

    fn provider() -> (Arc<MemorySecretStore>, KeystoreBiometricCipher) {
        let secrets = Arc::new(MemorySecretStore::new());
        (
            secrets.clone(),
            KeystoreBiometricCipher::new(Keystore::new(secrets)),
        )
    }

    #[tokio::test]
    async fn test_encrypt_then_decrypt() {
        let (_, provider) = provider();

        let encrypt = provider.create_cipher(BiometricPurpose::Encrypt).await.unwrap();
        encrypt.materialize().unwrap();
        let sealed = encrypt.encode(b"master").unwrap();

        let decrypt = provider
            .create_cipher(BiometricPurpose::Decrypt {
                iv: encrypt.iv().to_vec(),
            })
            .await
            .unwrap();
        decrypt.materialize().unwrap();
        assert_eq!(decrypt.encode(&sealed).unwrap(), b"master");
    }

    #[tokio::test]
    async fn test_invalidated_key() {
        let (secrets, provider) = provider();
        provider.create_cipher(BiometricPurpose::Encrypt).await.unwrap();
        secrets.invalidate(BIOMETRIC_KEY_ALIAS);

        let err = provider
            .create_cipher(BiometricPurpose::Decrypt { iv: vec![0; 12] })
            .await
            .unwrap_err();
        assert!(matches!(err, CipherCreationError::KeyInvalidated));

        // Recreating after a delete works again.
        provider.delete_cipher().await.unwrap();
        assert!(provider.create_cipher(BiometricPurpose::Encrypt).await.is_ok());
    }

    #[tokio::test]
    async fn test_decrypt_without_key_is_invalidated() {
        let (_, provider) = provider();
        let err = provider
            .create_cipher(BiometricPurpose::Decrypt { iv: vec![0; 12] })
            .await
            .unwrap_err();
        assert!(matches!(err, CipherCreationError::KeyInvalidated));
    }
}
