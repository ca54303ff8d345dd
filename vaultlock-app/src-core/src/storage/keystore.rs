//! Platform keystore facade.
//!
//! Holds 256-bit symmetric keys by alias on top of a [`SecretStore`]. All
//! calls hop to the blocking pool, since keyring backends talk to D-Bus or
//! Keychain Services synchronously.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};
use vaultlock_keychain::{SecretStorageStatus, SecretStore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::VaultError;
use crate::security::crypto::{random_bytes, KEY_SIZE};

#[derive(Error, Debug)]
pub enum KeystoreError {
    /// The entry exists but can never be read again.
    #[error("Keystore entry {0} was invalidated")]
    Invalidated(String),

    #[error(transparent)]
    Platform(#[from] vaultlock_keychain::Error),

    #[error("Keystore task failed: {0}")]
    Task(String),
}

impl From<KeystoreError> for VaultError {
    fn from(err: KeystoreError) -> Self {
        match err {
            KeystoreError::Platform(e) => e.into(),
            other => VaultError::Keystore(other.to_string()),
        }
    }
}

/// A key held by the keystore. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeystoreKey {
    key: [u8; KEY_SIZE],
}

impl KeystoreKey {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl std::fmt::Debug for KeystoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystoreKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Clone)]
pub struct Keystore {
    secrets: Arc<dyn SecretStore>,
}

impl Keystore {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self { secrets }
    }

    pub fn secrets(&self) -> Arc<dyn SecretStore> {
        self.secrets.clone()
    }

    pub async fn check_availability(&self) -> Result<SecretStorageStatus, KeystoreError> {
        let secrets = self.secrets.clone();
        run_blocking(move || Ok(secrets.check_availability()?)).await
    }

    /// Fetch the key under `alias`, or create and store a fresh one.
    pub async fn get_or_create_key(&self, alias: &str) -> Result<KeystoreKey, KeystoreError> {
        let secrets = self.secrets.clone();
        let alias = alias.to_string();
        run_blocking(move || {
            match secrets.retrieve_secret(&alias) {
                Ok(mut bytes) => {
                    let key = key_from_bytes(&alias, &bytes);
                    bytes.zeroize();
                    key
                }
                Err(vaultlock_keychain::Error::SecretNotFound) => {
                    info!("Creating keystore key {}", alias);
                    let key = KeystoreKey {
                        key: random_bytes::<KEY_SIZE>(),
                    };
                    secrets.store_secret(&alias, key.as_bytes())?;
                    Ok(key)
                }
                Err(e) if e.is_invalidated() => Err(KeystoreError::Invalidated(alias)),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// Fetch an existing key. Never creates one.
    pub async fn get_key(&self, alias: &str) -> Result<Option<KeystoreKey>, KeystoreError> {
        let secrets = self.secrets.clone();
        let alias = alias.to_string();
        run_blocking(move || match secrets.retrieve_secret(&alias) {
            Ok(mut bytes) => {
                let key = key_from_bytes(&alias, &bytes);
                bytes.zeroize();
                key.map(Some)
            }
            Err(vaultlock_keychain::Error::SecretNotFound) => Ok(None),
            Err(e) if e.is_invalidated() => Err(KeystoreError::Invalidated(alias)),
            Err(e) => Err(e.into()),
        })
        .await
    }

    pub async fn delete_key(&self, alias: &str) -> Result<(), KeystoreError> {
        let secrets = self.secrets.clone();
        let alias = alias.to_string();
        run_blocking(move || {
            debug!("Deleting keystore key {}", alias);
            Ok(secrets.delete_secret(&alias)?)
        })
        .await
    }

    /// Store raw secret bytes (not necessarily a key) under `alias`.
    pub async fn put_secret(&self, alias: &str, secret: Vec<u8>) -> Result<(), KeystoreError> {
        let secrets = self.secrets.clone();
        let alias = alias.to_string();
        run_blocking(move || {
            let mut secret = secret;
            let result = secrets.store_secret(&alias, &secret);
            secret.zeroize();
            Ok(result?)
        })
        .await
    }
}

fn key_from_bytes(alias: &str, bytes: &[u8]) -> Result<KeystoreKey, KeystoreError> {
    if bytes.len() != KEY_SIZE {
        return Err(KeystoreError::Invalidated(format!(
            "{} (expected {} bytes, found {})",
            alias,
            KEY_SIZE,
            bytes.len()
        )));
    }
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(bytes);
    Ok(KeystoreKey { key })
}

async fn run_blocking<T, F>(f: F) -> Result<T, KeystoreError>
where
    F: FnOnce() -> Result<T, KeystoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KeystoreError::Task(e.to_string()))?
}
