//! Biometric-gated wrapping of the master key.
//!
//! A [`BiometricCipherProvider`] builds [`BiometricCipherHandle`]s bound to a
//! platform key. The UI's [`BiometricPrompt`] authenticates the user against
//! a constructed handle; only then is the handle materialized and used.

pub mod cipher;
pub mod keychain;
pub mod keystore;

pub use cipher::{BiometricCipherHandle, CipherKey, CipherParams, Materializer};
pub use keychain::KeychainBiometricCipher;
pub use keystore::KeystoreBiometricCipher;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::error::{VaultError, VaultResult};

/// What a cipher is being created for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BiometricPurpose {
    Encrypt,
    Decrypt { iv: Vec<u8> },
}

#[derive(Error, Debug)]
pub enum CipherCreationError {
    /// The platform key is gone or was revoked (enrollment changed, ...).
    #[error("Biometric key was invalidated")]
    KeyInvalidated,

    #[error(transparent)]
    Vault(#[from] VaultError),
}

impl From<CipherCreationError> for VaultError {
    fn from(err: CipherCreationError) -> Self {
        match err {
            CipherCreationError::KeyInvalidated => VaultError::BiometricInvalidated,
            CipherCreationError::Vault(e) => e,
        }
    }
}

/// Whether biometric unlock can be offered at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BiometricStatus {
    Available,
    Unavailable { reason: String },
}

#[async_trait]
pub trait BiometricCipherProvider: Send + Sync {
    async fn availability(&self) -> BiometricStatus {
        BiometricStatus::Available
    }

    async fn create_cipher(
        &self,
        purpose: BiometricPurpose,
    ) -> Result<BiometricCipherHandle, CipherCreationError>;

    /// Drop the platform key. Idempotent.
    async fn delete_cipher(&self) -> VaultResult<()>;
}

/// How the UI should present the biometric prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiometricPromptOptions {
    /// Ask for an explicit confirmation after a passive match.
    pub require_confirmation: bool,
}

impl Default for BiometricPromptOptions {
    fn default() -> Self {
        Self {
            require_confirmation: true,
        }
    }
}

/// The UI-owned biometric prompt.
///
/// The core never shows a prompt itself: it hands the constructed cipher over
/// and reacts to the outcome. A dismissed or failed prompt is an error.
#[async_trait]
pub trait BiometricPrompt: Send + Sync {
    async fn authenticate(
        &self,
        cipher: &BiometricCipherHandle,
        options: &BiometricPromptOptions,
    ) -> VaultResult<()>;
}
