//! Error types for vault session operations.
//!
//! Every failure a caller can observe is one of these variants. Each variant
//! belongs to exactly one [`ErrorKind`], which is what UI layers branch on:
//! authentication failures show a retry prompt, corruption asks the user to
//! sign in again, unsupported hides the affordance.

use std::path::PathBuf;

use thiserror::Error;

/// Coarse classification of a [`VaultError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Wrong password, failed biometric. Retry is allowed, nothing changed.
    Authentication,
    /// Nothing has been set up yet; offer first-time setup.
    NotSetup,
    /// Stored state is present but cannot be trusted; full re-authentication
    /// against the remote provider is needed.
    Corruption,
    /// The caller broke a contract (cipher used before materialization, ...).
    Misuse,
    /// The platform lacks the facility; disable the feature.
    Unsupported,
    /// Everything else on the storage/crypto path.
    Storage,
}

#[derive(Error, Debug)]
pub enum VaultError {
    /// The supplied password does not match the stored fingerprint.
    #[error("Invalid password")]
    InvalidPassword,

    /// No persisted session exists yet.
    #[error("No session has been set up")]
    NotSetup,

    /// The operation needs an unlocked session.
    #[error("Vault is locked")]
    Locked,

    /// A session is already persisted; setup would overwrite it.
    #[error("Vault already exists")]
    AlreadyExists,

    /// Biometric unlock window elapsed; the master password must be entered.
    #[error("Master password required")]
    PasswordRequired,

    /// The biometric prompt or biometric cipher failed.
    #[error("Biometric authentication failed: {0}")]
    BiometricFailed(String),

    /// Biometric unlock was never enabled for this vault.
    #[error("Biometric unlock is not enabled")]
    BiometricNotEnabled,

    /// The OS invalidated the biometric key; biometric unlock was disabled.
    #[error("Biometric key was invalidated; unlock with the master password")]
    BiometricInvalidated,

    /// The platform has no facility for the requested feature.
    #[error("Not supported on this platform: {0}")]
    Unsupported(String),

    /// Ciphertext present but undecryptable, or structurally broken.
    #[error("Stored session is corrupted: {0}")]
    Corrupted(String),

    /// The encrypted store could not be opened even after recreating it.
    #[error("Store {file} unavailable after {attempts} attempts: {reason}")]
    StoreUnavailable {
        file: String,
        attempts: u32,
        reason: String,
    },

    /// The platform keystore refused an operation.
    #[error("Keystore error: {0}")]
    Keystore(String),

    /// `encode` called on a cipher whose key material was never bound.
    #[error("Cipher used before it was materialized")]
    CipherNotMaterialized,

    /// Any other cipher contract violation.
    #[error("Cipher misuse: {0}")]
    CipherMisuse(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for vault operations.
pub type VaultResult<T> = std::result::Result<T, VaultError>;

impl VaultError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        VaultError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::InvalidPassword
            | VaultError::PasswordRequired
            | VaultError::BiometricFailed(_)
            | VaultError::Locked => ErrorKind::Authentication,
            VaultError::NotSetup => ErrorKind::NotSetup,
            VaultError::Corrupted(_)
            | VaultError::StoreUnavailable { .. } => ErrorKind::Corruption,
            VaultError::CipherNotMaterialized
            | VaultError::CipherMisuse(_)
            | VaultError::AlreadyExists => ErrorKind::Misuse,
            VaultError::Unsupported(_)
            | VaultError::BiometricNotEnabled
            | VaultError::BiometricInvalidated => ErrorKind::Unsupported,
            VaultError::Keystore(_)
            | VaultError::Encryption(_)
            | VaultError::KeyDerivation(_)
            | VaultError::Io { .. }
            | VaultError::Serialization(_)
            | VaultError::Config(_) => ErrorKind::Storage,
        }
    }

    /// Whether the user may simply try again.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Authentication
    }

    /// Stable error code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            VaultError::InvalidPassword => "INVALID_PASSWORD",
            VaultError::NotSetup => "NOT_SETUP",
            VaultError::Locked => "LOCKED",
            VaultError::AlreadyExists => "ALREADY_EXISTS",
            VaultError::PasswordRequired => "PASSWORD_REQUIRED",
            VaultError::BiometricFailed(_) => "BIOMETRIC_FAILED",
            VaultError::BiometricNotEnabled => "BIOMETRIC_NOT_ENABLED",
            VaultError::BiometricInvalidated => "BIOMETRIC_INVALIDATED",
            VaultError::Unsupported(_) => "UNSUPPORTED",
            VaultError::Corrupted(_) => "CORRUPTED",
            VaultError::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
            VaultError::Keystore(_) => "KEYSTORE_ERROR",
            VaultError::CipherNotMaterialized => "CIPHER_NOT_MATERIALIZED",
            VaultError::CipherMisuse(_) => "CIPHER_MISUSE",
            VaultError::Encryption(_) => "ENCRYPTION_ERROR",
            VaultError::KeyDerivation(_) => "KEY_DERIVATION_ERROR",
            VaultError::Io { .. } => "IO_ERROR",
            VaultError::Serialization(_) => "SERIALIZATION_ERROR",
            VaultError::Config(_) => "CONFIG_ERROR",
        }
    }
}

impl From<vaultlock_keychain::Error> for VaultError {
    fn from(err: vaultlock_keychain::Error) -> Self {
        use vaultlock_keychain::Error as KeychainError;
        match err {
            KeychainError::NotAvailable(msg) => VaultError::Unsupported(msg),
            KeychainError::AuthenticationFailed(msg) => VaultError::BiometricFailed(msg),
            KeychainError::BiometricEnrollmentChanged => VaultError::BiometricInvalidated,
            other => VaultError::Keystore(other.to_string()),
        }
    }
}

// ============================================================================
// Serialization for UI layers
// ============================================================================

impl serde::Serialize for VaultError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("VaultError", 2)?;
        state.serialize_field("code", self.code())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}
