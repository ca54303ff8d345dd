//! Error types for keychain secret storage.

use serde::{Deserialize, Serialize};

/// Result type alias for keychain operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during secret storage operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", content = "message")]
pub enum Error {
    /// Secure storage is not available on this platform/device.
    #[error("Secure storage not available: {0}")]
    NotAvailable(String),

    /// User failed to authenticate (wrong biometric, cancelled, etc.)
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Biometric enrollment changed since the secret was stored.
    /// The OS has invalidated the entry; it can only be deleted and recreated.
    #[error("Biometric enrollment changed - stored secrets are now inaccessible")]
    BiometricEnrollmentChanged,

    /// No secret is stored under the requested account.
    #[error("No secret found in secure storage")]
    SecretNotFound,

    /// Access to secure storage was denied by the OS.
    #[error("Access denied to secure storage")]
    AccessDenied,

    /// The stored value could not be decoded back into bytes.
    #[error("Stored secret is malformed: {0}")]
    Malformed(String),

    /// I/O error during keyring operations.
    #[error("I/O error: {0}")]
    Io(String),

    /// Platform-specific internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the entry itself is unusable and must be deleted before a new
    /// one can be created under the same account.
    pub fn is_invalidated(&self) -> bool {
        matches!(self, Error::BiometricEnrollmentChanged | Error::Malformed(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
