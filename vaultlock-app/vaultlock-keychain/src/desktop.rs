//! Desktop implementation using OS keyring.
//!
//! This module provides secure secret storage using platform-native keyrings:
//! - **macOS**: Keychain Access
//! - **Windows**: Credential Manager
//! - **Linux**: Secret Service API (GNOME Keyring, KWallet)

use keyring::Entry;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::models::*;
use crate::SecretStore;

/// Secret store backed by the OS keyring.
///
/// Every account lives under the same service name, so one installation owns
/// one namespace in the keyring.
#[derive(Debug, Clone)]
pub struct KeyringSecretStore {
    service: String,
}

impl KeyringSecretStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn entry(&self, account: &str) -> crate::Result<Entry> {
        Entry::new(&self.service, account).map_err(|e| {
            error!("Failed to create keyring entry for {}: {}", account, e);
            Self::map_keyring_error(e)
        })
    }

    /// Get the appropriate storage method for the current platform.
    fn get_platform_method() -> SecretStorageMethod {
        #[cfg(target_os = "macos")]
        {
            SecretStorageMethod::MacOSKeychain
        }
        #[cfg(target_os = "windows")]
        {
            SecretStorageMethod::WindowsCredentialManager
        }
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            SecretStorageMethod::LinuxSecretService
        }
    }

    /// Map keyring errors to our error type.
    fn map_keyring_error(err: keyring::Error) -> Error {
        match err {
            keyring::Error::NoEntry => Error::SecretNotFound,
            keyring::Error::Ambiguous(_) => {
                Error::Internal("Multiple keyring entries found".into())
            }
            keyring::Error::NoStorageAccess(e) => {
                Error::NotAvailable(format!("Keyring access denied: {:?}", e))
            }
            keyring::Error::PlatformFailure(e) => {
                let msg = format!("{:?}", e);
                if msg.contains("Dbus") || msg.contains("dbus") || msg.contains("D-Bus") {
                    Error::NotAvailable(format!(
                        "System keyring not available (D-Bus error): {}",
                        msg
                    ))
                } else {
                    Error::Internal(format!("Keyring error: {:?}", e))
                }
            }
            keyring::Error::BadEncoding(e) => {
                Error::Malformed(format!("Keyring encoding error: {:?}", e))
            }
            _ => Error::Internal(format!("Keyring error: {}", err)),
        }
    }
}

impl SecretStore for KeyringSecretStore {
    /// On desktop, we try to access the keyring to see if it's available.
    fn check_availability(&self) -> crate::Result<SecretStorageStatus> {
        debug!("Checking keyring availability for service: {}", self.service);

        // Probe with an account that is never written.
        let entry = match Entry::new(&self.service, "availability-probe") {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Keyring not available: {}", e);
                return Ok(SecretStorageStatus::unavailable(format!(
                    "OS keyring not available: {}",
                    e
                )));
            }
        };
        let method = Self::get_platform_method();
        match entry.get_password() {
            Ok(_) | Err(keyring::Error::NoEntry) => {
                debug!("Keyring available, method: {:?}", method);
                Ok(SecretStorageStatus::available(method))
            }
            Err(e) => {
                warn!("Keyring not accessible: {:?}", e);
                Ok(SecretStorageStatus::unavailable(format!(
                    "OS keyring not accessible: {}",
                    e
                )))
            }
        }
    }

    /// The secret is stored as base64-encoded bytes to handle binary data safely.
    fn store_secret(&self, account: &str, secret: &[u8]) -> crate::Result<()> {
        info!(
            "Storing {} byte secret in keyring (service: {}, account: {})",
            secret.len(),
            self.service,
            account
        );

        let entry = self.entry(account)?;

        // Keyring APIs expect strings
        let encoded = base64_encode(secret);
        entry.set_password(&encoded).map_err(|e| {
            error!("Failed to store secret in keyring: {:?}", e);
            Self::map_keyring_error(e)
        })?;

        // Read back through a NEW Entry so we are not looking at a value
        // cached by the one we just wrote with.
        let verify_entry = self.entry(account)?;
        match verify_entry.get_password() {
            Ok(readback) if readback == encoded => {
                debug!("Secret verified - stored in OS keyring");
                Ok(())
            }
            Ok(_) => {
                error!("Secret verification failed - stored data doesn't match!");
                Err(Error::Internal(
                    "Keyring verification failed: data mismatch".into(),
                ))
            }
            Err(e) => {
                error!(
                    "Secret verification failed - cannot read back with new Entry: {:?}",
                    e
                );
                Err(Error::Internal(format!(
                    "Keyring verification failed: set_password() succeeded but get_password() on new Entry failed: {:?}",
                    e
                )))
            }
        }
    }

    fn retrieve_secret(&self, account: &str) -> crate::Result<Vec<u8>> {
        debug!(
            "Retrieving secret from keyring (service: {}, account: {})",
            self.service, account
        );

        let entry = self.entry(account)?;
        let encoded = entry.get_password().map_err(|e| {
            if !matches!(e, keyring::Error::NoEntry) {
                error!("Failed to retrieve secret from keyring: {:?}", e);
            }
            Self::map_keyring_error(e)
        })?;

        let secret = base64_decode(&encoded).map_err(|e| {
            error!("Failed to decode secret from base64: {}", e);
            Error::Malformed(format!("Failed to decode secret: {}", e))
        })?;

        debug!("Secret retrieved from OS keyring ({} bytes)", secret.len());
        Ok(secret)
    }

    /// Idempotent: deleting an account that has no entry succeeds.
    fn delete_secret(&self, account: &str) -> crate::Result<()> {
        debug!(
            "Deleting secret from keyring (service: {}, account: {})",
            self.service, account
        );

        let entry = self.entry(account)?;
        match entry.delete_credential() {
            Ok(()) => {
                info!("Secret {} deleted from OS keyring", account);
                Ok(())
            }
            Err(keyring::Error::NoEntry) => {
                debug!("No secret to delete (already gone)");
                Ok(())
            }
            Err(e) => {
                error!("Failed to delete secret from keyring: {:?}", e);
                Err(Self::map_keyring_error(e))
            }
        }
    }
}

/// Base64 encode bytes to string.
fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Base64 decode string to bytes.
fn base64_decode(encoded: &str) -> Result<Vec<u8>, String> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| e.to_string())
}
