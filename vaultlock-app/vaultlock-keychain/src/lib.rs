//! Platform secret storage for the vaultlock session core.
//!
//! Secrets are opaque byte strings addressed by an account name. The desktop
//! backend talks to the OS keyring; callers on platforms without one get a
//! structured "not available" status instead of a failure at link time.

pub use models::*;

#[cfg(any(target_os = "macos", target_os = "windows", target_os = "linux"))]
mod desktop;
#[cfg(any(test, feature = "memory"))]
mod memory;

mod error;
mod models;

pub use error::{Error, Result};

#[cfg(any(target_os = "macos", target_os = "windows", target_os = "linux"))]
pub use desktop::KeyringSecretStore;
#[cfg(any(test, feature = "memory"))]
pub use memory::MemorySecretStore;

/// A named-secret store provided by the platform.
///
/// Every call may block on the OS (D-Bus, Keychain Services, ...). Async
/// callers are expected to run these on a blocking pool.
pub trait SecretStore: Send + Sync {
    /// Check what secure storage capabilities are available on this platform.
    fn check_availability(&self) -> Result<SecretStorageStatus>;

    /// Store (or overwrite) the secret under `account`.
    fn store_secret(&self, account: &str, secret: &[u8]) -> Result<()>;

    /// Retrieve the secret stored under `account`.
    ///
    /// Returns [`Error::SecretNotFound`] when nothing is stored.
    fn retrieve_secret(&self, account: &str) -> Result<Vec<u8>>;

    /// Delete the secret under `account`. Idempotent.
    fn delete_secret(&self, account: &str) -> Result<()>;
}

/// Secret store for the current platform, or `None` where no OS keyring
/// integration exists.
pub fn platform_secret_store(service: &str) -> Option<Box<dyn SecretStore>> {
    #[cfg(any(target_os = "macos", target_os = "windows", target_os = "linux"))]
    {
        Some(Box::new(KeyringSecretStore::new(service)))
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
    {
        let _ = service;
        None
    }
}
