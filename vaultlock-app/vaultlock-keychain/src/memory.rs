//! Process-local secret store.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::error::Error;
use crate::models::*;
use crate::SecretStore;

#[derive(Debug)]
enum Slot {
    Live(Vec<u8>),
    /// The OS revoked the entry (e.g. biometric enrollment changed).
    Invalidated,
}

/// Secret store that keeps everything in a map for the life of the process.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    entries: Mutex<HashMap<String, Slot>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an entry as revoked, the way an OS does when the biometric
    /// enrollment backing it changes. Reads fail until it is deleted.
    pub fn invalidate(&self, account: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = entries.get_mut(account) {
            debug!("Invalidating in-memory secret {}", account);
            *slot = Slot::Invalidated;
        }
    }

    /// Whether a live or invalidated entry exists under `account`.
    pub fn contains(&self, account: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(account)
    }
}

impl SecretStore for MemorySecretStore {
    fn check_availability(&self) -> crate::Result<SecretStorageStatus> {
        Ok(SecretStorageStatus::available(SecretStorageMethod::Memory))
    }

    fn store_secret(&self, account: &str, secret: &[u8]) -> crate::Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(account.to_string(), Slot::Live(secret.to_vec()));
        Ok(())
    }

    fn retrieve_secret(&self, account: &str) -> crate::Result<Vec<u8>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(account) {
            Some(Slot::Live(secret)) => Ok(secret.clone()),
            Some(Slot::Invalidated) => Err(Error::BiometricEnrollmentChanged),
            None => Err(Error::SecretNotFound),
        }
    }

    fn delete_secret(&self, account: &str) -> crate::Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(account);
        Ok(())
    }
}
