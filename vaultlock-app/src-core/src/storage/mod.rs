pub mod config;
pub mod encrypted;
pub mod files;
pub mod keystore;
pub mod preference;

pub use config::{load_config, save_config, VaultConfig};
pub use encrypted::EncryptedKeyValueStore;
pub use files::Files;
pub use keystore::{Keystore, KeystoreError, KeystoreKey};
pub use preference::Preference;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Hands out one [`EncryptedKeyValueStore`] per [`Files`] entry.
///
/// Stores are process-wide: every caller asking for the same file gets the
/// same instance, so there is a single loader and a single writer per file.
pub struct StoreFactory {
    data_dir: PathBuf,
    keystore: Keystore,
    max_attempts: u32,
    stores: Mutex<HashMap<Files, Arc<EncryptedKeyValueStore>>>,
}

impl StoreFactory {
    pub fn new(config: &VaultConfig, keystore: Keystore) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            keystore,
            max_attempts: config.store_max_attempts,
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn keystore(&self) -> &Keystore {
        &self.keystore
    }

    pub fn store(&self, file: Files) -> Arc<EncryptedKeyValueStore> {
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        stores
            .entry(file)
            .or_insert_with(|| {
                Arc::new(EncryptedKeyValueStore::new(
                    file,
                    &self.data_dir,
                    self.keystore.clone(),
                    self.max_attempts,
                ))
            })
            .clone()
    }
}
