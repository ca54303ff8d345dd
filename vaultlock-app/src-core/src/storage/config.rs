use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{VaultError, VaultResult};
use crate::security::KdfParams;

/// Static configuration of the session core.
///
/// User-adjustable values (auto-lock duration, biometric timeout) are NOT
/// here; they live in the encrypted settings store and are read fresh each
/// time. The `default_*` fields only seed them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Directory holding the `*.enc` stores.
    pub data_dir: PathBuf,
    /// Load attempts for an encrypted store before giving up.
    pub store_max_attempts: u32,
    /// How long the last keep-alive may be gone before it counts.
    pub keep_alive_debounce_ms: u64,
    /// Auto-lock delay when the user never chose one. `None` = never.
    pub default_lock_after_secs: Option<u64>,
    /// How long biometric unlock stays valid after the last password entry.
    /// `None` = no limit.
    pub default_biometric_timeout_secs: Option<u64>,
    pub kdf: KdfParams,
    /// Keyring service name all keystore entries are filed under.
    pub keychain_service: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::new(),
            store_max_attempts: 3,
            keep_alive_debounce_ms: 1000,
            default_lock_after_secs: Some(300),
            default_biometric_timeout_secs: None,
            kdf: KdfParams::default(),
            keychain_service: "com.vaultlock.session".to_string(),
        }
    }
}

impl VaultConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn keep_alive_debounce(&self) -> Duration {
        Duration::from_millis(self.keep_alive_debounce_ms)
    }

    pub fn validate(&self) -> VaultResult<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(VaultError::Config("data_dir is not set".into()));
        }
        if self.store_max_attempts == 0 {
            return Err(VaultError::Config(
                "store_max_attempts must be at least 1".into(),
            ));
        }
        if self.keychain_service.is_empty() {
            return Err(VaultError::Config("keychain_service is empty".into()));
        }
        Ok(())
    }
}

/// Load configuration from a JSON file, falling back to defaults when the
/// file does not exist.
pub fn load_config(path: &Path) -> VaultResult<VaultConfig> {
    if !path.exists() {
        return Ok(VaultConfig::default());
    }

    let content = std::fs::read_to_string(path).map_err(|e| VaultError::io(path, e))?;
    let config: VaultConfig = serde_json::from_str(&content)?;
    Ok(config)
}

pub fn save_config(path: &Path, config: &VaultConfig) -> VaultResult<()> {
    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|e| VaultError::io(path, e))?;
    Ok(())
}
