//! Typed repositories over the encrypted stores.
//!
//! Pure storage views: nothing in here derives, wraps or compares keys. Every
//! write of session or fingerprint data commits before returning, because the
//! rotation sequence depends on each step being durable before the next.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use super::model::{Fingerprint, PersistedSession, SessionMetadata};
use crate::error::VaultResult;
use crate::session::LockTimeoutSource;
use crate::storage::{EncryptedKeyValueStore, Files, Preference, StoreFactory, VaultConfig};

const SESSION_KEY: &str = "session";
const FINGERPRINT_KEY: &str = "fingerprint";
const METADATA_KEY: &str = "metadata";
const LOCK_AFTER_KEY: &str = "lock_after_secs";
const BIOMETRIC_TIMEOUT_KEY: &str = "biometric_timeout_secs";
const BIOMETRIC_CONFIRMATION_KEY: &str = "biometric_require_confirmation";

#[async_trait]
pub trait KeyReadWriteRepository: Send + Sync {
    async fn get(&self) -> VaultResult<Option<PersistedSession>>;

    async fn observe(&self) -> VaultResult<BoxStream<'static, Option<PersistedSession>>>;

    /// Overwrite (or with `None`, delete) the persisted session. Durable on return.
    async fn put(&self, session: Option<&PersistedSession>) -> VaultResult<()>;
}

#[async_trait]
pub trait FingerprintReadWriteRepository: Send + Sync {
    async fn get(&self) -> VaultResult<Option<Fingerprint>>;

    async fn observe(&self) -> VaultResult<BoxStream<'static, Option<Fingerprint>>>;

    /// Overwrite (or with `None`, delete) the fingerprint. Durable on return.
    async fn put(&self, fingerprint: Option<&Fingerprint>) -> VaultResult<()>;
}

#[async_trait]
pub trait SessionMetadataReadWriteRepository: Send + Sync {
    async fn get_last_password_use_timestamp(&self) -> VaultResult<Option<DateTime<Utc>>>;

    async fn set_last_password_use_timestamp(&self, at: DateTime<Utc>) -> VaultResult<()>;
}

/// User-adjustable session settings. `None` means "never" / "no limit".
#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn lock_after(&self) -> VaultResult<Option<Duration>>;

    async fn set_lock_after(&self, value: Option<Duration>) -> VaultResult<()>;

    async fn biometric_timeout(&self) -> VaultResult<Option<Duration>>;

    async fn set_biometric_timeout(&self, value: Option<Duration>) -> VaultResult<()>;

    /// Whether a passive biometric (face) still needs an explicit confirm
    /// tap. Defaults to `true`.
    async fn biometric_require_confirmation(&self) -> VaultResult<bool>;

    async fn set_biometric_require_confirmation(&self, value: bool) -> VaultResult<()>;
}

pub struct StoreKeyRepository {
    session: Preference<PersistedSession>,
}

impl StoreKeyRepository {
    pub fn new(store: Arc<EncryptedKeyValueStore>) -> Self {
        Self {
            session: Preference::new(store, SESSION_KEY),
        }
    }
}

#[async_trait]
impl KeyReadWriteRepository for StoreKeyRepository {
    async fn get(&self) -> VaultResult<Option<PersistedSession>> {
        self.session.get().await
    }

    async fn observe(&self) -> VaultResult<BoxStream<'static, Option<PersistedSession>>> {
        self.session.watch().await
    }

    async fn put(&self, session: Option<&PersistedSession>) -> VaultResult<()> {
        match session {
            Some(session) => self.session.set_and_commit(session).await,
            None => self.session.remove_and_commit().await,
        }
    }
}

pub struct StoreFingerprintRepository {
    fingerprint: Preference<Fingerprint>,
}

impl StoreFingerprintRepository {
    pub fn new(store: Arc<EncryptedKeyValueStore>) -> Self {
        Self {
            fingerprint: Preference::new(store, FINGERPRINT_KEY),
        }
    }
}

#[async_trait]
impl FingerprintReadWriteRepository for StoreFingerprintRepository {
    async fn get(&self) -> VaultResult<Option<Fingerprint>> {
        self.fingerprint.get().await
    }

    async fn observe(&self) -> VaultResult<BoxStream<'static, Option<Fingerprint>>> {
        self.fingerprint.watch().await
    }

    async fn put(&self, fingerprint: Option<&Fingerprint>) -> VaultResult<()> {
        match fingerprint {
            Some(fingerprint) => self.fingerprint.set_and_commit(fingerprint).await,
            None => self.fingerprint.remove_and_commit().await,
        }
    }
}

pub struct StoreSessionMetadataRepository {
    metadata: Preference<SessionMetadata>,
}

impl StoreSessionMetadataRepository {
    pub fn new(store: Arc<EncryptedKeyValueStore>) -> Self {
        Self {
            metadata: Preference::new(store, METADATA_KEY),
        }
    }
}

#[async_trait]
impl SessionMetadataReadWriteRepository for StoreSessionMetadataRepository {
    async fn get_last_password_use_timestamp(&self) -> VaultResult<Option<DateTime<Utc>>> {
        Ok(self
            .metadata
            .get()
            .await?
            .and_then(|metadata| metadata.last_password_use))
    }

    async fn set_last_password_use_timestamp(&self, at: DateTime<Utc>) -> VaultResult<()> {
        let mut metadata = self.metadata.get().await?.unwrap_or_default();
        metadata.last_password_use = Some(at);
        self.metadata.set(&metadata).await
    }
}

/// Settings stored as optional seconds. A missing entry falls back to the
/// configured default; an explicit `null` means "never".
pub struct StoreSettingsRepository {
    lock_after: Preference<Option<u64>>,
    biometric_timeout: Preference<Option<u64>>,
    require_confirmation: Preference<bool>,
    default_lock_after: Option<Duration>,
    default_biometric_timeout: Option<Duration>,
}

impl StoreSettingsRepository {
    pub fn new(store: Arc<EncryptedKeyValueStore>, config: &VaultConfig) -> Self {
        Self {
            lock_after: Preference::new(store.clone(), LOCK_AFTER_KEY),
            biometric_timeout: Preference::new(store.clone(), BIOMETRIC_TIMEOUT_KEY),
            require_confirmation: Preference::new(store, BIOMETRIC_CONFIRMATION_KEY),
            default_lock_after: config.default_lock_after_secs.map(Duration::from_secs),
            default_biometric_timeout: config
                .default_biometric_timeout_secs
                .map(Duration::from_secs),
        }
    }
}

async fn read_duration(
    preference: &Preference<Option<u64>>,
    default: Option<Duration>,
) -> VaultResult<Option<Duration>> {
    Ok(match preference.get().await? {
        Some(secs) => secs.map(Duration::from_secs),
        None => default,
    })
}

#[async_trait]
impl SettingsRepository for StoreSettingsRepository {
    async fn lock_after(&self) -> VaultResult<Option<Duration>> {
        read_duration(&self.lock_after, self.default_lock_after).await
    }

    async fn set_lock_after(&self, value: Option<Duration>) -> VaultResult<()> {
        self.lock_after
            .set_and_commit(&value.map(|d| d.as_secs()))
            .await
    }

    async fn biometric_timeout(&self) -> VaultResult<Option<Duration>> {
        read_duration(&self.biometric_timeout, self.default_biometric_timeout).await
    }

    async fn set_biometric_timeout(&self, value: Option<Duration>) -> VaultResult<()> {
        self.biometric_timeout
            .set_and_commit(&value.map(|d| d.as_secs()))
            .await
    }

    async fn biometric_require_confirmation(&self) -> VaultResult<bool> {
        Ok(self.require_confirmation.get().await?.unwrap_or(true))
    }

    async fn set_biometric_require_confirmation(&self, value: bool) -> VaultResult<()> {
        self.require_confirmation.set_and_commit(&value).await
    }
}

/// Reads the auto-lock delay from a settings repository on every call.
pub struct SettingsLockTimeout(pub Arc<dyn SettingsRepository>);

#[async_trait]
impl LockTimeoutSource for SettingsLockTimeout {
    async fn lock_timeout(&self) -> VaultResult<Option<Duration>> {
        self.0.lock_after().await
    }
}

/// The repositories a session manager works against.
#[derive(Clone)]
pub struct Repositories {
    pub keys: Arc<dyn KeyReadWriteRepository>,
    pub fingerprints: Arc<dyn FingerprintReadWriteRepository>,
    pub metadata: Arc<dyn SessionMetadataReadWriteRepository>,
    pub settings: Arc<dyn SettingsRepository>,
}

impl Repositories {
    /// Store-backed repositories, one encrypted file each.
    pub fn from_stores(stores: &StoreFactory, config: &VaultConfig) -> Self {
        Self {
            keys: Arc::new(StoreKeyRepository::new(stores.store(Files::MasterKey))),
            fingerprints: Arc::new(StoreFingerprintRepository::new(
                stores.store(Files::Fingerprint),
            )),
            metadata: Arc::new(StoreSessionMetadataRepository::new(
                stores.store(Files::SessionMetadata),
            )),
            settings: Arc::new(StoreSettingsRepository::new(
                stores.store(Files::Settings),
                config,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Keystore;
    use crate::vault::model::{FingerprintPassword, WrappedKeySlot};
    use futures::StreamExt;
    use uuid::Uuid;
    use vaultlock_keychain::MemorySecretStore;

    fn factory(dir: &std::path::Path) -> (StoreFactory, VaultConfig) {
        let config = VaultConfig::with_data_dir(dir);
        let stores = StoreFactory::new(&config, Keystore::new(Arc::new(MemorySecretStore::new())));
        (stores, config)
    }

    #[tokio::test]
    async fn test_key_repository_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let (stores, config) = factory(dir.path());
        let repos = Repositories::from_stores(&stores, &config);

        assert_eq!(repos.keys.get().await.unwrap(), None);

        let session = PersistedSession::new(WrappedKeySlot {
            key_id: Uuid::new_v4(),
            nonce: vec![1; 12],
            ciphertext: vec![2; 48],
        });
        repos.keys.put(Some(&session)).await.unwrap();
        assert_eq!(repos.keys.get().await.unwrap(), Some(session));

        repos.keys.put(None).await.unwrap();
        assert_eq!(repos.keys.get().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fingerprint_observe() {
        let dir = tempfile::tempdir().unwrap();
        let (stores, config) = factory(dir.path());
        let repos = Repositories::from_stores(&stores, &config);

        let mut observed = repos.fingerprints.observe().await.unwrap();
        assert_eq!(observed.next().await, Some(None));

        let fingerprint = Fingerprint {
            version: 1,
            master: FingerprintPassword {
                key_id: Uuid::new_v4(),
                salt: vec![3; 16],
                hash: vec![4; 32],
            },
            biometric: None,
        };
        repos.fingerprints.put(Some(&fingerprint)).await.unwrap();
        assert_eq!(observed.next().await, Some(Some(fingerprint)));
    }

    #[tokio::test]
    async fn test_last_password_use() {
        let dir = tempfile::tempdir().unwrap();
        let (stores, config) = factory(dir.path());
        let repos = Repositories::from_stores(&stores, &config);

        assert_eq!(repos.metadata.get_last_password_use_timestamp().await.unwrap(), None);
        let now = Utc::now();
        repos.metadata.set_last_password_use_timestamp(now).await.unwrap();
        assert_eq!(
            repos.metadata.get_last_password_use_timestamp().await.unwrap(),
            Some(now)
        );
    }

    #[tokio::test]
    async fn test_settings_default_never_and_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let (stores, config) = factory(dir.path());
        let settings = Arc::new(StoreSettingsRepository::new(
            stores.store(Files::Settings),
            &config,
        ));
        let timeout = SettingsLockTimeout(settings.clone());

        assert_eq!(settings.lock_after().await.unwrap(), Some(Duration::from_secs(300)));
        assert_eq!(settings.biometric_timeout().await.unwrap(), None);

        settings.set_lock_after(None).await.unwrap();
        assert_eq!(timeout.lock_timeout().await.unwrap(), None);

        settings
            .set_lock_after(Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(timeout.lock_timeout().await.unwrap(), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_biometric_confirmation_defaults_on() {
        let dir = tempfile::tempdir().unwrap();
        let (stores, config) = factory(dir.path());
        let settings = StoreSettingsRepository::new(stores.store(Files::Settings), &config);

        assert!(settings.biometric_require_confirmation().await.unwrap());
        settings.set_biometric_require_confirmation(false).await.unwrap();
        assert!(!settings.biometric_require_confirmation().await.unwrap());
    }
}
