use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use vaultlock_core::biometric::{
    BiometricCipherHandle, BiometricCipherProvider, BiometricPrompt, BiometricPromptOptions,
    BiometricPurpose, CipherCreationError, Materializer,
};
use vaultlock_core::security::{Argon2Kdf, KdfParams, MasterKey};
use vaultlock_core::session::{SessionServices, SessionServicesFactory};
use vaultlock_core::storage::Files;
use vaultlock_core::vault::{
    Fingerprint, FingerprintReadWriteRepository, KeyReadWriteRepository, PersistedSession,
    SessionMetadataReadWriteRepository, SettingsRepository,
};
use vaultlock_core::{
    ErrorKind, LockReason, SessionManager, SessionOrigin, VaultConfig, VaultError, VaultResult,
    VaultStatus,
};
use vaultlock_keychain::{MemorySecretStore, SecretStorageStatus, SecretStore};

fn config(dir: &Path) -> VaultConfig {
    let mut config = VaultConfig::with_data_dir(dir);
    config.kdf = KdfParams {
        memory_kib: 8,
        iterations: 1,
        parallelism: 1,
    };
    config
}

fn open(dir: &Path, secrets: &Arc<MemorySecretStore>) -> SessionManager {
    SessionManager::from_config(&config(dir), secrets.clone()).unwrap()
}

fn key_bytes(manager: &SessionManager) -> Vec<u8> {
    manager.with_master_key(|key| key.as_bytes().to_vec()).unwrap()
}

struct Accept;

#[async_trait]
impl BiometricPrompt for Accept {
    async fn authenticate(
        &self,
        _cipher: &BiometricCipherHandle,
        _options: &BiometricPromptOptions,
    ) -> VaultResult<()> {
        Ok(())
    }
}

struct Dismiss;

#[async_trait]
impl BiometricPrompt for Dismiss {
    async fn authenticate(
        &self,
        _cipher: &BiometricCipherHandle,
        _options: &BiometricPromptOptions,
    ) -> VaultResult<()> {
        Err(VaultError::BiometricFailed("dismissed".into()))
    }
}

/// Accepts and remembers the options it was shown with.
#[derive(Default)]
struct Recording {
    seen: Mutex<Vec<BiometricPromptOptions>>,
}

#[async_trait]
impl BiometricPrompt for Recording {
    async fn authenticate(
        &self,
        _cipher: &BiometricCipherHandle,
        options: &BiometricPromptOptions,
    ) -> VaultResult<()> {
        self.seen.lock().unwrap().push(*options);
        Ok(())
    }
}

/// Keychain that refuses reads while `deny` is set.
struct DenyingSecrets {
    inner: Arc<MemorySecretStore>,
    deny: AtomicBool,
}

impl SecretStore for DenyingSecrets {
    fn check_availability(&self) -> vaultlock_keychain::Result<SecretStorageStatus> {
        self.inner.check_availability()
    }

    fn store_secret(&self, account: &str, secret: &[u8]) -> vaultlock_keychain::Result<()> {
        self.inner.store_secret(account, secret)
    }

    fn retrieve_secret(&self, account: &str) -> vaultlock_keychain::Result<Vec<u8>> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(vaultlock_keychain::Error::AccessDenied);
        }
        self.inner.retrieve_secret(account)
    }

    fn delete_secret(&self, account: &str) -> vaultlock_keychain::Result<()> {
        self.inner.delete_secret(account)
    }
}

/// Counts live session services and can be told to fail one creation.
#[derive(Default)]
struct CountingServices {
    live: Arc<AtomicUsize>,
    peak: AtomicUsize,
    created: AtomicUsize,
    fail_on: AtomicUsize,
}

struct Counted(Arc<AtomicUsize>);

#[async_trait]
impl SessionServices for Counted {
    async fn shutdown(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionServicesFactory for CountingServices {
    async fn create(&self, _key: &MasterKey) -> VaultResult<Arc<dyn SessionServices>> {
        let call = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on.load(Ordering::SeqCst) {
            return Err(VaultError::Config("sync engine failed to start".into()));
        }
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
        Ok(Arc::new(Counted(self.live.clone())))
    }
}

/// Decrypt ciphers whose platform key cannot be loaded.
struct BrokenHardware;

#[async_trait]
impl BiometricCipherProvider for BrokenHardware {
    async fn create_cipher(
        &self,
        purpose: BiometricPurpose,
    ) -> Result<BiometricCipherHandle, CipherCreationError> {
        match purpose {
            BiometricPurpose::Encrypt => Err(CipherCreationError::KeyInvalidated),
            BiometricPurpose::Decrypt { iv } => {
                let materialize: Materializer =
                    Box::new(|_| Err(VaultError::Keystore("secure hardware busy".into())));
                Ok(BiometricCipherHandle::for_decryption(&iv, materialize)?)
            }
        }
    }

    async fn delete_cipher(&self) -> VaultResult<()> {
        Ok(())
    }
}

/// Fingerprint repository whose writes can be made to fail.
struct FlakyFingerprints {
    inner: Arc<dyn FingerprintReadWriteRepository>,
    fail: AtomicBool,
}

#[async_trait]
impl FingerprintReadWriteRepository for FlakyFingerprints {
    async fn get(&self) -> VaultResult<Option<Fingerprint>> {
        self.inner.get().await
    }

    async fn observe(&self) -> VaultResult<BoxStream<'static, Option<Fingerprint>>> {
        self.inner.observe().await
    }

    async fn put(&self, fingerprint: Option<&Fingerprint>) -> VaultResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(VaultError::Keystore("simulated crash".into()));
        }
        self.inner.put(fingerprint).await
    }
}

/// Key repository that stops accepting writes after a fixed number.
struct CountedKeys {
    inner: Arc<dyn KeyReadWriteRepository>,
    writes_left: AtomicUsize,
}

#[async_trait]
impl KeyReadWriteRepository for CountedKeys {
    async fn get(&self) -> VaultResult<Option<PersistedSession>> {
        self.inner.get().await
    }

    async fn observe(&self) -> VaultResult<BoxStream<'static, Option<PersistedSession>>> {
        self.inner.observe().await
    }

    async fn put(&self, session: Option<&PersistedSession>) -> VaultResult<()> {
        let left = self.writes_left.load(Ordering::SeqCst);
        if left == 0 {
            return Err(VaultError::Keystore("simulated crash".into()));
        }
        self.writes_left.store(left - 1, Ordering::SeqCst);
        self.inner.put(session).await
    }
}

#[tokio::test]
async fn test_password_round_trip_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());

    let manager = open(dir.path(), &secrets);
    manager.create_vault("correct horse", None).await.unwrap();
    let created = key_bytes(&manager);
    assert_eq!(
        manager.session().scope().unwrap().origin(),
        SessionOrigin::Created
    );
    drop(manager);

    let manager = open(dir.path(), &secrets);
    assert_eq!(manager.status().await.unwrap(), VaultStatus::Locked);
    manager.unlock_with_password("correct horse").await.unwrap();
    assert_eq!(key_bytes(&manager), created);
}

#[tokio::test]
async fn test_wrong_password_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());
    let manager = open(dir.path(), &secrets);
    manager.create_vault("right", None).await.unwrap();
    manager.lock(LockReason::User).await;

    let fingerprint = manager.repositories().fingerprints.get().await.unwrap();
    let session = manager.repositories().keys.get().await.unwrap();

    let err = manager.unlock_with_password("wrong").await.unwrap_err();
    assert!(matches!(err, VaultError::InvalidPassword));
    assert!(err.is_retryable());

    assert!(!manager.is_unlocked());
    assert_eq!(manager.session().lock_reason(), Some(LockReason::User));
    assert_eq!(manager.repositories().fingerprints.get().await.unwrap(), fingerprint);
    assert_eq!(manager.repositories().keys.get().await.unwrap(), session);
}

#[tokio::test]
async fn test_unlock_without_vault_is_not_setup() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());
    let manager = open(dir.path(), &secrets);

    assert!(matches!(
        manager.unlock_with_password("anything").await,
        Err(VaultError::NotSetup)
    ));
    assert!(matches!(
        manager.unlock_with_biometric(&Accept).await,
        Err(VaultError::NotSetup)
    ));
}

#[tokio::test]
async fn test_second_unlock_closes_first_scope() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());
    let manager = open(dir.path(), &secrets);
    manager.create_vault("pw", None).await.unwrap();

    let first = manager.session().scope().cloned().unwrap();
    let (a, b) = tokio::join!(
        manager.unlock_with_password("pw"),
        manager.unlock_with_password("pw")
    );
    a.unwrap();
    b.unwrap();

    let current = manager.session().scope().cloned().unwrap();
    assert!(first.is_closed());
    assert!(!current.is_closed());
    assert_ne!(first.id(), current.id());
    assert!(first.with_key(|_| ()).is_err());
}

#[tokio::test]
async fn test_change_password_rotates_key() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());
    let manager = open(dir.path(), &secrets);
    manager.create_vault("old", None).await.unwrap();
    let old_key = key_bytes(&manager);

    manager.change_password("old", "new").await.unwrap();
    let new_key = key_bytes(&manager);
    assert_ne!(old_key, new_key);

    let session = manager.repositories().keys.get().await.unwrap().unwrap();
    assert_eq!(session.slots.len(), 1);

    manager.lock(LockReason::User).await;
    assert!(matches!(
        manager.unlock_with_password("old").await,
        Err(VaultError::InvalidPassword)
    ));
    manager.unlock_with_password("new").await.unwrap();
    assert_eq!(key_bytes(&manager), new_key);
}

#[tokio::test]
async fn test_change_password_with_wrong_current_password() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());
    let manager = open(dir.path(), &secrets);
    manager.create_vault("old", None).await.unwrap();
    let key = key_bytes(&manager);

    assert!(matches!(
        manager.change_password("nope", "new").await,
        Err(VaultError::InvalidPassword)
    ));
    assert_eq!(key_bytes(&manager), key);
}

#[tokio::test]
async fn test_failed_fingerprint_commit_keeps_old_password() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());

    let base = open(dir.path(), &secrets);
    let mut repos = base.repositories().clone();
    let flaky = Arc::new(FlakyFingerprints {
        inner: repos.fingerprints.clone(),
        fail: AtomicBool::new(false),
    });
    repos.fingerprints = flaky.clone();
    let manager = SessionManager::new(
        repos,
        Arc::new(Argon2Kdf::new(config(dir.path()).kdf)),
    );

    manager.create_vault("old", None).await.unwrap();
    let original = key_bytes(&manager);

    flaky.fail.store(true, Ordering::SeqCst);
    assert!(manager.change_password("old", "new").await.is_err());
    assert_eq!(key_bytes(&manager), original);
    drop(manager);
    drop(base);

    let restarted = open(dir.path(), &secrets);
    restarted.unlock_with_password("old").await.unwrap();
    assert_eq!(key_bytes(&restarted), original);
    let session = restarted.repositories().keys.get().await.unwrap().unwrap();
    assert_eq!(session.slots.len(), 1);
}

#[tokio::test]
async fn test_crash_between_slot_and_fingerprint_commit() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());

    let base = open(dir.path(), &secrets);
    let mut repos = base.repositories().clone();
    let flaky = Arc::new(FlakyFingerprints {
        inner: repos.fingerprints.clone(),
        fail: AtomicBool::new(false),
    });
    let keys = Arc::new(CountedKeys {
        inner: repos.keys.clone(),
        writes_left: AtomicUsize::new(1),
    });
    repos.fingerprints = flaky.clone();
    repos.keys = keys.clone();
    let manager = SessionManager::new(
        repos,
        Arc::new(Argon2Kdf::new(config(dir.path()).kdf)),
    );

    manager.create_vault("old", None).await.unwrap();
    let original = key_bytes(&manager);

    // The new slot lands, then the process dies before anything else.
    keys.writes_left.store(1, Ordering::SeqCst);
    flaky.fail.store(true, Ordering::SeqCst);
    assert!(manager.change_password("old", "new").await.is_err());
    drop(manager);
    drop(base);

    let restarted = open(dir.path(), &secrets);
    let session = restarted.repositories().keys.get().await.unwrap().unwrap();
    assert_eq!(session.slots.len(), 2);

    assert!(matches!(
        restarted.unlock_with_password("new").await,
        Err(VaultError::InvalidPassword)
    ));
    restarted.unlock_with_password("old").await.unwrap();
    assert_eq!(key_bytes(&restarted), original);

    let session = restarted.repositories().keys.get().await.unwrap().unwrap();
    assert_eq!(session.slots.len(), 1);
}

#[tokio::test]
async fn test_biometric_unlock_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());
    let manager = open(dir.path(), &secrets);

    manager.create_vault("pw", Some(&Accept)).await.unwrap();
    assert!(manager.biometric_enabled().await.unwrap());
    let key = key_bytes(&manager);

    manager.lock(LockReason::User).await;
    manager.unlock_with_biometric(&Accept).await.unwrap();
    assert_eq!(key_bytes(&manager), key);
    assert_eq!(
        manager.session().scope().unwrap().origin(),
        SessionOrigin::Biometric
    );
}

#[tokio::test]
async fn test_dismissed_prompt_stays_locked() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());
    let manager = open(dir.path(), &secrets);
    manager.create_vault("pw", Some(&Accept)).await.unwrap();
    manager.lock(LockReason::User).await;

    let err = manager.unlock_with_biometric(&Dismiss).await.unwrap_err();
    assert!(matches!(err, VaultError::BiometricFailed(_)));
    assert!(!manager.is_unlocked());
    assert!(manager.biometric_enabled().await.unwrap());
}

#[tokio::test]
async fn test_materialize_failure_stays_locked() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());
    let manager = open(dir.path(), &secrets);
    manager.create_vault("pw", Some(&Accept)).await.unwrap();
    drop(manager);

    let manager = open(dir.path(), &secrets).with_biometrics(Arc::new(BrokenHardware));
    let err = manager.unlock_with_biometric(&Accept).await.unwrap_err();
    assert!(matches!(err, VaultError::Keystore(_)));
    assert!(!manager.is_unlocked());
    assert_eq!(manager.session().lock_reason(), None);
    assert!(manager.biometric_enabled().await.unwrap());
}

#[tokio::test]
async fn test_invalidated_biometric_key_disables_biometrics() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());
    let manager = open(dir.path(), &secrets);
    manager.create_vault("pw", Some(&Accept)).await.unwrap();
    manager.lock(LockReason::User).await;

    secrets.invalidate("biometric_unlock");
    assert!(matches!(
        manager.unlock_with_biometric(&Accept).await,
        Err(VaultError::BiometricInvalidated)
    ));

    assert!(!manager.biometric_enabled().await.unwrap());
    assert!(!secrets.contains("biometric_unlock"));
    assert_eq!(
        manager.session().lock_reason(),
        Some(LockReason::BiometricInvalidated)
    );
    assert!(matches!(
        manager.unlock_with_biometric(&Accept).await,
        Err(VaultError::BiometricNotEnabled)
    ));

    manager.unlock_with_password("pw").await.unwrap();
}

#[tokio::test]
async fn test_biometric_window_requires_password() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());
    let manager = open(dir.path(), &secrets);
    manager.create_vault("pw", Some(&Accept)).await.unwrap();
    manager.lock(LockReason::User).await;

    let repos = manager.repositories();
    repos
        .settings
        .set_biometric_timeout(Some(Duration::from_secs(60)))
        .await
        .unwrap();
    repos
        .metadata
        .set_last_password_use_timestamp(Utc::now() - chrono::Duration::minutes(2))
        .await
        .unwrap();

    assert_eq!(
        manager.biometric_unlock_remaining().await.unwrap(),
        Some(Duration::ZERO)
    );
    assert!(matches!(
        manager.unlock_with_biometric(&Accept).await,
        Err(VaultError::PasswordRequired)
    ));

    manager.unlock_with_password("pw").await.unwrap();
    manager.lock(LockReason::User).await;
    manager.unlock_with_biometric(&Accept).await.unwrap();
}

#[tokio::test]
async fn test_password_change_turns_biometrics_off() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());
    let manager = open(dir.path(), &secrets);
    manager.create_vault("old", Some(&Accept)).await.unwrap();

    manager.change_password("old", "new").await.unwrap();
    assert!(!manager.biometric_enabled().await.unwrap());
    assert!(!secrets.contains("biometric_unlock"));

    manager.enable_biometric(&Accept).await.unwrap();
    let key = key_bytes(&manager);
    manager.lock(LockReason::User).await;
    manager.unlock_with_biometric(&Accept).await.unwrap();
    assert_eq!(key_bytes(&manager), key);
}

#[tokio::test]
async fn test_tampered_fingerprint_store_is_corrupted() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());
    let manager = open(dir.path(), &secrets);
    manager.create_vault("pw", None).await.unwrap();
    drop(manager);

    let path = dir
        .path()
        .join(format!("{}.enc", Files::Fingerprint.filename()));
    std::fs::write(&path, b"definitely not ciphertext").unwrap();

    let manager = open(dir.path(), &secrets);
    assert_eq!(manager.status().await.unwrap(), VaultStatus::Corrupted);
    let err = manager.unlock_with_password("pw").await.unwrap_err();
    assert!(matches!(err, VaultError::Corrupted(_)));
    assert_eq!(err.kind(), ErrorKind::Corruption);

    manager.create_vault("pw2", None).await.unwrap();
    manager.lock(LockReason::User).await;
    assert_eq!(manager.status().await.unwrap(), VaultStatus::Locked);
    manager.unlock_with_password("pw2").await.unwrap();
}

#[tokio::test]
async fn test_reset_recovers_a_half_written_vault() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());
    let manager = open(dir.path(), &secrets);
    manager.create_vault("pw", Some(&Accept)).await.unwrap();
    manager.lock(LockReason::User).await;
    manager.repositories().keys.put(None).await.unwrap();

    assert!(matches!(
        manager.unlock_with_biometric(&Accept).await,
        Err(VaultError::Corrupted(_))
    ));

    manager.reset_vault().await.unwrap();
    assert_eq!(manager.status().await.unwrap(), VaultStatus::NotSetup);
    assert!(!secrets.contains("biometric_unlock"));
    assert!(matches!(
        manager.unlock_with_password("pw").await,
        Err(VaultError::NotSetup)
    ));
    manager.create_vault("pw", None).await.unwrap();
}

#[tokio::test]
async fn test_denied_keychain_does_not_wipe_vault() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());
    open(dir.path(), &secrets)
        .create_vault("pw", None)
        .await
        .unwrap();

    let denying = Arc::new(DenyingSecrets {
        inner: secrets.clone(),
        deny: AtomicBool::new(true),
    });
    let manager = SessionManager::from_config(&config(dir.path()), denying.clone()).unwrap();

    let err = manager.unlock_with_password("pw").await.unwrap_err();
    assert!(matches!(err, VaultError::Keystore(_)), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert!(dir
        .path()
        .join(format!("{}.enc", Files::Fingerprint.filename()))
        .exists());

    denying.deny.store(false, Ordering::SeqCst);
    assert_eq!(manager.status().await.unwrap(), VaultStatus::Locked);
    manager.unlock_with_password("pw").await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_failed_fingerprint_write_on_disk_keeps_old_password() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());
    let manager = open(dir.path(), &secrets);
    manager.create_vault("old", None).await.unwrap();
    let original = key_bytes(&manager);

    // A non-empty directory in place of the file makes the rename fail.
    let path = dir
        .path()
        .join(format!("{}.enc", Files::Fingerprint.filename()));
    std::fs::remove_file(&path).unwrap();
    std::fs::create_dir(&path).unwrap();
    std::fs::write(path.join("blocker"), b"x").unwrap();

    assert!(manager.change_password("old", "new").await.is_err());
    assert_eq!(key_bytes(&manager), original);

    manager.lock(LockReason::User).await;
    assert!(matches!(
        manager.unlock_with_password("new").await,
        Err(VaultError::InvalidPassword)
    ));
    manager.unlock_with_password("old").await.unwrap();
    assert_eq!(key_bytes(&manager), original);
    let session = manager.repositories().keys.get().await.unwrap().unwrap();
    assert_eq!(session.slots.len(), 1);
}

#[tokio::test]
async fn test_session_services_never_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());
    let services = Arc::new(CountingServices::default());
    let manager = open(dir.path(), &secrets).with_services(services.clone());

    manager.create_vault("pw", None).await.unwrap();
    let (a, b) = tokio::join!(
        manager.unlock_with_password("pw"),
        manager.unlock_with_password("pw")
    );
    a.unwrap();
    b.unwrap();
    manager.change_password("pw", "next").await.unwrap();

    assert_eq!(services.created.load(Ordering::SeqCst), 4);
    assert_eq!(services.peak.load(Ordering::SeqCst), 1);
    assert_eq!(services.live.load(Ordering::SeqCst), 1);

    manager.lock(LockReason::User).await;
    assert_eq!(services.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_service_start_leaves_session_empty() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());
    let services = Arc::new(CountingServices::default());
    let manager = open(dir.path(), &secrets).with_services(services.clone());
    manager.create_vault("pw", None).await.unwrap();
    let first = manager.session().scope().cloned().unwrap();

    services.fail_on.store(2, Ordering::SeqCst);
    assert!(manager.unlock_with_password("pw").await.is_err());

    assert!(first.is_closed());
    assert!(!manager.is_unlocked());
    assert_eq!(services.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_service_start_after_password_change_locks() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());
    let services = Arc::new(CountingServices::default());
    let manager = open(dir.path(), &secrets).with_services(services.clone());
    manager.create_vault("old", None).await.unwrap();
    let old_scope = manager.session().scope().cloned().unwrap();

    services.fail_on.store(2, Ordering::SeqCst);
    assert!(manager.change_password("old", "new").await.is_err());

    assert!(old_scope.is_closed());
    assert!(!manager.is_unlocked());
    assert_eq!(manager.session().lock_reason(), Some(LockReason::KeyRotation));

    assert!(matches!(
        manager.unlock_with_password("old").await,
        Err(VaultError::InvalidPassword)
    ));
    manager.unlock_with_password("new").await.unwrap();
}

#[tokio::test]
async fn test_prompt_receives_confirmation_setting() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());
    let manager = open(dir.path(), &secrets);
    let prompt = Recording::default();

    manager.create_vault("pw", Some(&prompt)).await.unwrap();
    manager
        .repositories()
        .settings
        .set_biometric_require_confirmation(false)
        .await
        .unwrap();
    manager.lock(LockReason::User).await;
    manager.unlock_with_biometric(&prompt).await.unwrap();

    let seen = prompt.seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            BiometricPromptOptions {
                require_confirmation: true
            },
            BiometricPromptOptions {
                require_confirmation: false
            },
        ]
    );
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_auto_lock_uses_stored_setting() {
    let dir = tempfile::tempdir().unwrap();
    let secrets = Arc::new(MemorySecretStore::new());
    let manager = Arc::new(open(dir.path(), &secrets));
    manager.create_vault("pw", None).await.unwrap();
    manager
        .repositories()
        .settings
        .set_lock_after(Some(Duration::from_secs(30)))
        .await
        .unwrap();

    tokio::time::pause();
    let _locker = manager.auto_locker().unwrap();
    settle().await;

    tokio::time::advance(Duration::from_secs(29)).await;
    settle().await;
    assert!(manager.is_unlocked());

    tokio::time::advance(Duration::from_secs(2)).await;
    settle().await;
    assert!(!manager.is_unlocked());
    assert_eq!(manager.session().lock_reason(), Some(LockReason::Inactivity));
}
