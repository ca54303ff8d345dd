//! SessionManager - the master session state machine.
//!
//! Owns the only live master key. Every transition (create, unlock, lock,
//! password change, biometric enrollment) runs under one transition lock, so
//! transitions never interleave. Unlock paths fail closed: whatever goes
//! wrong, the published state is left as it was.
//!
//! Password change ordering:
//! 1. commit the persisted session with the new key slot added,
//! 2. commit the new fingerprint,
//! 3. prune the retired slot,
//! 4. swap the live key.
//!
//! A crash between 1 and 2 leaves the old fingerprint and the old slot on
//! disk, so the previous password still unlocks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vaultlock_keychain::SecretStore;
use zeroize::Zeroizing;

use super::keyslot::PasswordMaterial;
use super::locker::{SessionLockTarget, SessionLocker};
use super::scope::{NoServices, SessionOrigin, SessionScope, SessionServicesFactory};
use super::state::MasterSession;
use crate::biometric::{
    BiometricCipherHandle, BiometricCipherProvider, BiometricPrompt, BiometricPromptOptions,
    BiometricPurpose, BiometricStatus, CipherCreationError, KeychainBiometricCipher,
};
use crate::error::{VaultError, VaultResult};
use crate::security::{Argon2Kdf, KeyDerivation, MasterKey};
use crate::storage::{Keystore, StoreFactory, VaultConfig};
use crate::vault::{
    Fingerprint, FingerprintBiometric, LockReason, PersistedSession, Repositories,
    SettingsLockTimeout, VaultStatus,
};

/// Re-keys whatever the master key protects when the password changes.
///
/// Called with the old and the new key before anything is persisted. If
/// persisting then fails, it is called again with the keys swapped.
#[async_trait]
pub trait KeyRotationHook: Send + Sync {
    async fn rotate(&self, old: &MasterKey, new: &MasterKey) -> VaultResult<()>;
}

/// Rotation hook for callers with nothing to re-key.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRotation;

#[async_trait]
impl KeyRotationHook for NoRotation {
    async fn rotate(&self, _old: &MasterKey, _new: &MasterKey) -> VaultResult<()> {
        Ok(())
    }
}

pub struct SessionManager {
    repos: Repositories,
    kdf: Arc<dyn KeyDerivation>,
    biometrics: Option<Arc<dyn BiometricCipherProvider>>,
    services: Arc<dyn SessionServicesFactory>,
    rotation: Arc<dyn KeyRotationHook>,
    sessions: watch::Sender<MasterSession>,
    transition: Mutex<()>,
    keep_alive_debounce: Duration,
}

impl SessionManager {
    pub fn new(repos: Repositories, kdf: Arc<dyn KeyDerivation>) -> Self {
        Self {
            repos,
            kdf,
            biometrics: None,
            services: Arc::new(NoServices),
            rotation: Arc::new(NoRotation),
            sessions: watch::channel(MasterSession::default()).0,
            transition: Mutex::new(()),
            keep_alive_debounce: VaultConfig::default().keep_alive_debounce(),
        }
    }

    /// Store-backed manager for `config`, keeping every store key and the
    /// biometric unlock key in `secrets`.
    pub fn from_config(config: &VaultConfig, secrets: Arc<dyn SecretStore>) -> VaultResult<Self> {
        config.validate()?;
        let stores = StoreFactory::new(config, Keystore::new(secrets.clone()));
        let repos = Repositories::from_stores(&stores, config);

        info!("Session manager using data dir {:?}", config.data_dir);
        Ok(Self::new(repos, Arc::new(Argon2Kdf::new(config.kdf)))
            .with_biometrics(Arc::new(KeychainBiometricCipher::new(secrets)))
            .with_keep_alive_debounce(config.keep_alive_debounce()))
    }

    pub fn with_biometrics(mut self, provider: Arc<dyn BiometricCipherProvider>) -> Self {
        self.biometrics = Some(provider);
        self
    }

    pub fn with_services(mut self, factory: Arc<dyn SessionServicesFactory>) -> Self {
        self.services = factory;
        self
    }

    pub fn with_rotation_hook(mut self, hook: Arc<dyn KeyRotationHook>) -> Self {
        self.rotation = hook;
        self
    }

    /// How long the auto-locker waits after the last keep-alive goes away
    /// before it arms.
    pub fn with_keep_alive_debounce(mut self, debounce: Duration) -> Self {
        self.keep_alive_debounce = debounce;
        self
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    /// Auto-locker driven by the stored lock-after setting.
    pub fn auto_locker(self: &Arc<Self>) -> VaultResult<SessionLocker> {
        SessionLocker::new(
            self.clone(),
            Arc::new(SettingsLockTimeout(self.repos.settings.clone())),
            self.keep_alive_debounce,
        )
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    pub fn session(&self) -> MasterSession {
        self.sessions.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MasterSession> {
        self.sessions.subscribe()
    }

    pub fn is_unlocked(&self) -> bool {
        self.sessions.borrow().is_unlocked()
    }

    pub async fn status(&self) -> VaultResult<VaultStatus> {
        if self.is_unlocked() {
            return Ok(VaultStatus::Unlocked);
        }
        let fingerprint = self.repos.fingerprints.get().await?;
        let session = self.repos.keys.get().await?;
        Ok(match (fingerprint, session) {
            (None, None) => VaultStatus::NotSetup,
            (Some(_), Some(_)) => VaultStatus::Locked,
            _ => VaultStatus::Corrupted,
        })
    }

    /// Run `f` against the live master key.
    pub fn with_master_key<R>(&self, f: impl FnOnce(&MasterKey) -> R) -> VaultResult<R> {
        let scope = self.current_scope().ok_or(VaultError::Locked)?;
        scope.with_key(f)
    }

    fn current_scope(&self) -> Option<Arc<SessionScope>> {
        self.sessions.borrow().scope().cloned()
    }

    // ------------------------------------------------------------------
    // Setup and unlock
    // ------------------------------------------------------------------

    /// Set up a new vault protected by `password` and unlock it.
    ///
    /// With a prompt, biometric unlock is enabled right after. A biometric
    /// failure is logged and leaves the vault created without it.
    pub async fn create_vault(
        &self,
        password: &str,
        biometric: Option<&dyn BiometricPrompt>,
    ) -> VaultResult<()> {
        {
            let _transition = self.transition.lock().await;

            let fingerprint = self.repos.fingerprints.get().await?;
            let session = self.repos.keys.get().await?;
            match (&fingerprint, &session) {
                (Some(_), Some(_)) => return Err(VaultError::AlreadyExists),
                (None, None) => {}
                _ => warn!("Replacing a half-written vault that can no longer be unlocked"),
            }

            info!("Creating new vault");
            let master = MasterKey::generate();
            let material = PasswordMaterial::generate(self.kdf.clone(), password).await?;

            let session = PersistedSession::new(material.wrap(&master)?);
            self.repos.keys.put(Some(&session)).await?;
            self.repos
                .fingerprints
                .put(Some(&Fingerprint {
                    version: self.kdf.version(),
                    master: material.fingerprint(),
                    biometric: None,
                }))
                .await?;

            self.record_password_use().await;
            self.enter_key(master, SessionOrigin::Created).await?;
            info!("Vault created successfully");
        }

        if let Some(prompt) = biometric {
            if let Err(e) = self.enable_biometric(prompt).await {
                warn!("Vault created without biometric unlock: {}", e);
            }
        }
        Ok(())
    }

    pub async fn unlock_with_password(&self, password: &str) -> VaultResult<()> {
        let _transition = self.transition.lock().await;
        debug!("Unlocking with password");

        let (fingerprint, session) = self.credentials().await?;

        let material = self.check_password(password, &fingerprint).await?;
        let slot = session.slot(&material.key_id).ok_or_else(|| {
            VaultError::Corrupted("no key slot matches the stored fingerprint".into())
        })?;
        let master = material.unwrap(slot)?;

        if session.slots.len() > 1 {
            self.prune_slots(&session, &material.key_id).await;
        }
        self.record_password_use().await;
        self.enter_key(master, SessionOrigin::Password).await?;

        info!("Vault unlocked with password");
        Ok(())
    }

    pub async fn unlock_with_biometric(&self, prompt: &dyn BiometricPrompt) -> VaultResult<()> {
        let provider = self.biometric_provider()?;
        let _transition = self.transition.lock().await;
        debug!("Unlocking with biometric");

        let (fingerprint, _) = self.credentials().await?;
        let wrapped = fingerprint
            .biometric
            .clone()
            .ok_or(VaultError::BiometricNotEnabled)?;

        if self.biometric_window_remaining().await? == Some(Duration::ZERO) {
            info!("Biometric unlock window elapsed, password required");
            return Err(VaultError::PasswordRequired);
        }

        let cipher = match provider
            .create_cipher(BiometricPurpose::Decrypt { iv: wrapped.iv })
            .await
        {
            Ok(cipher) => cipher,
            Err(CipherCreationError::KeyInvalidated) => {
                self.drop_biometric(provider.as_ref(), fingerprint).await;
                return Err(VaultError::BiometricInvalidated);
            }
            Err(CipherCreationError::Vault(e)) => return Err(e),
        };

        prompt.authenticate(&cipher, &self.prompt_options().await?).await?;

        let plaintext =
            match run_cipher(cipher, Zeroizing::new(wrapped.encrypted_master_key)).await {
                Ok(plaintext) => plaintext,
                Err(VaultError::BiometricInvalidated) => {
                    self.drop_biometric(provider.as_ref(), fingerprint).await;
                    return Err(VaultError::BiometricInvalidated);
                }
                Err(e) => {
                    warn!("Biometric unlock failed: {}", e);
                    return Err(e);
                }
            };

        let master = MasterKey::from_slice(&plaintext)?;
        self.enter_key(master, SessionOrigin::Biometric).await?;

        info!("Vault unlocked with biometric");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lock
    // ------------------------------------------------------------------

    /// Discard the live key. Returns once the session scope is torn down.
    pub async fn lock(&self, reason: LockReason) {
        let _transition = self.transition.lock().await;
        self.clear(reason).await;
    }

    /// Forget the stored credentials so a new vault can be created.
    ///
    /// The way out of a vault whose fingerprint and key slots no longer
    /// match. Settings are kept.
    pub async fn reset_vault(&self) -> VaultResult<()> {
        let _transition = self.transition.lock().await;
        warn!("Resetting vault credentials");

        if let MasterSession::Key(scope) = self
            .sessions
            .send_replace(MasterSession::Empty { reason: None })
        {
            scope.close().await;
        }

        if let Some(provider) = &self.biometrics {
            if let Err(e) = provider.delete_cipher().await {
                warn!("Failed to delete biometric key during reset: {}", e);
            }
        }
        self.repos.keys.put(None).await?;
        self.repos.fingerprints.put(None).await?;
        Ok(())
    }

    /// The platform detected a reboot.
    pub async fn handle_reboot(&self) {
        self.lock(LockReason::Reboot).await;
    }

    /// The master key was rotated elsewhere (another device changed the
    /// password); the live key is stale.
    pub async fn handle_key_rotated(&self) {
        self.lock(LockReason::KeyRotation).await;
    }

    // ------------------------------------------------------------------
    // Password change
    // ------------------------------------------------------------------

    /// Replace the master password and the master key.
    ///
    /// Biometric unlock wrapped the previous key and is turned off.
    pub async fn change_password(&self, current: &str, new: &str) -> VaultResult<()> {
        let _transition = self.transition.lock().await;
        let scope = self.current_scope().ok_or(VaultError::Locked)?;
        let (fingerprint, session) = self.credentials().await?;

        let material = self.check_password(current, &fingerprint).await?;
        let slot = session.slot(&material.key_id).ok_or_else(|| {
            VaultError::Corrupted("no key slot matches the stored fingerprint".into())
        })?;
        let old_master = material.unwrap(slot)?;
        if !scope.with_key(|live| live == &old_master)? {
            return Err(VaultError::Corrupted(
                "live key does not match the stored session".into(),
            ));
        }

        info!("Changing master password");
        let new_master = MasterKey::generate();
        self.rotation.rotate(&old_master, &new_master).await?;

        let next = PasswordMaterial::generate(self.kdf.clone(), new).await?;
        let rotating = session.with_slot(next.wrap(&new_master)?);

        if let Err(e) = self.repos.keys.put(Some(&rotating)).await {
            error!("Failed to write new key slot: {}", e);
            self.undo_rotation(&old_master, &new_master).await;
            return Err(e);
        }

        let new_fingerprint = Fingerprint {
            version: self.kdf.version(),
            master: next.fingerprint(),
            biometric: None,
        };
        if let Err(e) = self.repos.fingerprints.put(Some(&new_fingerprint)).await {
            error!("Failed to commit new fingerprint, keeping old password: {}", e);
            if let Err(e) = self.repos.keys.put(Some(&session)).await {
                warn!("Failed to remove unused key slot: {}", e);
            }
            self.undo_rotation(&old_master, &new_master).await;
            return Err(e);
        }
        debug!("New fingerprint committed");

        if fingerprint.biometric.is_some() {
            if let Some(provider) = &self.biometrics {
                if let Err(e) = provider.delete_cipher().await {
                    warn!("Failed to delete biometric key after password change: {}", e);
                }
            }
            info!("Biometric unlock disabled by password change");
        }

        self.prune_slots(&rotating, &next.key_id).await;
        self.record_password_use().await;
        if let Err(e) = self
            .enter_key(new_master, SessionOrigin::PasswordChange)
            .await
        {
            // Disk already holds the new key; the old one must not stay live.
            error!("Failed to start session with the new key: {}", e);
            self.clear(LockReason::KeyRotation).await;
            return Err(e);
        }

        info!("Master password changed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Biometrics
    // ------------------------------------------------------------------

    pub async fn biometric_status(&self) -> BiometricStatus {
        match &self.biometrics {
            Some(provider) => provider.availability().await,
            None => BiometricStatus::Unavailable {
                reason: "no biometric cipher on this platform".into(),
            },
        }
    }

    pub async fn biometric_enabled(&self) -> VaultResult<bool> {
        Ok(self
            .repos
            .fingerprints
            .get()
            .await?
            .is_some_and(|fingerprint| fingerprint.biometric.is_some()))
    }

    /// Time left before biometric unlock requires the password again.
    /// `None` when no biometric timeout is configured.
    pub async fn biometric_unlock_remaining(&self) -> VaultResult<Option<Duration>> {
        self.biometric_window_remaining().await
    }

    /// Wrap the live key for biometric unlock.
    pub async fn enable_biometric(&self, prompt: &dyn BiometricPrompt) -> VaultResult<()> {
        let provider = self.biometric_provider()?;
        let _transition = self.transition.lock().await;
        let scope = self.current_scope().ok_or(VaultError::Locked)?;

        let mut fingerprint = self
            .repos
            .fingerprints
            .get()
            .await?
            .ok_or(VaultError::NotSetup)?;

        let cipher = match provider.create_cipher(BiometricPurpose::Encrypt).await {
            Ok(cipher) => cipher,
            Err(CipherCreationError::KeyInvalidated) => {
                warn!("Biometric key was invalidated, recreating it");
                provider.delete_cipher().await?;
                provider.create_cipher(BiometricPurpose::Encrypt).await?
            }
            Err(CipherCreationError::Vault(e)) => return Err(e),
        };

        prompt.authenticate(&cipher, &self.prompt_options().await?).await?;

        let iv = cipher.iv().to_vec();
        let key = Zeroizing::new(scope.with_key(|key| key.as_bytes().to_vec())?);
        let encrypted = run_cipher(cipher, key).await?;

        fingerprint.biometric = Some(FingerprintBiometric {
            iv,
            encrypted_master_key: encrypted.to_vec(),
        });
        self.repos.fingerprints.put(Some(&fingerprint)).await?;

        info!("Biometric unlock enabled");
        Ok(())
    }

    pub async fn disable_biometric(&self) -> VaultResult<()> {
        let _transition = self.transition.lock().await;
        let mut fingerprint = self
            .repos
            .fingerprints
            .get()
            .await?
            .ok_or(VaultError::NotSetup)?;

        if let Some(provider) = &self.biometrics {
            if let Err(e) = provider.delete_cipher().await {
                warn!("Failed to delete biometric key: {}", e);
            }
        }
        if fingerprint.biometric.take().is_some() {
            self.repos.fingerprints.put(Some(&fingerprint)).await?;
            info!("Biometric unlock disabled");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn biometric_provider(&self) -> VaultResult<Arc<dyn BiometricCipherProvider>> {
        self.biometrics.clone().ok_or_else(|| {
            VaultError::Unsupported("biometric unlock is not available on this platform".into())
        })
    }

    async fn check_password(
        &self,
        password: &str,
        fingerprint: &Fingerprint,
    ) -> VaultResult<PasswordMaterial> {
        if fingerprint.version != self.kdf.version() {
            return Err(VaultError::Corrupted(format!(
                "fingerprint version {} is not supported",
                fingerprint.version
            )));
        }

        let material =
            PasswordMaterial::recover(self.kdf.clone(), password, &fingerprint.master).await?;
        if !material.matches(&fingerprint.master) {
            warn!("Password does not match stored fingerprint");
            return Err(VaultError::InvalidPassword);
        }
        Ok(material)
    }

    async fn biometric_window_remaining(&self) -> VaultResult<Option<Duration>> {
        let Some(window) = self.repos.settings.biometric_timeout().await? else {
            return Ok(None);
        };
        let Some(last) = self.repos.metadata.get_last_password_use_timestamp().await? else {
            return Ok(Some(Duration::ZERO));
        };
        // A clock that went backwards counts as no time elapsed.
        let elapsed = (Utc::now() - last).to_std().unwrap_or(Duration::ZERO);
        Ok(Some(window.saturating_sub(elapsed)))
    }

    async fn record_password_use(&self) {
        if let Err(e) = self
            .repos
            .metadata
            .set_last_password_use_timestamp(Utc::now())
            .await
        {
            warn!("Failed to record password use: {}", e);
        }
    }

    async fn prune_slots(&self, session: &PersistedSession, keep: &Uuid) {
        let Some(pruned) = session.retain_only(keep) else {
            return;
        };
        if pruned.slots.len() == session.slots.len() {
            return;
        }
        match self.repos.keys.put(Some(&pruned)).await {
            Ok(()) => debug!("Pruned {} stale key slots", session.slots.len() - 1),
            Err(e) => warn!("Failed to prune stale key slots: {}", e),
        }
    }

    async fn undo_rotation(&self, old: &MasterKey, new: &MasterKey) {
        if let Err(e) = self.rotation.rotate(new, old).await {
            error!("Failed to roll back key rotation: {}", e);
        }
    }

    /// Turn biometric unlock off after the platform revoked its key.
    async fn drop_biometric(
        &self,
        provider: &dyn BiometricCipherProvider,
        mut fingerprint: Fingerprint,
    ) {
        warn!("Biometric key was invalidated, disabling biometric unlock");
        if let Err(e) = provider.delete_cipher().await {
            warn!("Failed to delete invalidated biometric key: {}", e);
        }
        fingerprint.biometric = None;
        if let Err(e) = self.repos.fingerprints.put(Some(&fingerprint)).await {
            warn!("Failed to clear biometric fingerprint: {}", e);
        }
        self.sessions.send_if_modified(|session| {
            if session.is_unlocked() {
                return false;
            }
            *session = MasterSession::Empty {
                reason: Some(LockReason::BiometricInvalidated),
            };
            true
        });
    }

    /// Enter `Key`, tearing down any previous scope first.
    /// The previous scope is closed before services for the new key are
    /// created, so at most one set of services is ever live. If the factory
    /// fails the session is left empty.
    async fn enter_key(&self, key: MasterKey, origin: SessionOrigin) -> VaultResult<()> {
        if let MasterSession::Key(previous) = self
            .sessions
            .send_replace(MasterSession::Empty { reason: None })
        {
            info!("Session {} superseded", previous.id());
            previous.close().await;
        }

        let services = match self.services.create(&key).await {
            Ok(services) => services,
            Err(e) => {
                error!("Failed to create session services: {}", e);
                return Err(e);
            }
        };
        let scope = Arc::new(SessionScope::new(key, origin, services));

        info!("Session {} started ({:?})", scope.id(), origin);
        self.sessions.send_replace(MasterSession::Key(scope));
        Ok(())
    }

    /// Stored fingerprint and key slots. Having one without the other means
    /// the vault cannot be unlocked and has to be reset.
    async fn credentials(&self) -> VaultResult<(Fingerprint, PersistedSession)> {
        let fingerprint = self.repos.fingerprints.get().await?;
        let session = self.repos.keys.get().await?;
        match (fingerprint, session) {
            (Some(fingerprint), Some(session)) => Ok((fingerprint, session)),
            (None, None) => Err(VaultError::NotSetup),
            (fingerprint, _) => {
                error!(
                    "Vault credentials out of step (fingerprint present: {})",
                    fingerprint.is_some()
                );
                Err(VaultError::Corrupted(
                    "fingerprint and key slots are out of step".into(),
                ))
            }
        }
    }

    async fn prompt_options(&self) -> VaultResult<BiometricPromptOptions> {
        Ok(BiometricPromptOptions {
            require_confirmation: self.repos.settings.biometric_require_confirmation().await?,
        })
    }

    async fn clear(&self, reason: LockReason) {
        let previous = self.sessions.send_replace(MasterSession::Empty {
            reason: Some(reason),
        });
        match previous {
            MasterSession::Key(scope) => {
                scope.close().await;
                info!("Session locked: {}", reason);
            }
            MasterSession::Empty { .. } => debug!("Lock requested while already locked"),
        }
    }
}

#[async_trait]
impl SessionLockTarget for SessionManager {
    fn subscribe(&self) -> watch::Receiver<MasterSession> {
        SessionManager::subscribe(self)
    }

    async fn lock_session(&self, session: Uuid, reason: LockReason) {
        let _transition = self.transition.lock().await;
        match self.current_scope() {
            Some(scope) if scope.id() == session => self.clear(reason).await,
            _ => debug!("Ignoring {} lock for session {} which is no longer current", reason, session),
        }
    }
}

/// Materialize and run a biometric cipher on the blocking pool.
async fn run_cipher(
    cipher: BiometricCipherHandle,
    input: Zeroizing<Vec<u8>>,
) -> VaultResult<Zeroizing<Vec<u8>>> {
    tokio::task::spawn_blocking(move || {
        cipher.materialize()?;
        cipher.encode(&input).map(Zeroizing::new)
    })
    .await
    .map_err(|e| VaultError::BiometricFailed(format!("cipher task failed: {}", e)))?
}
