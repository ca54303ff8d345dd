//! Encrypted key-value store.
//!
//! One store is one `<name>.enc` file holding a JSON map, sealed with
//! AES-256-GCM under a keystore key of its own. The map is loaded once and
//! kept in memory; reads are served from there, writes are applied in memory
//! immediately and persisted in issue order by a background writer task. A
//! committed write that fails on disk is rolled back in memory as well.
//!
//! Loading follows a retry-with-recreate policy. When the keystore entry was
//! invalidated or the file fails authentication, the file and the keystore
//! alias are deleted and loading starts over, up to `max_attempts` times.
//! After that the store reports [`VaultError::StoreUnavailable`]; it never
//! falls back to plaintext and never serves ciphertext it could not
//! authenticate. Other keychain failures are reported as they are and leave
//! everything on disk untouched.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, OnceCell};
use tracing::{debug, error, info, warn};

use super::files::Files;
use super::keystore::{Keystore, KeystoreError, KeystoreKey};
use crate::error::{VaultError, VaultResult};
use crate::security::crypto;

type Entries = BTreeMap<String, Value>;

enum WriteOp {
    Replace(Vec<u8>),
    Delete,
}

struct WriteRequest {
    op: WriteOp,
    ack: Option<oneshot::Sender<VaultResult<()>>>,
}

/// Why a single load attempt failed.
enum LoadFailure {
    /// Keystore entry or ciphertext is unusable. Recreating may help.
    Security(String),
    /// Recreating would not help (I/O, unsupported platform, ...).
    Fatal(VaultError),
}

struct Loaded {
    entries: Mutex<Entries>,
    watchers: Mutex<HashMap<String, watch::Sender<Option<Value>>>>,
    writer: mpsc::UnboundedSender<WriteRequest>,
}

pub struct EncryptedKeyValueStore {
    file: Files,
    path: PathBuf,
    keystore: Keystore,
    max_attempts: u32,
    loaded: OnceCell<Arc<Loaded>>,
}

impl EncryptedKeyValueStore {
    pub fn new(file: Files, data_dir: &Path, keystore: Keystore, max_attempts: u32) -> Self {
        Self {
            file,
            path: data_dir.join(format!("{}.enc", file.filename())),
            keystore,
            max_attempts: max_attempts.max(1),
            loaded: OnceCell::new(),
        }
    }

    pub fn file(&self) -> Files {
        self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, key: &str) -> VaultResult<Option<Value>> {
        let loaded = self.loaded().await?;
        let entries = lock(&loaded.entries);
        Ok(entries.get(key).cloned())
    }

    /// Current value without waiting. `None` as well when the store has not
    /// been loaded yet.
    pub fn snapshot(&self, key: &str) -> Option<Value> {
        let loaded = self.loaded.get()?;
        let entries = lock(&loaded.entries);
        entries.get(key).cloned()
    }

    pub async fn keys(&self) -> VaultResult<Vec<String>> {
        let loaded = self.loaded().await?;
        let entries = lock(&loaded.entries);
        Ok(entries.keys().cloned().collect())
    }

    /// Set `key`. Visible to readers immediately; persisted in the background.
    pub async fn set(&self, key: &str, value: Value) -> VaultResult<()> {
        self.write(key, Some(value), false).await
    }

    /// Set `key` and return only once the file on disk holds the new value.
    pub async fn set_and_commit(&self, key: &str, value: Value) -> VaultResult<()> {
        self.write(key, Some(value), true).await
    }

    pub async fn remove(&self, key: &str) -> VaultResult<()> {
        self.write(key, None, false).await
    }

    pub async fn remove_and_commit(&self, key: &str) -> VaultResult<()> {
        self.write(key, None, true).await
    }

    /// Stream of the value under `key`: the current value first, then the
    /// value after every write. Intermediate values may be coalesced when
    /// the consumer lags.
    pub async fn watch(&self, key: &str) -> VaultResult<BoxStream<'static, Option<Value>>> {
        let loaded = self.loaded().await?;
        let rx = {
            let entries = lock(&loaded.entries);
            let mut watchers = lock(&loaded.watchers);
            watchers
                .entry(key.to_string())
                .or_insert_with(|| watch::channel(entries.get(key).cloned()).0)
                .subscribe()
        };

        let values = stream::unfold((rx, true), |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let value = rx.borrow_and_update().clone();
            Some((value, (rx, false)))
        });
        Ok(values.boxed())
    }

    /// Drop every key and delete the file. The keystore key is kept.
    pub async fn clear(&self) -> VaultResult<()> {
        let loaded = self.loaded().await?;
        let (ack, done) = oneshot::channel();
        {
            let mut entries = lock(&loaded.entries);
            entries.clear();
            for sender in lock(&loaded.watchers).values() {
                sender.send_replace(None);
            }
            self.enqueue(&loaded, WriteOp::Delete, Some(ack))?;
        }
        info!("Cleared store {}", self.file);
        self.await_ack(done).await
    }

    async fn write(&self, key: &str, value: Option<Value>, commit: bool) -> VaultResult<()> {
        let loaded = self.loaded().await?;
        let (ack, done) = if commit {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let previous = {
            // The snapshot is taken and queued under the entries lock, so the
            // writer sees mutations in the order they were applied.
            let mut entries = lock(&loaded.entries);
            let previous = match &value {
                Some(v) => entries.insert(key.to_string(), v.clone()),
                None => entries.remove(key),
            };
            let plaintext = serde_json::to_vec(&*entries)?;
            self.enqueue(&loaded, WriteOp::Replace(plaintext), ack)?;

            if let Some(sender) = lock(&loaded.watchers).get(key) {
                sender.send_replace(value.clone());
            }
            previous
        };

        let Some(done) = done else {
            return Ok(());
        };
        let result = self.await_ack(done).await;
        if let Err(e) = &result {
            warn!(
                "Commit of {} in store {} failed, restoring previous value: {}",
                key, self.file, e
            );
            self.restore(&loaded, key, &value, previous);
        }
        result
    }

    /// Undo a write whose commit failed, unless `key` was overwritten since.
    fn restore(
        &self,
        loaded: &Loaded,
        key: &str,
        written: &Option<Value>,
        previous: Option<Value>,
    ) {
        let mut entries = lock(&loaded.entries);
        if entries.get(key) != written.as_ref() {
            return;
        }
        match &previous {
            Some(v) => entries.insert(key.to_string(), v.clone()),
            None => entries.remove(key),
        };

        // Supersede any queued snapshot that still carries the failed value.
        match serde_json::to_vec(&*entries) {
            Ok(plaintext) => {
                if let Err(e) = self.enqueue(loaded, WriteOp::Replace(plaintext), None) {
                    warn!("Failed to queue restored store {}: {}", self.file, e);
                }
            }
            Err(e) => warn!("Failed to serialize restored store {}: {}", self.file, e),
        }

        if let Some(sender) = lock(&loaded.watchers).get(key) {
            sender.send_replace(previous);
        }
    }

    fn enqueue(
        &self,
        loaded: &Loaded,
        op: WriteOp,
        ack: Option<oneshot::Sender<VaultResult<()>>>,
    ) -> VaultResult<()> {
        loaded
            .writer
            .send(WriteRequest { op, ack })
            .map_err(|_| VaultError::Config(format!("Writer for store {} has stopped", self.file)))
    }

    async fn await_ack(&self, done: oneshot::Receiver<VaultResult<()>>) -> VaultResult<()> {
        done.await.map_err(|_| {
            VaultError::Config(format!("Writer for store {} dropped a commit", self.file))
        })?
    }

    async fn loaded(&self) -> VaultResult<Arc<Loaded>> {
        // OnceCell runs one initializer at a time, which also keeps two
        // callers from recreating the same keystore entry concurrently.
        self.loaded
            .get_or_try_init(|| self.load_with_recovery())
            .await
            .cloned()
    }

    async fn load_with_recovery(&self) -> VaultResult<Arc<Loaded>> {
        let mut reason = String::new();

        for attempt in 1..=self.max_attempts {
            match self.try_load().await {
                Ok((key, entries)) => {
                    debug!(
                        "Loaded store {} with {} keys (attempt {})",
                        self.file,
                        entries.len(),
                        attempt
                    );
                    return Ok(self.start(key, entries));
                }
                Err(LoadFailure::Fatal(e)) => {
                    error!("Store {} cannot be opened: {}", self.file, e);
                    return Err(e);
                }
                Err(LoadFailure::Security(why)) => {
                    warn!(
                        "Store {} unusable on attempt {}/{}: {}",
                        self.file, attempt, self.max_attempts, why
                    );
                    reason = why;
                    if attempt < self.max_attempts {
                        self.discard().await;
                    }
                }
            }
        }

        error!(
            "Giving up on store {} after {} attempts",
            self.file, self.max_attempts
        );
        Err(VaultError::StoreUnavailable {
            file: self.file.filename().to_string(),
            attempts: self.max_attempts,
            reason,
        })
    }

    async fn try_load(&self) -> Result<(KeystoreKey, Entries), LoadFailure> {
        let key = match self
            .keystore
            .get_or_create_key(&self.file.keystore_alias())
            .await
        {
            Ok(key) => key,
            Err(KeystoreError::Platform(vaultlock_keychain::Error::NotAvailable(msg))) => {
                return Err(LoadFailure::Fatal(VaultError::Unsupported(msg)));
            }
            Err(KeystoreError::Invalidated(alias)) => {
                return Err(LoadFailure::Security(format!(
                    "keystore entry {} was invalidated",
                    alias
                )));
            }
            // A denied or failing keychain is not evidence of a bad entry.
            Err(e) => return Err(LoadFailure::Fatal(e.into())),
        };

        let path = self.path.clone();
        let file = self.file;
        let key_for_read = key.clone();
        let entries = tokio::task::spawn_blocking(move || read_entries(&path, file, &key_for_read))
            .await
            .map_err(|e| LoadFailure::Fatal(VaultError::Keystore(e.to_string())))??;

        Ok((key, entries))
    }

    /// Best-effort removal of the file and its keystore alias before a retry.
    async fn discard(&self) {
        info!("Recreating store {}", self.file);

        let path = self.path.clone();
        let removed = tokio::task::spawn_blocking(move || remove_file(&path)).await;
        match removed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to delete store file {:?}: {}", self.path, e),
            Err(e) => warn!("Failed to delete store file {:?}: {}", self.path, e),
        }

        if let Err(e) = self
            .keystore
            .delete_key(&self.file.keystore_alias())
            .await
        {
            warn!(
                "Failed to delete keystore alias {}: {}",
                self.file.keystore_alias(),
                e
            );
        }
    }

    fn start(&self, key: KeystoreKey, entries: Entries) -> Arc<Loaded> {
        let (writer, requests) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(self.file, self.path.clone(), key, requests));
        Arc::new(Loaded {
            entries: Mutex::new(entries),
            watchers: Mutex::new(HashMap::new()),
            writer,
        })
    }
}

impl std::fmt::Debug for EncryptedKeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedKeyValueStore")
            .field("file", &self.file)
            .field("path", &self.path)
            .field("loaded", &self.loaded.initialized())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

async fn run_writer(
    file: Files,
    path: PathBuf,
    key: KeystoreKey,
    mut requests: mpsc::UnboundedReceiver<WriteRequest>,
) {
    while let Some(request) = requests.recv().await {
        let path = path.clone();
        let key = key.clone();
        let result = tokio::task::spawn_blocking(move || match request.op {
            WriteOp::Replace(plaintext) => write_entries(&path, file, &key, &plaintext),
            WriteOp::Delete => remove_file(&path),
        })
        .await
        .unwrap_or_else(|e| Err(VaultError::Config(format!("Writer task failed: {}", e))));

        match request.ack {
            Some(ack) => {
                let _ = ack.send(result);
            }
            None => {
                if let Err(e) = result {
                    error!("Failed to persist store {}: {}", file, e);
                }
            }
        }
    }
    debug!("Writer for store {} stopped", file);
}

fn read_entries(path: &Path, file: Files, key: &KeystoreKey) -> Result<Entries, LoadFailure> {
    let sealed = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Entries::new()),
        Err(e) => return Err(LoadFailure::Fatal(VaultError::io(path, e))),
    };

    let plaintext = crypto::open(key.as_bytes(), &sealed, file.filename().as_bytes())
        .map_err(|_| LoadFailure::Security("stored ciphertext failed authentication".into()))?;

    serde_json::from_slice(&plaintext)
        .map_err(|e| LoadFailure::Security(format!("decrypted store is malformed: {}", e)))
}

fn write_entries(path: &Path, file: Files, key: &KeystoreKey, plaintext: &[u8]) -> VaultResult<()> {
    use std::io::Write;

    let sealed = crypto::seal(key.as_bytes(), plaintext, file.filename().as_bytes())?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| VaultError::io(parent, e))?;
    }

    // Write atomically (write to temp file, then rename)
    let temp_path = path.with_extension("enc.tmp");
    {
        let mut temp = std::fs::File::create(&temp_path).map_err(|e| VaultError::io(&temp_path, e))?;
        temp.write_all(&sealed)
            .and_then(|_| temp.sync_all())
            .map_err(|e| VaultError::io(&temp_path, e))?;
    }

    // Set restrictive permissions on Unix
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&temp_path, perms).map_err(|e| VaultError::io(&temp_path, e))?;
    }

    std::fs::rename(&temp_path, path).map_err(|e| VaultError::io(path, e))?;
    Ok(())
}

fn remove_file(path: &Path) -> VaultResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(VaultError::io(path, e)),
    }
}
