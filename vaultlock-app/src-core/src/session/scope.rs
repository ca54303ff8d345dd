//! The unlocked-session scope.
//!
//! Everything that only makes sense while a key is resident hangs off a
//! [`SessionScope`]: the key itself, services built for this session, and
//! tasks spawned on its behalf. Closing the scope tears those down in order:
//! tasks are aborted, services shut down, and only then is the key dropped.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{VaultError, VaultResult};
use crate::security::MasterKey;

/// How the key of a scope was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrigin {
    Created,
    Password,
    Biometric,
    PasswordChange,
}

/// Services that live exactly as long as one unlocked session.
#[async_trait]
pub trait SessionServices: Send + Sync {
    /// Stop background work. Called before the key is discarded.
    async fn shutdown(&self) {}
}

/// Builds the services of a new session from its key.
#[async_trait]
pub trait SessionServicesFactory: Send + Sync {
    async fn create(&self, key: &MasterKey) -> VaultResult<Arc<dyn SessionServices>>;
}

/// Factory for sessions that carry no services.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoServices;

#[async_trait]
impl SessionServices for NoServices {}

#[async_trait]
impl SessionServicesFactory for NoServices {
    async fn create(&self, _key: &MasterKey) -> VaultResult<Arc<dyn SessionServices>> {
        Ok(Arc::new(NoServices))
    }
}

pub struct SessionScope {
    id: Uuid,
    origin: SessionOrigin,
    created_at: DateTime<Utc>,
    key: Mutex<Option<MasterKey>>,
    services: Arc<dyn SessionServices>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SessionScope {
    pub(crate) fn new(
        key: MasterKey,
        origin: SessionOrigin,
        services: Arc<dyn SessionServices>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin,
            created_at: Utc::now(),
            key: Mutex::new(Some(key)),
            services,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn origin(&self) -> SessionOrigin {
        self.origin
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn services(&self) -> Arc<dyn SessionServices> {
        self.services.clone()
    }

    /// Run `f` against the live key. `Locked` once the scope is closed.
    pub fn with_key<R>(&self, f: impl FnOnce(&MasterKey) -> R) -> VaultResult<R> {
        let key = lock(&self.key);
        key.as_ref().map(f).ok_or(VaultError::Locked)
    }

    /// Spawn a task that is aborted when the scope closes.
    pub fn spawn<F>(&self, future: F) -> VaultResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = lock(&self.tasks);
        if self.is_closed() {
            return Err(VaultError::Locked);
        }
        tasks.retain(|task| !task.is_finished());
        tasks.push(tokio::spawn(future));
        Ok(())
    }

    /// Tear the scope down. Idempotent.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        debug!("Closing session {} ({} tracked tasks)", self.id, tasks.len());
        for task in &tasks {
            task.abort();
        }

        self.services.shutdown().await;

        // Dropping the key zeroizes it.
        lock(&self.key).take();
        info!("Session {} closed", self.id);
    }
}

impl std::fmt::Debug for SessionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionScope")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("created_at", &self.created_at)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
