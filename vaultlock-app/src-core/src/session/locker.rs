//! Auto-lock for unlocked sessions.
//!
//! Callers that keep the session in active use (a visible window, an
//! in-flight sync) hold a keep-alive. While at least one is held nothing is
//! scheduled. When the last one goes away a short debounce window starts; a
//! keep-alive arriving inside it cancels everything, so a detach/attach blip
//! never arms a timer. Once the window passes the lock timeout is read fresh
//! from its source and a lock job is scheduled. Any new keep-alive, and any
//! lock, cancels that job.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::MasterSession;
use crate::error::{VaultError, VaultResult};
use crate::vault::LockReason;

/// Supplies the auto-lock delay. `None` means never lock.
#[async_trait]
pub trait LockTimeoutSource: Send + Sync {
    async fn lock_timeout(&self) -> VaultResult<Option<Duration>>;
}

/// A fixed delay.
#[async_trait]
impl LockTimeoutSource for Option<Duration> {
    async fn lock_timeout(&self) -> VaultResult<Option<Duration>> {
        Ok(*self)
    }
}

/// What the locker observes and locks.
#[async_trait]
pub trait SessionLockTarget: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<MasterSession>;

    /// Lock `session` if it is still the live one. A request naming a
    /// session that has since been replaced must be ignored.
    async fn lock_session(&self, session: Uuid, reason: LockReason);
}

#[derive(Default)]
struct LockerState {
    observers: usize,
    session: Option<Uuid>,
    /// Bumped on every event that invalidates a scheduled job.
    epoch: u64,
    pending: Option<JoinHandle<()>>,
}

struct LockerInner {
    target: Arc<dyn SessionLockTarget>,
    timeout: Arc<dyn LockTimeoutSource>,
    debounce: Duration,
    runtime: Handle,
    state: Mutex<LockerState>,
}

pub struct SessionLocker {
    inner: Arc<LockerInner>,
    watcher: JoinHandle<()>,
}

impl SessionLocker {
    /// Start watching `target`. Must be called from inside a Tokio runtime.
    pub fn new(
        target: Arc<dyn SessionLockTarget>,
        timeout: Arc<dyn LockTimeoutSource>,
        debounce: Duration,
    ) -> VaultResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| VaultError::Config(format!("Session locker needs a runtime: {}", e)))?;

        let sessions = target.subscribe();
        let inner = Arc::new(LockerInner {
            target,
            timeout,
            debounce,
            runtime: runtime.clone(),
            state: Mutex::new(LockerState::default()),
        });
        let watcher = runtime.spawn(watch_sessions(inner.clone(), sessions));

        Ok(Self { inner, watcher })
    }

    /// Keep the session alive until the returned guard is dropped.
    pub fn acquire(&self) -> KeepAliveGuard {
        self.inner.attach();
        KeepAliveGuard {
            inner: self.inner.clone(),
        }
    }

    /// Keep the session alive for as long as this future is being polled.
    /// Never completes; cancel it (drop it) to release.
    pub async fn keep_alive(&self) {
        let _guard = self.acquire();
        std::future::pending::<()>().await
    }

    pub fn debounce(&self) -> Duration {
        self.inner.debounce
    }

    pub fn observers(&self) -> usize {
        self.inner.state().observers
    }

    /// Whether a debounce or lock job is currently scheduled.
    pub fn is_armed(&self) -> bool {
        self.inner
            .state()
            .pending
            .as_ref()
            .is_some_and(|job| !job.is_finished())
    }
}

impl Drop for SessionLocker {
    fn drop(&mut self) {
        self.watcher.abort();
        let mut state = self.inner.state();
        state.epoch += 1;
        if let Some(job) = state.pending.take() {
            job.abort();
        }
    }
}

/// Releases its keep-alive on drop.
pub struct KeepAliveGuard {
    inner: Arc<LockerInner>,
}

impl Drop for KeepAliveGuard {
    fn drop(&mut self) {
        self.inner.detach();
    }
}

impl LockerInner {
    fn state(&self) -> MutexGuard<'_, LockerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn attach(&self) {
        let mut state = self.state();
        state.observers += 1;
        state.epoch += 1;
        if let Some(job) = state.pending.take() {
            job.abort();
            debug!("Keep-alive attached, auto-lock disarmed");
        }
    }

    fn detach(self: &Arc<Self>) {
        let mut state = self.state();
        state.observers = state.observers.saturating_sub(1);
        if state.observers == 0 && state.session.is_some() {
            debug!("Last keep-alive released, debouncing for {:?}", self.debounce);
            self.schedule(&mut state, true);
        }
    }

    fn on_session(self: &Arc<Self>, session: Option<Uuid>) {
        let mut state = self.state();
        if state.session == session {
            return;
        }
        state.session = session;

        match session {
            Some(id) if state.observers == 0 => {
                // Nothing transient to absorb on a fresh unlock.
                debug!("Session {} unlocked with no keep-alive held", id);
                self.schedule(&mut state, false);
            }
            Some(_) => {}
            None => {
                state.epoch += 1;
                if let Some(job) = state.pending.take() {
                    job.abort();
                    debug!("Session locked, auto-lock disarmed");
                }
            }
        }
    }

    fn schedule(self: &Arc<Self>, state: &mut LockerState, debounce: bool) {
        state.epoch += 1;
        if let Some(job) = state.pending.take() {
            job.abort();
        }
        let epoch = state.epoch;
        state.pending = Some(self.runtime.spawn(self.clone().run_job(epoch, debounce)));
    }

    /// The session a job scheduled at `epoch` may still lock.
    fn current_session(&self, epoch: u64) -> Option<Uuid> {
        let state = self.state();
        if state.epoch == epoch && state.observers == 0 {
            state.session
        } else {
            None
        }
    }

    async fn run_job(self: Arc<Self>, epoch: u64, debounce: bool) {
        if debounce {
            tokio::time::sleep(self.debounce).await;
            if self.current_session(epoch).is_none() {
                return;
            }
        }

        let timeout = match self.timeout.lock_timeout().await {
            Ok(Some(timeout)) => timeout,
            Ok(None) => {
                debug!("Auto-lock is set to never");
                return;
            }
            Err(e) => {
                warn!("Could not read auto-lock timeout, locking now: {}", e);
                Duration::ZERO
            }
        };

        info!("Auto-lock armed for {:?}", timeout);
        tokio::time::sleep(timeout).await;

        let Some(session) = self.current_session(epoch) else {
            return;
        };

        info!("Locking session {} after {:?} of inactivity", session, timeout);
        // Spawned so that a keep-alive arriving now cannot abort a lock that
        // has already started.
        let target = self.target.clone();
        self.runtime.spawn(async move {
            target.lock_session(session, LockReason::Inactivity).await;
        });
    }
}

async fn watch_sessions(inner: Arc<LockerInner>, mut sessions: watch::Receiver<MasterSession>) {
    loop {
        let session = sessions.borrow_and_update().scope_id();
        inner.on_session(session);
        if sessions.changed().await.is_err() {
            break;
        }
    }
}
