//! The in-memory master session and its lifecycle.

pub(crate) mod keyslot;
pub mod locker;
pub mod manager;
pub mod scope;
pub mod state;

pub use locker::{KeepAliveGuard, LockTimeoutSource, SessionLockTarget, SessionLocker};
pub use manager::{KeyRotationHook, NoRotation, SessionManager};
pub use scope::{NoServices, SessionOrigin, SessionScope, SessionServices, SessionServicesFactory};
pub use state::MasterSession;
