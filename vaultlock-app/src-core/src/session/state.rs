use std::sync::Arc;

use uuid::Uuid;

use super::scope::SessionScope;
use crate::vault::LockReason;

/// In-memory session state.
///
/// `Empty` is both the initial state and the state after any lock; it keeps
/// the reason of the last lock for the UI. `Key` holds the only live scope.
#[derive(Clone)]
pub enum MasterSession {
    Empty { reason: Option<LockReason> },
    Key(Arc<SessionScope>),
}

impl Default for MasterSession {
    fn default() -> Self {
        MasterSession::Empty { reason: None }
    }
}

impl MasterSession {
    pub fn is_unlocked(&self) -> bool {
        matches!(self, MasterSession::Key(_))
    }

    pub fn scope(&self) -> Option<&Arc<SessionScope>> {
        match self {
            MasterSession::Key(scope) => Some(scope),
            MasterSession::Empty { .. } => None,
        }
    }

    pub fn scope_id(&self) -> Option<Uuid> {
        self.scope().map(|scope| scope.id())
    }

    pub fn lock_reason(&self) -> Option<LockReason> {
        match self {
            MasterSession::Empty { reason } => *reason,
            MasterSession::Key(_) => None,
        }
    }
}

impl std::fmt::Debug for MasterSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MasterSession::Empty { reason } => {
                f.debug_struct("Empty").field("reason", reason).finish()
            }
            MasterSession::Key(scope) => f.debug_tuple("Key").field(&scope.id()).finish(),
        }
    }
}
