//! Vault session and master-key lifecycle.
//!
//! The master key lives only inside an unlocked [`SessionScope`]. On disk it
//! exists wrapped under a password-derived key, and optionally under a
//! biometric-gated platform key, inside encrypted stores whose own keys are
//! held by the OS keychain.

pub mod biometric;
pub mod error;
pub mod security;
pub mod session;
pub mod storage;
pub mod vault;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use error::{ErrorKind, VaultError, VaultResult};
pub use session::{
    KeepAliveGuard, MasterSession, SessionLocker, SessionManager, SessionOrigin, SessionScope,
};
pub use storage::VaultConfig;
pub use vault::{LockReason, VaultStatus};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vaultlock_core=debug,vaultlock_keychain=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Session manager backed by the OS keychain of this platform.
pub fn open_session_manager(config: &VaultConfig) -> VaultResult<SessionManager> {
    let secrets = vaultlock_keychain::platform_secret_store(&config.keychain_service)
        .ok_or_else(|| VaultError::Unsupported("no OS keychain on this platform".into()))?;

    info!("Opening vault session with keychain service {}", config.keychain_service);
    SessionManager::from_config(config, Arc::from(secrets))
}
