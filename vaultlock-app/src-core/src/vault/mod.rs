//! Persisted session state.
//!
//! The wrapped master key, the password fingerprint, session metadata and
//! user settings, each exposed through a typed repository over its own
//! encrypted store.

pub mod auth;
pub mod model;
pub mod repository;

pub use auth::{LockReason, VaultStatus};
pub use model::{
    Fingerprint, FingerprintBiometric, FingerprintPassword, PersistedSession, SessionMetadata,
    WrappedKeySlot, SESSION_ALGORITHM,
};
pub use repository::{
    FingerprintReadWriteRepository, KeyReadWriteRepository, Repositories,
    SessionMetadataReadWriteRepository, SettingsLockTimeout, SettingsRepository,
    StoreFingerprintRepository, StoreKeyRepository, StoreSessionMetadataRepository,
    StoreSettingsRepository,
};
