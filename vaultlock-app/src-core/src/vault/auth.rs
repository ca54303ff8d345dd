//! Vault status and lock reasons.

use serde::{Deserialize, Serialize};

/// Coarse state of the vault as seen by UI layers.
///
/// - `NotSetup` → `Unlocked` (after `create_vault`)
/// - `Unlocked` → `Locked` (explicit lock, inactivity, reboot, ...)
/// - `Locked` → `Unlocked` (password or biometric unlock)
/// - `Corrupted` → `NotSetup` (after `reset_vault`)
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum VaultStatus {
    /// No fingerprint has been persisted yet (first-time user)
    #[default]
    NotSetup,
    /// A session is persisted but no key is resident
    Locked,
    /// A live master key is held in memory
    Unlocked,
    /// Only one of fingerprint and key slots survived; needs a reset
    Corrupted,
}

impl std::fmt::Display for VaultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotSetup => write!(f, "NotSetup"),
            Self::Locked => write!(f, "Locked"),
            Self::Unlocked => write!(f, "Unlocked"),
            Self::Corrupted => write!(f, "Corrupted"),
        }
    }
}

/// Why the session was last cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockReason {
    User,
    Inactivity,
    Reboot,
    KeyRotation,
    BiometricInvalidated,
}

impl std::fmt::Display for LockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "Locked"),
            Self::Inactivity => write!(f, "Locked due to inactivity"),
            Self::Reboot => write!(f, "Locked after device restart"),
            Self::KeyRotation => write!(f, "Locked after master password change"),
            Self::BiometricInvalidated => {
                write!(f, "Biometric unlock was disabled by the system")
            }
        }
    }
}
