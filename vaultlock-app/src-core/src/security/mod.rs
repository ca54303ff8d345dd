pub mod crypto;
pub mod kdf;
pub mod keys;

pub use kdf::{Argon2Kdf, KdfParams, KeyDerivation};
pub use keys::{MasterKey, PasswordKey};
