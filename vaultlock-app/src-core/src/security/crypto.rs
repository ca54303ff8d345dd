use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{VaultError, VaultResult};

/// Nonce size for AES-GCM (96 bits = 12 bytes)
pub const NONCE_SIZE: usize = 12;

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

/// Fill an array from the thread-local CSPRNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}

pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn cipher(key: &[u8]) -> VaultResult<Aes256Gcm> {
    if key.len() != KEY_SIZE {
        return Err(VaultError::Encryption(format!(
            "Key must be {} bytes, got {}",
            KEY_SIZE,
            key.len()
        )));
    }
    Aes256Gcm::new_from_slice(key).map_err(|e| VaultError::Encryption(e.to_string()))
}

/// Encrypt under an explicit nonce. Returns ciphertext with the auth tag.
pub fn encrypt_with_nonce(
    key: &[u8],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> VaultResult<Vec<u8>> {
    cipher(key)?
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| VaultError::Encryption(format!("Encryption failed: {}", e)))
}

/// Decrypt under an explicit nonce.
///
/// A wrong key, a wrong nonce, tampered ciphertext and mismatched associated
/// data are indistinguishable here; callers decide what the failure means.
pub fn decrypt_with_nonce(
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> VaultResult<Vec<u8>> {
    if nonce.len() != NONCE_SIZE {
        return Err(VaultError::Encryption(format!(
            "Nonce must be {} bytes, got {}",
            NONCE_SIZE,
            nonce.len()
        )));
    }
    cipher(key)?
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| VaultError::Encryption("Decryption failed".into()))
}

/// Encrypt with a fresh random nonce.
///
/// Format: `[12-byte nonce][ciphertext with 16-byte auth tag]`
pub fn seal(key: &[u8], plaintext: &[u8], aad: &[u8]) -> VaultResult<Vec<u8>> {
    let nonce = random_bytes::<NONCE_SIZE>();
    let ciphertext = encrypt_with_nonce(key, &nonce, plaintext, aad)?;

    let mut output = nonce.to_vec();
    output.extend(ciphertext);
    Ok(output)
}

/// Inverse of [`seal`].
pub fn open(key: &[u8], sealed: &[u8], aad: &[u8]) -> VaultResult<Vec<u8>> {
    if sealed.len() < NONCE_SIZE {
        return Err(VaultError::Encryption("Data too short".into()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    decrypt_with_nonce(key, nonce, ciphertext, aad)
}
