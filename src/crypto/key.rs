//! Key material for the stream cipher.
//!
//! Every object is protected by two keys: a 32-byte AES key and a 64-byte
//! HMAC key, derived once per run either from a password via Argon2id or
//! taken verbatim from a 96-byte key file.

use anyhow::{anyhow, bail, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;

/// AES-256 key size
pub const AES_KEY_SIZE: usize = 32;

/// HMAC-SHA-512 key size
pub const HMAC_KEY_SIZE: usize = 64;

/// Initialization vector size (AES block size)
pub const IV_SIZE: usize = 16;

/// Salt size for password derivation
pub const SALT_SIZE: usize = 32;

// Argon2id cost parameters
const ARGON2_TIME_COST: u32 = 3;
const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
const ARGON2_PARALLELISM: u32 = 4;

/// Derive the AES and HMAC keys from a password and salt using Argon2id.
pub fn derive_key(password: &str, salt: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    if salt.len() != SALT_SIZE {
        bail!(
            "invalid salt size: expected {}, got {}",
            SALT_SIZE,
            salt.len()
        );
    }

    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_TIME_COST,
        ARGON2_PARALLELISM,
        Some(AES_KEY_SIZE + HMAC_KEY_SIZE),
    )
    .map_err(|e| anyhow!("invalid Argon2 parameters: {}", e))?;

    let mut derived = vec![0u8; AES_KEY_SIZE + HMAC_KEY_SIZE];
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(password.as_bytes(), salt, &mut derived)
        .map_err(|e| anyhow!("failed to derive key: {}", e))?;

    let hmac_key = derived.split_off(AES_KEY_SIZE);
    Ok((derived, hmac_key))
}

/// Derive keys from a password with a freshly generated random salt.
///
/// An empty password fails before any derivation work is done.
pub fn derive_key_from_password(password: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    if password.is_empty() {
        bail!("encryption password cannot be empty");
    }
    let salt = generate_salt();
    derive_key(password, &salt)
}

/// Split a key file into the AES and HMAC keys.
///
/// Key file layout: [32 bytes AES key][64 bytes HMAC key].
pub fn derive_key_from_key_file(data: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    if data.len() < AES_KEY_SIZE + HMAC_KEY_SIZE {
        bail!(
            "invalid key file size: expected at least {} bytes, got {}",
            AES_KEY_SIZE + HMAC_KEY_SIZE,
            data.len()
        );
    }

    let aes_key = data[..AES_KEY_SIZE].to_vec();
    let hmac_key = data[AES_KEY_SIZE..AES_KEY_SIZE + HMAC_KEY_SIZE].to_vec();
    Ok((aes_key, hmac_key))
}

/// Generate the contents of a fresh key file.
pub fn generate_key_file() -> Vec<u8> {
    let mut data = vec![0u8; AES_KEY_SIZE + HMAC_KEY_SIZE];
    OsRng.fill_bytes(&mut data);
    data
}

/// Generate a random per-object IV.
pub fn generate_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Generate a random salt for password derivation.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_sizes() {
        let salt = [7u8; SALT_SIZE];
        let (aes_key, hmac_key) = derive_key("password", &salt).unwrap();
        assert_eq!(aes_key.len(), AES_KEY_SIZE);
        assert_eq!(hmac_key.len(), HMAC_KEY_SIZE);
    }

    #[test]
    fn test_derive_key_deterministic() {
        let salt = [7u8; SALT_SIZE];
        let first = derive_key("password", &salt).unwrap();
        let second = derive_key("password", &salt).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_derive_key_salt_changes_output() {
        let first = derive_key("password", &[1u8; SALT_SIZE]).unwrap();
        let second = derive_key("password", &[2u8; SALT_SIZE]).unwrap();
        assert_ne!(first.0, second.0);
    }

    #[test]
    fn test_derive_key_rejects_bad_salt() {
        assert!(derive_key("password", &[0u8; 16]).is_err());
    }

    #[test]
    fn test_empty_password_rejected() {
        let err = derive_key_from_password("").unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_key_file_split() {
        let data = generate_key_file();
        assert_eq!(data.len(), AES_KEY_SIZE + HMAC_KEY_SIZE);

        let (aes_key, hmac_key) = derive_key_from_key_file(&data).unwrap();
        assert_eq!(aes_key, &data[..AES_KEY_SIZE]);
        assert_eq!(hmac_key, &data[AES_KEY_SIZE..]);
    }

    #[test]
    fn test_key_file_too_short() {
        assert!(derive_key_from_key_file(&[0u8; 95]).is_err());
    }

    #[test]
    fn test_generated_ivs_are_distinct() {
        let a = generate_iv();
        let b = generate_iv();
        assert_ne!(a, b);
    }
}
