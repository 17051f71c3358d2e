//! Authenticated streaming encryption for backup archives.
//!
//! The container format is a fixed header (magic + random IV), an
//! AES-256-CTR ciphertext body, and a trailer holding the plaintext
//! length and an HMAC-SHA-512 tag over the ciphertext:
//!
//! ```text
//! offset  bytes  field
//! 0       4      magic "S3BE"
//! 4       16     IV (random, per object)
//! 20      N      ciphertext
//! 20+N    8      plaintext length N, big-endian
//! 28+N    64     HMAC-SHA-512 over the ciphertext
//! ```
//!
//! Keys come from Argon2id over a password or from a 96-byte key file;
//! see [`key`].

pub mod key;
mod stream;

pub use key::{
    derive_key, derive_key_from_key_file, derive_key_from_password, generate_iv,
    generate_key_file, generate_salt, AES_KEY_SIZE, HMAC_KEY_SIZE, IV_SIZE, SALT_SIZE,
};
pub use stream::{
    DecryptReader, EncryptWriter, StreamEncryptor, HEADER_SIZE, MAGIC, TAG_SIZE, TRAILER_SIZE,
};
