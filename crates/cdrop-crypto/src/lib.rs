//! cdrop-crypto: at-rest encryption for cryptdrop
//!
//! Key hierarchy:
//! ```text
//! Master Key (256-bit, raw or Argon2id from password), sealed in RAM by MasterKeyVault
//!   └── File Key (per-file, 256-bit random, wrapped by the master key with AES-256-GCM)
//!       └── Segmented stream: AES-256-GCM over 64 KiB plaintext segments
//!           nonce = prefix(7) || segment_index(be32) || last_flag(1)
//! ```
//!
//! Stored object layout: `[1-byte version][7-byte nonce prefix][segment 0]..[segment n]`,
//! each segment being its ciphertext followed by a 16-byte tag.

pub mod envelope;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod stream;
pub mod vault;

pub use error::{CryptoError, VaultError};
pub use kdf::{derive_master_key, password_checksum, KdfParams, MasterKey};
pub use keys::{generate_file_key, new_file_key, unwrap_file_key, FileKey};
pub use stream::{
    decrypt, decrypt_to_vec, encrypt, encrypt_to_vec, encrypted_size, is_correct_key,
    EncryptWriter, SegmentDecryptor, SegmentEncryptor, SEGMENT_SIZE,
};
pub use vault::MasterKeyVault;

/// Size of a master or file key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;
