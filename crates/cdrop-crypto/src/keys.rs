//! Per-file keys and their wrapping under the master key

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use cdrop_core::types::FileEncryptionInfo;
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::kdf::MasterKey;
use crate::vault::MasterKeyVault;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// A per-file 256-bit encryption key. Zeroized on drop.
#[derive(Clone)]
pub struct FileKey {
    bytes: [u8; KEY_SIZE],
}

impl FileKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for FileKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit file encryption key.
pub fn generate_file_key() -> FileKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    FileKey::from_bytes(bytes)
}

/// Create a fresh file key and wrap it under the vault's current master key.
pub fn new_file_key(vault: &MasterKeyVault) -> Result<(FileKey, FileEncryptionInfo), CryptoError> {
    let master = vault.reveal()?;
    let file_key = generate_file_key();
    let info = wrap_key(&master, &file_key)?;
    Ok((file_key, info))
}

/// Recover the file key recorded in `info`.
///
/// Fails with [`CryptoError::UnwrapFailed`] if the master key changed since the
/// file was stored or the info is corrupt.
pub fn unwrap_file_key(
    vault: &MasterKeyVault,
    info: &FileEncryptionInfo,
) -> Result<FileKey, CryptoError> {
    if !info.is_encrypted {
        return Err(CryptoError::NotEncrypted);
    }
    let master = vault.reveal()?;
    unwrap_key(&master, info)
}

/// Seal `file_key` with AES-256-GCM under a random 12-byte nonce.
///
/// The wrapped key is 48 bytes: the 32-byte key followed by the 16-byte tag.
pub fn wrap_key(master: &MasterKey, file_key: &FileKey) -> Result<FileEncryptionInfo, CryptoError> {
    let cipher = Aes256Gcm::new(master.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let wrapped_key = cipher
        .encrypt(nonce, file_key.as_bytes().as_ref())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(FileEncryptionInfo {
        is_encrypted: true,
        nonce: nonce_bytes.to_vec(),
        wrapped_key,
    })
}

pub fn unwrap_key(master: &MasterKey, info: &FileEncryptionInfo) -> Result<FileKey, CryptoError> {
    if info.nonce.len() != NONCE_SIZE || info.wrapped_key.len() != KEY_SIZE + TAG_SIZE {
        return Err(CryptoError::UnwrapFailed);
    }

    let cipher = Aes256Gcm::new(master.as_bytes().into());
    let nonce = Nonce::from_slice(&info.nonce);

    let mut plaintext = cipher
        .decrypt(nonce, info.wrapped_key.as_ref())
        .map_err(|_| CryptoError::UnwrapFailed)?;

    let mut key_bytes = [0u8; KEY_SIZE];
    key_bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();
    let key = FileKey::from_bytes(key_bytes);
    key_bytes.zeroize();

    Ok(key)
}
