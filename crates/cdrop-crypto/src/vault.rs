//! In-memory master key vault.
//!
//! The master key never sits in memory as plaintext between uses. It is sealed
//! with AES-256-GCM under a random per-process `ram_cipher` key and only opened
//! by [`MasterKeyVault::reveal`], which hands out a [`MasterKey`] that zeroizes
//! itself on drop.

use std::sync::{PoisonError, RwLock};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use secrecy::SecretString;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::VaultError;
use crate::kdf::{derive_master_key, KdfParams, MasterKey};
use crate::{KEY_SIZE, NONCE_SIZE};

/// Sealed key material. A fresh `ram_cipher` is drawn for every seal, so the
/// all-zero nonce is never reused under one key.
#[derive(Zeroize, ZeroizeOnDrop)]
struct Sealed {
    ram_cipher: [u8; KEY_SIZE],
    ciphertext: Vec<u8>,
}

/// Holds at most one master key. Re-initialising overwrites the previous one.
#[derive(Default)]
pub struct MasterKeyVault {
    sealed: RwLock<Option<Sealed>>,
}

impl MasterKeyVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the master key from a password with Argon2id.
    pub fn init_with_password(
        &self,
        password: &SecretString,
        salt: &[u8],
        params: &KdfParams,
    ) -> Result<(), VaultError> {
        let key = derive_master_key(password, salt, params)?;
        self.store(&key)?;
        debug!("vault initialised from password");
        Ok(())
    }

    /// Use a raw 32-byte master key.
    pub fn init_with_key(&self, raw: &[u8]) -> Result<(), VaultError> {
        let key = MasterKey::from_slice(raw)?;
        self.store(&key)?;
        debug!("vault initialised from raw key");
        Ok(())
    }

    fn store(&self, key: &MasterKey) -> Result<(), VaultError> {
        let mut ram_cipher = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut ram_cipher);

        let cipher = Aes256Gcm::new((&ram_cipher).into());
        let nonce = Nonce::from_slice(&ZERO_NONCE);
        let ciphertext = match cipher.encrypt(nonce, key.as_bytes().as_ref()) {
            Ok(ct) => ct,
            Err(_) => {
                ram_cipher.zeroize();
                return Err(VaultError::Seal);
            }
        };

        let sealed = Sealed {
            ram_cipher,
            ciphertext,
        };
        ram_cipher.zeroize();

        *self.sealed.write().unwrap_or_else(PoisonError::into_inner) = Some(sealed);
        Ok(())
    }

    /// Decrypt the master key for a single use.
    pub fn reveal(&self) -> Result<MasterKey, VaultError> {
        let guard = self.sealed.read().unwrap_or_else(PoisonError::into_inner);
        let sealed = guard.as_ref().ok_or(VaultError::NotInitialized)?;

        let cipher = Aes256Gcm::new((&sealed.ram_cipher).into());
        let mut plain = cipher
            .decrypt(Nonce::from_slice(&ZERO_NONCE), sealed.ciphertext.as_ref())
            .map_err(|_| VaultError::Unseal)?;

        let key = MasterKey::from_slice(&plain);
        plain.zeroize();
        key
    }

    pub fn is_initialized(&self) -> bool {
        self.sealed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl std::fmt::Debug for MasterKeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKeyVault")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

const ZERO_NONCE: [u8; NONCE_SIZE] = [0u8; NONCE_SIZE];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::fast_params;

    #[test]
    fn test_reveal_requires_init() {
        let vault = MasterKeyVault::new();
        assert!(!vault.is_initialized());
        assert!(matches!(vault.reveal(), Err(VaultError::NotInitialized)));
    }

    #[test]
    fn test_init_with_key_roundtrip() {
        let vault = MasterKeyVault::new();
        vault.init_with_key(&[7u8; 32]).unwrap();

        assert!(vault.is_initialized());
        assert_eq!(vault.reveal().unwrap().as_bytes(), &[7u8; 32]);
    }

    #[test]
    fn test_init_with_key_wrong_length() {
        let vault = MasterKeyVault::new();
        let err = vault.init_with_key(&[7u8; 31]).unwrap_err();
        assert!(matches!(err, VaultError::InvalidKeyLength(31)));
        assert!(!vault.is_initialized());
    }

    #[test]
    fn test_init_with_password_matches_kdf() {
        let vault = MasterKeyVault::new();
        let pw = SecretString::from("pw");
        vault.init_with_password(&pw, b"salt", &fast_params()).unwrap();

        let expected = derive_master_key(&pw, b"salt", &fast_params()).unwrap();
        assert_eq!(vault.reveal().unwrap().as_bytes(), expected.as_bytes());
    }

    #[test]
    fn test_empty_password_is_an_error() {
        let vault = MasterKeyVault::new();
        let err = vault
            .init_with_password(&SecretString::from(""), b"salt", &fast_params())
            .unwrap_err();
        assert!(matches!(err, VaultError::EmptyPassword));
        assert!(!vault.is_initialized());
    }

    #[test]
    fn test_reinit_overwrites() {
        let vault = MasterKeyVault::new();
        vault.init_with_key(&[1u8; 32]).unwrap();
        vault.init_with_key(&[2u8; 32]).unwrap();
        assert_eq!(vault.reveal().unwrap().as_bytes(), &[2u8; 32]);
    }

    #[test]
    fn test_sealed_copy_is_not_plaintext() {
        let vault = MasterKeyVault::new();
        vault.init_with_key(&[9u8; 32]).unwrap();

        let guard = vault.sealed.read().unwrap();
        let sealed = guard.as_ref().unwrap();
        assert_eq!(sealed.ciphertext.len(), 32 + 16);
        assert_ne!(&sealed.ciphertext[..32], &[9u8; 32]);
    }

    #[test]
    fn test_debug_does_not_leak() {
        let vault = MasterKeyVault::new();
        vault.init_with_key(&[0xAB; 32]).unwrap();
        let rendered = format!("{vault:?}");
        assert!(rendered.contains("initialized: true"));
        assert!(!rendered.contains("171"));
    }
}
