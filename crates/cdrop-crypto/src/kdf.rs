//! Key derivation: Argon2id password → master key

use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::VaultError;
use crate::KEY_SIZE;

/// A 256-bit master key.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, VaultError> {
        let bytes: [u8; KEY_SIZE] = raw
            .try_into()
            .map_err(|_| VaultError::InvalidKeyLength(raw.len()))?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Lowercase hex SHA-256 of the key bytes
    pub fn checksum(&self) -> String {
        to_hex(&Sha256::digest(self.bytes))
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id parameters for KDF
#[derive(Debug, Clone)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

/// Derive a 256-bit master key from a password and salt using Argon2id.
///
/// The salt is first hashed with SHA-256, so any salt length is accepted
/// (Argon2 itself requires at least 8 bytes).
pub fn derive_master_key(
    password: &SecretString,
    salt: &[u8],
    params: &KdfParams,
) -> Result<MasterKey, VaultError> {
    if password.expose_secret().is_empty() {
        return Err(VaultError::EmptyPassword);
    }

    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| VaultError::Kdf(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);
    let salt = Sha256::digest(salt);

    let mut key = [0u8; KEY_SIZE];
    let derived = argon2.hash_password_into(password.expose_secret().as_bytes(), &salt, &mut key);
    let master = derived.map(|()| MasterKey::from_bytes(key));
    key.zeroize();

    master.map_err(|e| VaultError::Kdf(format!("Argon2id failed: {e}")))
}

/// Checksum of the key a password derives, stored in config so a wrong
/// password can be rejected at startup.
pub fn password_checksum(
    password: &SecretString,
    salt: &[u8],
    params: &KdfParams,
) -> Result<String, VaultError> {
    Ok(derive_master_key(password, salt, params)?.checksum())
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

#[cfg(test)]
pub(crate) fn fast_params() -> KdfParams {
    KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}
