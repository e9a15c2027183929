//! End-to-end file list envelope.
//!
//! Clients encrypting files themselves keep the per-file keys in a list that
//! they seal with their own key and park on the server. The server only stores
//! and returns the blob, so nothing in the daemon calls the functions here:
//! they are the client half of the format, kept next to the type the server
//! persists. Wire form:
//!
//! ```json
//! {"version": 1, "nonce": "<base64>", "content": "<base64>", "availableFiles": ["id", ...]}
//! ```

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use cdrop_core::types::E2EInfoEncrypted;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::{KEY_SIZE, NONCE_SIZE};

pub const ENVELOPE_VERSION: u32 = 1;

/// One client-side encrypted file and the key the client used for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct E2EFileEntry {
    pub id: String,
    pub filename: String,
    #[serde(with = "b64")]
    pub key: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeJson {
    version: u32,
    #[serde(with = "b64")]
    nonce: Vec<u8>,
    #[serde(with = "b64")]
    content: Vec<u8>,
    #[serde(default)]
    available_files: Vec<String>,
}

/// Seal a file list under a client key.
pub fn seal_file_list(
    key: &[u8; KEY_SIZE],
    files: &[E2EFileEntry],
) -> Result<E2EInfoEncrypted, CryptoError> {
    let plain = serde_json::to_vec(files).map_err(|e| CryptoError::Envelope(e.to_string()))?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    let content = Aes256Gcm::new(key.into())
        .encrypt(Nonce::from_slice(&nonce), plain.as_ref())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(E2EInfoEncrypted {
        version: ENVELOPE_VERSION,
        nonce: nonce.to_vec(),
        content,
        available_files: Vec::new(),
    })
}

pub fn open_file_list(
    key: &[u8; KEY_SIZE],
    info: &E2EInfoEncrypted,
) -> Result<Vec<E2EFileEntry>, CryptoError> {
    if info.version != ENVELOPE_VERSION {
        return Err(CryptoError::Envelope(format!(
            "unsupported version {}",
            info.version
        )));
    }
    if info.nonce.len() != NONCE_SIZE {
        return Err(CryptoError::Envelope(format!(
            "nonce must be {NONCE_SIZE} bytes, got {}",
            info.nonce.len()
        )));
    }
    let plain = Aes256Gcm::new(key.into())
        .decrypt(Nonce::from_slice(&info.nonce), info.content.as_ref())
        .map_err(|_| CryptoError::DecryptionFailed)?;
    serde_json::from_slice(&plain).map_err(|e| CryptoError::Envelope(e.to_string()))
}

pub fn to_json(info: &E2EInfoEncrypted) -> Result<String, CryptoError> {
    serde_json::to_string(&EnvelopeJson {
        version: info.version,
        nonce: info.nonce.clone(),
        content: info.content.clone(),
        available_files: info.available_files.clone(),
    })
    .map_err(|e| CryptoError::Envelope(e.to_string()))
}

pub fn from_json(json: &str) -> Result<E2EInfoEncrypted, CryptoError> {
    let env: EnvelopeJson =
        serde_json::from_str(json).map_err(|e| CryptoError::Envelope(e.to_string()))?;
    Ok(E2EInfoEncrypted {
        version: env.version,
        nonce: env.nonce,
        content: env.content,
        available_files: env.available_files,
    })
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
