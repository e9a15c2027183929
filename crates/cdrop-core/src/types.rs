use serde::{Deserialize, Serialize};

/// Seconds since the Unix epoch
pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Backend that holds a content object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Local,
    S3,
}

impl DriverKind {
    pub fn is_remote(self) -> bool {
        matches!(self, DriverKind::S3)
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverKind::Local => f.write_str("local"),
            DriverKind::S3 => f.write_str("s3"),
        }
    }
}

/// Per-file key material as persisted next to the file record.
///
/// `wrapped_key` is the file key sealed under the master key (32 bytes of key
/// plus a 16-byte tag), `nonce` the 12-byte nonce used for that seal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEncryptionInfo {
    pub is_encrypted: bool,
    pub nonce: Vec<u8>,
    pub wrapped_key: Vec<u8>,
}

impl FileEncryptionInfo {
    pub fn unencrypted() -> Self {
        Self::default()
    }
}

/// Progress of a chunked upload after the last chunk arrived.
///
/// Ordered: a status may only move to an equal or higher phase, so `Error`
/// overrides everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum UploadPhase {
    HashingOrEncrypting = 0,
    Uploading = 1,
    Finished = 2,
    Error = 3,
}

impl UploadPhase {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UploadPhase::Finished | UploadPhase::Error)
    }
}

impl From<UploadPhase> for u8 {
    fn from(phase: UploadPhase) -> u8 {
        phase.as_u8()
    }
}

impl TryFrom<u8> for UploadPhase {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        match value {
            0 => Ok(UploadPhase::HashingOrEncrypting),
            1 => Ok(UploadPhase::Uploading),
            2 => Ok(UploadPhase::Finished),
            3 => Ok(UploadPhase::Error),
            other => Err(format!("unknown upload phase {other}")),
        }
    }
}

/// Server-side processing state of one chunked upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub chunk_id: String,
    pub phase: UploadPhase,
    pub file_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: u64,
}

/// A stored file as seen by downloaders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    /// Plaintext size in bytes
    pub size_bytes: u64,
    /// BLAKE3 hex of the stored object (ciphertext when encrypted)
    pub content_hash: String,
    pub content_type: String,
    pub driver: DriverKind,
    /// Remote bucket, empty for local objects
    pub bucket: String,
    pub created_at: u64,
    /// Unix seconds after which the file is gone; `None` never expires
    pub expire_at: Option<u64>,
    /// `None` allows unlimited downloads
    pub downloads_remaining: Option<u32>,
    pub download_count: u64,
    /// Argon2 PHC string, `None` when the file is not password protected
    pub password_hash: Option<String>,
    pub encryption: FileEncryptionInfo,
    pub end_to_end: bool,
}

impl FileRecord {
    pub fn is_expired(&self, now: u64) -> bool {
        if matches!(self.downloads_remaining, Some(0)) {
            return true;
        }
        matches!(self.expire_at, Some(at) if at <= now)
    }
}

/// Client-encrypted list of end-to-end file keys. Opaque to the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct E2EInfoEncrypted {
    pub version: u32,
    pub nonce: Vec<u8>,
    pub content: Vec<u8>,
    /// Ids of end-to-end files that still exist, filled in on read
    #[serde(default)]
    pub available_files: Vec<String>,
}
