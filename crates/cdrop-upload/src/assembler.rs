//! Sequential chunk assembly.
//!
//! Each upload is a session keyed by the client's upload id. Chunks must
//! arrive in order: a chunk's offset has to equal the number of plaintext
//! bytes received so far. Plaintext goes straight into the session's
//! [`SegmentEncryptor`] and the resulting ciphertext is handed back to the
//! caller for staging, so a session never buffers more than one segment.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cdrop_core::types::FileEncryptionInfo;
use cdrop_crypto::{encrypted_size, new_file_key, FileKey, MasterKeyVault, SegmentEncryptor};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::UploadError;

struct Session {
    display_name: String,
    plain_size: u64,
    expected_size: u64,
    received: u64,
    emitted: u64,
    encryptor: Option<SegmentEncryptor>,
    key: Option<(FileKey, FileEncryptionInfo)>,
    finalized: bool,
    last_activity: Instant,
}

/// A session that received its last chunk, detached from the assembler.
#[derive(Debug)]
pub struct CompletedUpload {
    pub id: String,
    pub display_name: String,
    pub plain_size: u64,
    /// Bytes emitted by the session (ciphertext when encrypted)
    pub stored_size: u64,
    pub encryption: FileEncryptionInfo,
    pub file_key: Option<FileKey>,
}

pub struct Assembler {
    vault: Arc<MasterKeyVault>,
    sessions: DashMap<String, Arc<Mutex<Session>>>,
    max_file_size: u64,
}

impl Assembler {
    pub fn new(vault: Arc<MasterKeyVault>, max_file_size: u64) -> Self {
        Self {
            vault,
            sessions: DashMap::new(),
            max_file_size,
        }
    }

    /// Open an encrypting session. Returns the size the stored object will have.
    pub fn begin_upload(
        &self,
        id: &str,
        plain_size: u64,
        display_name: &str,
    ) -> Result<u64, UploadError> {
        self.check_size(plain_size)?;
        let (file_key, info) = new_file_key(&self.vault)?;
        let session = Session {
            display_name: display_name.to_string(),
            plain_size,
            expected_size: encrypted_size(plain_size),
            received: 0,
            emitted: 0,
            encryptor: Some(SegmentEncryptor::new(&file_key)),
            key: Some((file_key, info)),
            finalized: false,
            last_activity: Instant::now(),
        };
        self.insert(id, session)
    }

    /// Open a session that stores bytes as received (no server-side
    /// encryption, or client-side encrypted data).
    pub fn begin_passthrough(
        &self,
        id: &str,
        plain_size: u64,
        display_name: &str,
    ) -> Result<u64, UploadError> {
        self.check_size(plain_size)?;
        let session = Session {
            display_name: display_name.to_string(),
            plain_size,
            expected_size: plain_size,
            received: 0,
            emitted: 0,
            encryptor: None,
            key: None,
            finalized: false,
            last_activity: Instant::now(),
        };
        self.insert(id, session)
    }

    fn check_size(&self, plain_size: u64) -> Result<(), UploadError> {
        if plain_size > self.max_file_size {
            return Err(UploadError::TooLarge {
                size: plain_size,
                max: self.max_file_size,
            });
        }
        Ok(())
    }

    fn insert(&self, id: &str, session: Session) -> Result<u64, UploadError> {
        let expected = session.expected_size;
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(_) => Err(UploadError::AlreadyExists(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(session)));
                debug!(upload_id = id, expected, "upload session opened");
                Ok(expected)
            }
        }
    }

    fn session(&self, id: &str) -> Result<Arc<Mutex<Session>>, UploadError> {
        self.sessions
            .get(id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| UploadError::NotFound(id.to_string()))
    }

    /// Accept the next chunk and return the bytes to append to the staged
    /// object. A rejected chunk leaves the session unchanged.
    pub async fn submit_chunk(
        &self,
        id: &str,
        offset: u64,
        bytes: &[u8],
        is_last: bool,
    ) -> Result<Vec<u8>, UploadError> {
        let session = self.session(id)?;
        let mut s = session.lock().await;

        if s.finalized {
            return Err(UploadError::AlreadyFinalized(id.to_string()));
        }
        if offset != s.received {
            return Err(UploadError::OutOfOrder {
                expected: s.received,
                got: offset,
            });
        }
        let end = s.received + bytes.len() as u64;
        if end > s.plain_size {
            return Err(UploadError::SizeExceeded {
                declared: s.plain_size,
                end,
            });
        }
        if is_last && end != s.plain_size {
            return Err(UploadError::SizeMismatch {
                expected: s.plain_size,
                actual: end,
            });
        }

        let mut out = Vec::with_capacity(bytes.len() + 64);
        match s.encryptor.as_mut() {
            Some(enc) => enc.update(bytes, &mut out)?,
            None => out.extend_from_slice(bytes),
        }
        if is_last {
            if let Some(enc) = s.encryptor.take() {
                enc.finish(&mut out)?;
            }
        }

        s.received = end;
        s.emitted += out.len() as u64;
        s.last_activity = Instant::now();

        if is_last {
            if s.emitted != s.expected_size {
                return Err(UploadError::SizeMismatch {
                    expected: s.expected_size,
                    actual: s.emitted,
                });
            }
            s.finalized = true;
            info!(upload_id = id, bytes = s.emitted, "upload assembled");
        }
        Ok(out)
    }

    /// Detach a finalized session.
    pub async fn release(&self, id: &str) -> Result<CompletedUpload, UploadError> {
        let session = self.session(id)?;
        let completed = {
            let mut s = session.lock().await;
            if !s.finalized {
                return Err(UploadError::NotFinalized(id.to_string()));
            }
            let (file_key, encryption) = match s.key.take() {
                Some((key, info)) => (Some(key), info),
                None => (None, FileEncryptionInfo::unencrypted()),
            };
            CompletedUpload {
                id: id.to_string(),
                display_name: std::mem::take(&mut s.display_name),
                plain_size: s.plain_size,
                stored_size: s.emitted,
                encryption,
                file_key,
            }
        };
        self.sessions.remove(id);
        Ok(completed)
    }

    /// Drop a session in any state. Returns whether it existed.
    pub fn abort(&self, id: &str) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            debug!(upload_id = id, "upload session aborted");
        }
        removed
    }

    /// Remove sessions idle for longer than `max_idle`. Sessions currently
    /// processing a chunk are skipped.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| match session.try_lock() {
            Ok(s) => s.last_activity.elapsed() < max_idle,
            Err(_) => true,
        });
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            info!(removed, "idle upload sessions swept");
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl std::fmt::Debug for Assembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assembler")
            .field("sessions", &self.sessions.len())
            .field("max_file_size", &self.max_file_size)
            .finish()
    }
}
