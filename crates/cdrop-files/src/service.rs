//! File service: ingest, access rules, delivery and cleanup.
//!
//! Content objects are shared: two records with the same stored bytes point
//! at one object. An object is only removed from its backend after a fresh
//! scan of the live records finds no other reference to it.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use cdrop_core::config::EncryptionLevel;
use cdrop_core::types::{now_unix, E2EInfoEncrypted, FileEncryptionInfo, FileRecord};
use cdrop_crypto::{new_file_key, unwrap_file_key, EncryptWriter, MasterKeyVault};
use cdrop_storage::{
    ActiveDriver, ContentMeta, FileHandle, HashingWriter, ServeTarget, StagingFile,
    StorageDriver, StoreOutcome,
};
use cdrop_upload::{Event, Publisher};
use dashmap::DashMap;
use rand::RngCore;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::error::{FileError, FileResult};
use crate::metadata::MetadataStore;

/// Caller-supplied attributes of a new file.
#[derive(Debug, Clone, Default)]
pub struct NewFile {
    pub name: String,
    pub content_type: String,
    /// Unix seconds; `None` never expires
    pub expire_at: Option<u64>,
    /// `None` allows unlimited downloads
    pub downloads: Option<u32>,
    pub password: Option<String>,
    /// Bytes were encrypted by the client
    pub end_to_end: bool,
}

/// What a download resolved to.
#[derive(Debug)]
pub enum Delivery<W> {
    /// Plaintext (or client ciphertext for end-to-end files) was written out
    Written { record: FileRecord, bytes: u64, out: W },
    /// The client should fetch the object from this URL
    Redirect { record: FileRecord, url: String },
}

pub struct FileService {
    metadata: Arc<dyn MetadataStore>,
    drivers: ActiveDriver,
    vault: Arc<MasterKeyVault>,
    publisher: Publisher,
    level: EncryptionLevel,
    staging_dir: PathBuf,
    /// Serializes read-modify-write of download counters
    accounting: Mutex<()>,
    /// Held across "store object, add record" and "remove record, drop
    /// unreferenced object" for one content hash
    content_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileService {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        drivers: ActiveDriver,
        vault: Arc<MasterKeyVault>,
        publisher: Publisher,
        level: EncryptionLevel,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            metadata,
            drivers,
            vault,
            publisher,
            level,
            staging_dir: staging_dir.into(),
            accounting: Mutex::new(()),
            content_locks: DashMap::new(),
        }
    }

    pub fn level(&self) -> EncryptionLevel {
        self.level
    }

    pub fn drivers(&self) -> &ActiveDriver {
        &self.drivers
    }

    pub fn vault(&self) -> &Arc<MasterKeyVault> {
        &self.vault
    }

    /// Whether a new upload should be encrypted by the server, given the
    /// currently active driver.
    pub fn encrypts_new_uploads(&self, end_to_end: bool) -> bool {
        !end_to_end && self.level.encrypts_on(self.drivers.current().kind().is_remote())
    }

    /// A fresh, unused path in the staging directory.
    pub fn staging_path(&self) -> PathBuf {
        self.staging_dir
            .join(format!("{}.part", uuid::Uuid::new_v4().simple()))
    }

    /// Ingest a complete stream: encrypt while staging if the level asks for
    /// it, hash, then hand the staged object to the active driver.
    pub async fn ingest_reader<R>(&self, reader: R, request: NewFile) -> FileResult<FileRecord>
    where
        R: Read + Send + 'static,
    {
        let encrypt = self.encrypts_new_uploads(request.end_to_end);
        let path = self.staging_path();
        let vault = Arc::clone(&self.vault);
        let stage_path = path.clone();

        let staged = tokio::task::spawn_blocking(move || stage(reader, &stage_path, encrypt, &vault))
            .await
            .map_err(|e| FileError::Io(std::io::Error::other(e)))?;

        let result = match staged {
            Ok((staged, plain_size, encryption)) => {
                self.ingest_staged(staged, &request, plain_size, encryption).await
            }
            Err(e) => Err(e),
        };
        if result.is_err() {
            remove_quietly(&path).await;
        }
        result
    }

    /// Store an already staged object and create its record.
    pub async fn ingest_staged(
        &self,
        staged: StagingFile,
        request: &NewFile,
        plain_size: u64,
        encryption: FileEncryptionInfo,
    ) -> FileResult<FileRecord> {
        let driver = self.drivers.current();
        let hash = staged.hash().to_string();
        let meta = ContentMeta {
            file_name: request.name.clone(),
            content_type: request.content_type.clone(),
        };

        let password_hash = match request.password.as_deref() {
            Some(pw) if !pw.is_empty() => Some(hash_password(pw)?),
            _ => None,
        };

        let _content = self.lock_content(&hash).await;
        let outcome = driver.store(staged, &meta).await?;
        if outcome == StoreOutcome::Deduplicated {
            debug!(hash = %hash, driver = driver.name(), "content already stored");
        }

        let record = FileRecord {
            id: new_file_id(),
            name: request.name.clone(),
            size_bytes: plain_size,
            content_hash: hash,
            content_type: request.content_type.clone(),
            driver: driver.kind(),
            bucket: driver.bucket().to_string(),
            created_at: now_unix(),
            expire_at: request.expire_at,
            downloads_remaining: request.downloads,
            download_count: 0,
            password_hash,
            encryption,
            end_to_end: request.end_to_end || self.level == EncryptionLevel::EndToEnd,
        };
        self.metadata.upsert_file(record.clone()).await?;

        info!(
            file_id = %record.id,
            hash = %record.content_hash,
            size = record.size_bytes,
            encrypted = record.encryption.is_encrypted,
            driver = %record.driver,
            "file stored"
        );
        Ok(record)
    }

    /// Look up a file that may still be downloaded.
    pub async fn get_file(&self, id: &str) -> FileResult<FileRecord> {
        let record = self
            .metadata
            .get_file(id)
            .await?
            .ok_or_else(|| FileError::NotFound(id.to_string()))?;
        if record.is_expired(now_unix()) {
            return Err(FileError::Expired(id.to_string()));
        }
        if !self.driver_for(&record)?.file_exists(&record.content_hash).await? {
            warn!(file_id = id, hash = %record.content_hash, "record without stored content");
            return Err(FileError::ContentMissing(id.to_string()));
        }
        Ok(record)
    }

    pub fn check_password(&self, record: &FileRecord, password: Option<&str>) -> FileResult<()> {
        let Some(stored) = record.password_hash.as_deref() else {
            return Ok(());
        };
        let Some(given) = password else {
            return Err(FileError::PasswordRequired);
        };
        let parsed =
            PasswordHash::new(stored).map_err(|e| FileError::PasswordHash(e.to_string()))?;
        Argon2::default()
            .verify_password(given.as_bytes(), &parsed)
            .map_err(|_| FileError::WrongPassword)
    }

    /// Serve a file: enforce the access rules, count the download, then
    /// either write the content to `out` or hand back a redirect.
    ///
    /// Server-side encrypted files are decrypted on the way out. If decryption
    /// fails `out` may hold a prefix of the plaintext and must be discarded.
    pub async fn download<W>(
        &self,
        id: &str,
        password: Option<&str>,
        out: W,
    ) -> FileResult<Delivery<W>>
    where
        W: Write + Send + 'static,
    {
        let record = self.get_file(id).await?;
        self.check_password(&record, password)?;
        let record = self.count_download(id).await?;

        let driver = self.driver_for(&record)?;
        let target = driver
            .serve(&record.content_hash, record.encryption.is_encrypted)
            .await?;

        let (path, temporary) = match target {
            ServeTarget::Redirect { url } => return Ok(Delivery::Redirect { record, url }),
            ServeTarget::Proxy(FileHandle::Local { path, .. }) => (path, false),
            ServeTarget::Proxy(FileHandle::Remote { .. }) => {
                let tmp = self.staging_path();
                if let Err(e) = driver.download_to(&record.content_hash, &tmp).await {
                    remove_quietly(&tmp).await;
                    return Err(e.into());
                }
                (tmp, true)
            }
        };

        let vault = Arc::clone(&self.vault);
        let info = record.encryption.clone();
        let read_path = path.clone();
        let result = tokio::task::spawn_blocking(move || deliver(&read_path, &info, &vault, out))
            .await
            .map_err(|e| FileError::Io(std::io::Error::other(e)));
        if temporary {
            remove_quietly(&path).await;
        }

        let (bytes, out) = result??;
        debug!(file_id = id, bytes, "file delivered");
        Ok(Delivery::Written { record, bytes, out })
    }

    async fn count_download(&self, id: &str) -> FileResult<FileRecord> {
        let _guard = self.accounting.lock().await;
        let mut record = self
            .metadata
            .get_file(id)
            .await?
            .ok_or_else(|| FileError::NotFound(id.to_string()))?;
        if record.is_expired(now_unix()) {
            return Err(FileError::Expired(id.to_string()));
        }
        if let Some(left) = record.downloads_remaining.as_mut() {
            *left -= 1;
        }
        record.download_count += 1;
        self.metadata.upsert_file(record.clone()).await?;

        self.publisher.publish(Event::download(
            &record.id,
            record.download_count,
            record.downloads_remaining,
        ));
        Ok(record)
    }

    /// Remove a file record, and its stored object once nothing else
    /// references it. Returns whether the record existed.
    pub async fn delete_file(&self, id: &str) -> FileResult<bool> {
        let Some(record) = self.metadata.get_file(id).await? else {
            return Ok(false);
        };
        let _content = self.lock_content(&record.content_hash).await;
        if !self.metadata.delete_file(id).await? {
            return Ok(false);
        }
        info!(file_id = id, "file deleted");
        self.release_content(&record).await?;
        Ok(true)
    }

    /// Delete expired or exhausted records and any objects left unreferenced.
    pub async fn cleanup(&self) -> FileResult<usize> {
        let now = now_unix();
        let expired: Vec<FileRecord> = self
            .metadata
            .all_files()
            .await?
            .into_iter()
            .filter(|r| r.is_expired(now))
            .collect();

        let mut removed = 0;
        for record in &expired {
            let _content = self.lock_content(&record.content_hash).await;
            if !self.metadata.delete_file(&record.id).await? {
                continue;
            }
            removed += 1;
            if let Err(e) = self.release_content(record).await {
                warn!(hash = %record.content_hash, error = %e, "failed to remove stored object");
            }
        }

        if removed > 0 {
            info!(removed, "expired files cleaned up");
        }
        Ok(removed)
    }

    /// Caller holds the content lock for `record.content_hash`.
    async fn release_content(&self, record: &FileRecord) -> FileResult<()> {
        let still_used = self.metadata.all_files().await?.iter().any(|other| {
            other.content_hash == record.content_hash
                && other.driver == record.driver
                && other.bucket == record.bucket
        });
        if still_used {
            debug!(hash = %record.content_hash, "stored object still referenced");
            return Ok(());
        }
        self.driver_for(record)?
            .delete(&record.content_hash)
            .await?;
        info!(hash = %record.content_hash, driver = %record.driver, "stored object removed");
        Ok(())
    }

    pub async fn save_e2e_info(&self, owner: &str, info: E2EInfoEncrypted) -> FileResult<()> {
        let info = E2EInfoEncrypted {
            available_files: Vec::new(),
            ..info
        };
        self.metadata.save_e2e_info(owner, info).await
    }

    /// The owner's envelope, with the ids of end-to-end files that still
    /// exist.
    pub async fn get_e2e_info(&self, owner: &str) -> FileResult<Option<E2EInfoEncrypted>> {
        let Some(mut info) = self.metadata.get_e2e_info(owner).await? else {
            return Ok(None);
        };
        let now = now_unix();
        let mut available: Vec<String> = self
            .metadata
            .all_files()
            .await?
            .into_iter()
            .filter(|r| r.end_to_end && !r.is_expired(now))
            .map(|r| r.id)
            .collect();
        available.sort();
        info.available_files = available;
        Ok(Some(info))
    }

    pub async fn delete_e2e_info(&self, owner: &str) -> FileResult<()> {
        self.metadata.delete_e2e_info(owner).await
    }

    pub async fn file_count(&self) -> FileResult<usize> {
        Ok(self.metadata.all_files().await?.len())
    }

    /// The driver that holds `record`'s object, which may no longer be the
    /// active one.
    fn driver_for(&self, record: &FileRecord) -> FileResult<Arc<dyn StorageDriver>> {
        self.drivers
            .lookup(record.driver, &record.bucket)
            .ok_or_else(|| FileError::NoDriver {
                kind: record.driver,
                bucket: record.bucket.clone(),
            })
    }

    async fn lock_content(&self, hash: &str) -> ContentGuard<'_> {
        let lock = Arc::clone(&self.content_locks.entry(hash.to_string()).or_default());
        let guard = lock.lock_owned().await;
        ContentGuard {
            locks: &self.content_locks,
            hash: hash.to_string(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn content_lock_count(&self) -> usize {
        self.content_locks.len()
    }
}

/// Releases a per-hash lock and forgets it once nobody else is waiting.
struct ContentGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    hash: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ContentGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.hash, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl std::fmt::Debug for FileService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileService")
            .field("level", &self.level)
            .field("staging_dir", &self.staging_dir)
            .finish()
    }
}

fn new_file_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn hash_password(password: &str) -> FileResult<String> {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt = SaltString::encode_b64(&salt).map_err(|e| FileError::PasswordHash(e.to_string()))?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| FileError::PasswordHash(e.to_string()))
}

/// Write `reader` into a staging file, hashing the bytes as stored.
fn stage<R: Read>(
    mut reader: R,
    path: &Path,
    encrypt: bool,
    vault: &MasterKeyVault,
) -> FileResult<(StagingFile, u64, FileEncryptionInfo)> {
    let file = BufWriter::new(File::create(path)?);
    let hashing = HashingWriter::new(file);

    let (hashing, plain_size, encryption) = if encrypt {
        let (key, info) = new_file_key(vault)?;
        let mut writer = EncryptWriter::new(&key, hashing);
        let plain = std::io::copy(&mut reader, &mut writer)?;
        (writer.finish()?, plain, info)
    } else {
        let mut hashing = hashing;
        let plain = std::io::copy(&mut reader, &mut hashing)?;
        (hashing, plain, FileEncryptionInfo::unencrypted())
    };

    let (file, hash, len) = hashing.finalize();
    let file = file.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok((StagingFile::new(path, hash, len)?, plain_size, encryption))
}

/// Copy a stored object to `out`, decrypting when it was encrypted here.
fn deliver<W: Write>(
    path: &Path,
    info: &FileEncryptionInfo,
    vault: &MasterKeyVault,
    mut out: W,
) -> FileResult<(u64, W)> {
    let reader = BufReader::new(File::open(path)?);
    let bytes = if info.is_encrypted {
        let key = unwrap_file_key(vault, info)?;
        cdrop_crypto::decrypt(&key, reader, &mut out)?
    } else {
        let mut reader = reader;
        let n = std::io::copy(&mut reader, &mut out)?;
        out.flush()?;
        n
    };
    Ok((bytes, out))
}

pub(crate) async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove staging file");
        }
    }
}
