//! File metadata persistence.
//!
//! Two backends are available:
//!   - **Memory**: `DashMap` tables, gone on restart. Used by tests and
//!     throwaway deployments.
//!   - **JSON**: everything held in memory and rewritten to a single file
//!     after each change, atomically via temp+rename.
//!
//! Both implement [`MetadataStore`], so the file service uses either
//! transparently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cdrop_core::types::{E2EInfoEncrypted, FileRecord};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{FileError, FileResult};

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_file(&self, id: &str) -> FileResult<Option<FileRecord>>;

    async fn all_files(&self) -> FileResult<Vec<FileRecord>>;

    /// Insert or replace the record with `record.id`.
    async fn upsert_file(&self, record: FileRecord) -> FileResult<()>;

    /// Returns whether a record was removed.
    async fn delete_file(&self, id: &str) -> FileResult<bool>;

    async fn get_e2e_info(&self, owner: &str) -> FileResult<Option<E2EInfoEncrypted>>;

    async fn save_e2e_info(&self, owner: &str, info: E2EInfoEncrypted) -> FileResult<()>;

    async fn delete_e2e_info(&self, owner: &str) -> FileResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    files: DashMap<String, FileRecord>,
    e2e: DashMap<String, E2EInfoEncrypted>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get_file(&self, id: &str) -> FileResult<Option<FileRecord>> {
        Ok(self.files.get(id).map(|r| r.value().clone()))
    }

    async fn all_files(&self) -> FileResult<Vec<FileRecord>> {
        Ok(self.files.iter().map(|r| r.value().clone()).collect())
    }

    async fn upsert_file(&self, record: FileRecord) -> FileResult<()> {
        self.files.insert(record.id.clone(), record);
        Ok(())
    }

    async fn delete_file(&self, id: &str) -> FileResult<bool> {
        Ok(self.files.remove(id).is_some())
    }

    async fn get_e2e_info(&self, owner: &str) -> FileResult<Option<E2EInfoEncrypted>> {
        Ok(self.e2e.get(owner).map(|r| r.value().clone()))
    }

    async fn save_e2e_info(&self, owner: &str, info: E2EInfoEncrypted) -> FileResult<()> {
        self.e2e.insert(owner.to_string(), info);
        Ok(())
    }

    async fn delete_e2e_info(&self, owner: &str) -> FileResult<()> {
        self.e2e.remove(owner);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    files: HashMap<String, FileRecord>,
    #[serde(default)]
    e2e: HashMap<String, E2EInfoEncrypted>,
}

/// JSON file backed store. The lock is held across each flush so snapshots
/// reach the disk in the order they were taken.
#[derive(Debug)]
pub struct JsonMetadataStore {
    path: PathBuf,
    state: Mutex<Snapshot>,
}

impl JsonMetadataStore {
    /// Load or create a store at the given path. A missing file starts empty.
    pub async fn open(path: &Path) -> FileResult<Self> {
        let state = match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                FileError::Metadata(format!("parsing {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, state: &Snapshot) -> FileResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| FileError::Metadata(format!("serializing metadata: {e}")))?;

        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &json).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        debug!(path = %self.path.display(), files = state.files.len(), "metadata flushed");
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn get_file(&self, id: &str) -> FileResult<Option<FileRecord>> {
        Ok(self.state.lock().await.files.get(id).cloned())
    }

    async fn all_files(&self) -> FileResult<Vec<FileRecord>> {
        Ok(self.state.lock().await.files.values().cloned().collect())
    }

    async fn upsert_file(&self, record: FileRecord) -> FileResult<()> {
        let mut state = self.state.lock().await;
        state.files.insert(record.id.clone(), record);
        self.flush(&state).await
    }

    async fn delete_file(&self, id: &str) -> FileResult<bool> {
        let mut state = self.state.lock().await;
        if state.files.remove(id).is_none() {
            return Ok(false);
        }
        self.flush(&state).await?;
        Ok(true)
    }

    async fn get_e2e_info(&self, owner: &str) -> FileResult<Option<E2EInfoEncrypted>> {
        Ok(self.state.lock().await.e2e.get(owner).cloned())
    }

    async fn save_e2e_info(&self, owner: &str, info: E2EInfoEncrypted) -> FileResult<()> {
        let mut state = self.state.lock().await;
        state.e2e.insert(owner.to_string(), info);
        self.flush(&state).await
    }

    async fn delete_e2e_info(&self, owner: &str) -> FileResult<()> {
        let mut state = self.state.lock().await;
        if state.e2e.remove(owner).is_some() {
            self.flush(&state).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn sample_record(id: &str, hash: &str) -> FileRecord {
    use cdrop_core::types::{DriverKind, FileEncryptionInfo};
    FileRecord {
        id: id.to_string(),
        name: format!("{id}.bin"),
        size_bytes: 3,
        content_hash: hash.to_string(),
        content_type: "application/octet-stream".into(),
        driver: DriverKind::Local,
        bucket: String::new(),
        created_at: 1_700_000_000,
        expire_at: None,
        downloads_remaining: None,
        download_count: 0,
        password_hash: None,
        encryption: FileEncryptionInfo::unencrypted(),
        end_to_end: false,
    }
}
