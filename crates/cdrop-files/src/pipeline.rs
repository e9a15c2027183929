//! Chunked upload pipeline.
//!
//! Ties the pieces of an upload together: the rate limiter admits the
//! client, the assembler turns chunks into stored bytes, those bytes are
//! appended to a staging file, and once the last chunk arrives the staged
//! object is hashed and handed to the file service. Every phase change is
//! recorded in the status table, which pushes it to live subscribers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cdrop_core::types::{FileRecord, UploadPhase};
use cdrop_core::wire::{sanitize_upload_id, ChunkFrame};
use cdrop_storage::StagingFile;
use cdrop_upload::{Assembler, RateLimiter, StatusTable, UploadError};
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{FileError, FileResult};
use crate::service::{remove_quietly, FileService, NewFile};

struct Pending {
    path: PathBuf,
    file: Option<tokio::fs::File>,
    request: NewFile,
}

/// Result of opening an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginOutcome {
    /// The sanitised id all further calls must use
    pub upload_id: String,
    /// Size of the object that will be stored
    pub stored_size: u64,
    pub encrypted: bool,
}

pub struct UploadPipeline {
    assembler: Arc<Assembler>,
    status: Arc<StatusTable>,
    limiter: RateLimiter,
    files: Arc<FileService>,
    pending: DashMap<String, Arc<Mutex<Pending>>>,
}

impl UploadPipeline {
    pub fn new(
        assembler: Arc<Assembler>,
        status: Arc<StatusTable>,
        limiter: RateLimiter,
        files: Arc<FileService>,
    ) -> Self {
        Self {
            assembler,
            status,
            limiter,
            files,
            pending: DashMap::new(),
        }
    }

    pub fn status(&self) -> &Arc<StatusTable> {
        &self.status
    }

    pub fn assembler(&self) -> &Arc<Assembler> {
        &self.assembler
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Open an upload for `client` (the rate limiting key).
    pub async fn begin(
        &self,
        client: &str,
        raw_id: &str,
        plain_size: u64,
        request: NewFile,
    ) -> FileResult<BeginOutcome> {
        if !self.limiter.allow(client) {
            return Err(FileError::RateLimited(client.to_string()));
        }
        let id = sanitize_upload_id(raw_id)?;
        let encrypted = self.files.encrypts_new_uploads(request.end_to_end);

        let stored_size = if encrypted {
            self.assembler.begin_upload(&id, plain_size, &request.name)?
        } else {
            self.assembler
                .begin_passthrough(&id, plain_size, &request.name)?
        };

        let path = self.files.staging_path();
        let file = match tokio::fs::File::create(&path).await {
            Ok(f) => f,
            Err(e) => {
                self.assembler.abort(&id);
                return Err(e.into());
            }
        };
        self.pending.insert(
            id.clone(),
            Arc::new(Mutex::new(Pending {
                path,
                file: Some(file),
                request,
            })),
        );

        debug!(upload_id = %id, plain_size, stored_size, encrypted, "upload opened");
        Ok(BeginOutcome {
            upload_id: id,
            stored_size,
            encrypted,
        })
    }

    /// Accept one chunk. Returns the stored file once the last chunk has
    /// been processed.
    ///
    /// A chunk the assembler rejects leaves the upload open. Failures after
    /// that point end the upload with the `Error` phase.
    pub async fn submit(
        &self,
        id: &str,
        offset: u64,
        bytes: &[u8],
        is_last: bool,
    ) -> FileResult<Option<FileRecord>> {
        let pending = self
            .pending
            .get(id)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| UploadError::NotFound(id.to_string()))?;
        let mut p = pending.lock().await;

        let out = self.assembler.submit_chunk(id, offset, bytes, is_last).await?;

        let written = match p.file.as_mut() {
            Some(file) => file.write_all(&out).await,
            None => Err(std::io::Error::other("staging file already closed")),
        };
        if let Err(e) = written {
            return Err(self.fail(id, &p, e.into()).await);
        }
        if !is_last {
            return Ok(None);
        }

        match self.finish(id, &mut p).await {
            Ok(record) => {
                self.pending.remove(id);
                self.status.set_status(
                    id,
                    UploadPhase::Finished,
                    Some(record.id.clone()),
                    None,
                );
                info!(upload_id = id, file_id = %record.id, "upload complete");
                Ok(Some(record))
            }
            Err(e) => Err(self.fail(id, &p, e).await),
        }
    }

    /// Submit a decoded wire frame.
    pub async fn submit_frame(&self, frame: &ChunkFrame) -> FileResult<Option<FileRecord>> {
        self.submit(&frame.upload_id, frame.offset, &frame.payload, frame.is_last)
            .await
    }

    async fn finish(&self, id: &str, p: &mut Pending) -> FileResult<FileRecord> {
        self.status
            .set_status(id, UploadPhase::HashingOrEncrypting, None, None);
        if let Some(mut file) = p.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }

        let completed = self.assembler.release(id).await?;
        let staged = StagingFile::from_path(&p.path).await?;

        self.status.set_status(id, UploadPhase::Uploading, None, None);
        self.files
            .ingest_staged(
                staged,
                &p.request,
                completed.plain_size,
                completed.encryption,
            )
            .await
    }

    async fn fail(&self, id: &str, p: &Pending, err: FileError) -> FileError {
        warn!(upload_id = id, error = %err, "upload failed");
        self.status
            .set_status(id, UploadPhase::Error, None, Some(err.to_string()));
        self.assembler.abort(id);
        self.pending.remove(id);
        remove_quietly(&p.path).await;
        err
    }

    /// Drop an upload in any state.
    pub async fn abort(&self, id: &str) -> bool {
        let existed = self.assembler.abort(id);
        if let Some((_, pending)) = self.pending.remove(id) {
            let p = pending.lock().await;
            remove_quietly(&p.path).await;
            return true;
        }
        existed
    }

    /// Remove uploads idle for longer than `max_idle` together with their
    /// staging files.
    pub async fn sweep_idle(&self, max_idle: Duration) -> usize {
        let removed = self.assembler.sweep_idle(max_idle);

        let orphaned: Vec<String> = self
            .pending
            .iter()
            .filter(|p| !self.assembler.contains(p.key()))
            .map(|p| p.key().clone())
            .collect();
        for id in orphaned {
            let Some((_, pending)) = self.pending.remove(&id) else {
                continue;
            };
            // Uploads mid-finish hold the lock and are left alone
            let Ok(p) = pending.try_lock() else {
                self.pending.insert(id, Arc::clone(&pending));
                continue;
            };
            remove_quietly(&p.path).await;
            debug!(upload_id = %id, "stale upload staging removed");
        }
        removed
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

impl std::fmt::Debug for UploadPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadPipeline")
            .field("in_flight", &self.pending.len())
            .field("assembler", &self.assembler)
            .finish()
    }
}
