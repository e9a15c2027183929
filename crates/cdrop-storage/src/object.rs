//! Narrow object-store contract used by [`crate::RemoteDriver`]

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use opendal::{ErrorKind, Operator};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::error::StorageError;
use crate::health;

/// Transfer unit for uploads and ranged downloads
const TRANSFER_CHUNK: usize = 8 * 1024 * 1024;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket all keys live in
    fn bucket(&self) -> &str;

    /// Upload a local file under `key`, returning the object's location.
    async fn upload(
        &self,
        source: &Path,
        key: &str,
        content_type: &str,
    ) -> Result<String, StorageError>;

    /// Download `key` into `dest`, returning the byte count.
    async fn download(&self, key: &str, dest: &Path) -> Result<u64, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Object length, `None` if the object does not exist.
    async fn stat_len(&self, key: &str) -> Result<Option<u64>, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Time-limited URL allowing a client to fetch `key` directly.
    async fn presign(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), StorageError>;
}

/// [`ObjectStore`] over an OpenDAL operator.
#[derive(Debug, Clone)]
pub struct OpendalStore {
    op: Operator,
    bucket: String,
    endpoint: String,
}

impl OpendalStore {
    pub fn new(op: Operator, bucket: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            op,
            bucket: bucket.into(),
            endpoint: endpoint.into(),
        }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }
}

#[async_trait]
impl ObjectStore for OpendalStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn upload(
        &self,
        source: &Path,
        key: &str,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let mut file = tokio::fs::File::open(source).await?;
        let mut writer = if self.op.info().full_capability().write_with_content_type {
            self.op.writer_with(key).content_type(content_type).await?
        } else {
            self.op.writer(key).await?
        };
        let mut buf = vec![0u8; TRANSFER_CHUNK];
        let mut total = 0u64;

        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write(buf[..n].to_vec()).await?;
            total += n as u64;
        }
        writer.close().await?;

        debug!(key, bytes = total, bucket = %self.bucket, "object uploaded");
        Ok(format!(
            "{}/{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.bucket,
            key
        ))
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<u64, StorageError> {
        let len = self
            .stat_len(key)
            .await?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        let reader = self.op.reader(key).await?;
        let mut out = tokio::fs::File::create(dest).await?;

        let mut offset = 0u64;
        while offset < len {
            let end = (offset + TRANSFER_CHUNK as u64).min(len);
            let buf = reader.read(offset..end).await?;
            out.write_all(&buf.to_vec()).await?;
            offset = end;
        }
        out.flush().await?;

        debug!(key, bytes = len, "object downloaded");
        Ok(len)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.op.exists(key).await?)
    }

    async fn stat_len(&self, key: &str) -> Result<Option<u64>, StorageError> {
        match self.op.stat(key).await {
            Ok(meta) => Ok(Some(meta.content_length())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.op.delete(key).await?;
        Ok(())
    }

    async fn presign(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        let req = self.op.presign_read(key, ttl).await?;
        Ok(req.uri().to_string())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        health::check_health(&self.op).await
    }
}

#[cfg(test)]
pub(crate) fn memory_store(bucket: &str) -> OpendalStore {
    let op = Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish();
    OpendalStore::new(op, bucket, "memory://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_download_roundtrip() {
        let store = memory_store("drops");
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 13) as u8).collect();
        std::fs::write(&src, &data).unwrap();

        let location = store
            .upload(&src, "obj", "application/octet-stream")
            .await
            .unwrap();
        assert_eq!(location, "memory://drops/obj");
        assert!(store.exists("obj").await.unwrap());
        assert_eq!(store.stat_len("obj").await.unwrap(), Some(data.len() as u64));

        let dest = dir.path().join("dest");
        let n = store.download("obj", &dest).await.unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_missing_object() {
        let store = memory_store("drops");
        assert!(!store.exists("nope").await.unwrap());
        assert_eq!(store.stat_len("nope").await.unwrap(), None);

        let dir = tempfile::tempdir().unwrap();
        let err = store.download("nope", &dir.path().join("x")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_and_ping() {
        let store = memory_store("drops");
        store.operator().write("obj", b"abc".to_vec()).await.unwrap();
        store.delete("obj").await.unwrap();
        assert!(!store.exists("obj").await.unwrap());
        assert!(store.ping().await.is_ok());
    }
}
