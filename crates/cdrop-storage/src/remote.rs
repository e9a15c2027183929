//! Remote object-store driver

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cdrop_core::config::{S3Config, ServePolicy};
use cdrop_core::types::DriverKind;
use tracing::{debug, info, warn};

use crate::driver::{ContentMeta, FileHandle, ServeTarget, StorageDriver, StoreOutcome};
use crate::error::StorageError;
use crate::hash::{validate_hash, StagingFile};
use crate::object::{ObjectStore, OpendalStore};
use crate::operator::build_operator;

pub struct RemoteDriver {
    store: Arc<dyn ObjectStore>,
    name: String,
    policy: ServePolicy,
    presign_ttl: Duration,
}

impl RemoteDriver {
    /// Build a driver backed by an OpenDAL S3 operator.
    ///
    /// # Panics
    ///
    /// Panics if `cfg.bucket` is empty.
    pub fn new(
        cfg: &S3Config,
        policy: ServePolicy,
        presign_ttl: Duration,
    ) -> Result<Self, StorageError> {
        assert!(!cfg.bucket.is_empty(), "remote storage driver requires a bucket");
        let op = build_operator(cfg)?;
        let store = OpendalStore::new(op, &cfg.bucket, &cfg.endpoint);
        Ok(Self::with_store(Arc::new(store), policy, presign_ttl))
    }

    /// # Panics
    ///
    /// Panics if the store reports an empty bucket.
    pub fn with_store(
        store: Arc<dyn ObjectStore>,
        policy: ServePolicy,
        presign_ttl: Duration,
    ) -> Self {
        assert!(!store.bucket().is_empty(), "remote storage driver requires a bucket");
        Self {
            name: format!("s3:{}", store.bucket()),
            store,
            policy,
            presign_ttl,
        }
    }

    pub fn policy(&self) -> ServePolicy {
        self.policy
    }
}

#[async_trait]
impl StorageDriver for RemoteDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::S3
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn bucket(&self) -> &str {
        self.store.bucket()
    }

    async fn is_available(&self) -> bool {
        match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(driver = %self.name, error = %e, "object store unreachable");
                false
            }
        }
    }

    async fn store(
        &self,
        staged: StagingFile,
        meta: &ContentMeta,
    ) -> Result<StoreOutcome, StorageError> {
        validate_hash(staged.hash())?;

        let outcome = match self.store.stat_len(staged.hash()).await? {
            Some(len) if len == staged.len() => {
                debug!(hash = %staged.hash(), "object already in bucket");
                StoreOutcome::Deduplicated
            }
            existing => {
                if let Some(len) = existing {
                    warn!(
                        hash = %staged.hash(),
                        existing = len,
                        expected = staged.len(),
                        "replacing remote object with unexpected length"
                    );
                }
                let content_type = if meta.content_type.is_empty() {
                    "application/octet-stream"
                } else {
                    meta.content_type.as_str()
                };
                let location = self
                    .store
                    .upload(staged.path(), staged.hash(), content_type)
                    .await?;
                info!(
                    hash = %staged.hash(),
                    bytes = staged.len(),
                    %location,
                    "object uploaded"
                );
                StoreOutcome::Stored
            }
        };

        tokio::fs::remove_file(staged.path()).await?;
        Ok(outcome)
    }

    async fn file_exists(&self, hash: &str) -> Result<bool, StorageError> {
        validate_hash(hash)?;
        self.store.exists(hash).await
    }

    async fn get_file(&self, hash: &str) -> Result<FileHandle, StorageError> {
        validate_hash(hash)?;
        match self.store.stat_len(hash).await? {
            Some(len) => Ok(FileHandle::Remote {
                bucket: self.store.bucket().to_string(),
                key: hash.to_string(),
                len,
            }),
            None => Err(StorageError::NotFound(hash.to_string())),
        }
    }

    async fn serve(&self, hash: &str, encrypted: bool) -> Result<ServeTarget, StorageError> {
        // Only the server can decrypt, so encrypted objects are never redirected
        if encrypted || self.policy == ServePolicy::Proxy {
            return Ok(ServeTarget::Proxy(self.get_file(hash).await?));
        }
        validate_hash(hash)?;
        let url = self.store.presign(hash, self.presign_ttl).await?;
        Ok(ServeTarget::Redirect { url })
    }

    async fn download_to(&self, hash: &str, dest: &Path) -> Result<u64, StorageError> {
        validate_hash(hash)?;
        self.store.download(hash, dest).await
    }

    async fn delete(&self, hash: &str) -> Result<(), StorageError> {
        validate_hash(hash)?;
        self.store.delete(hash).await?;
        info!(hash, bucket = %self.store.bucket(), "remote object deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use crate::object::memory_store;

    /// Memory-backed store with a fake presigner (the Memory service cannot presign)
    struct PresigningStore(OpendalStore);

    #[async_trait]
    impl ObjectStore for PresigningStore {
        fn bucket(&self) -> &str {
            self.0.bucket()
        }
        async fn upload(&self, s: &Path, k: &str, ct: &str) -> Result<String, StorageError> {
            self.0.upload(s, k, ct).await
        }
        async fn download(&self, k: &str, d: &Path) -> Result<u64, StorageError> {
            self.0.download(k, d).await
        }
        async fn exists(&self, k: &str) -> Result<bool, StorageError> {
            self.0.exists(k).await
        }
        async fn stat_len(&self, k: &str) -> Result<Option<u64>, StorageError> {
            self.0.stat_len(k).await
        }
        async fn delete(&self, k: &str) -> Result<(), StorageError> {
            self.0.delete(k).await
        }
        async fn presign(&self, k: &str, ttl: Duration) -> Result<String, StorageError> {
            Ok(format!("https://signed.example/{k}?ttl={}", ttl.as_secs()))
        }
        async fn ping(&self) -> Result<(), StorageError> {
            self.0.ping().await
        }
    }

    fn driver(policy: ServePolicy) -> RemoteDriver {
        RemoteDriver::with_store(
            Arc::new(PresigningStore(memory_store("drops"))),
            policy,
            Duration::from_secs(60),
        )
    }

    fn stage(dir: &Path, name: &str, data: &[u8]) -> StagingFile {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        StagingFile::new(path, hash_bytes(data), data.len() as u64).unwrap()
    }

    #[tokio::test]
    async fn test_store_uploads_and_removes_staging() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(ServePolicy::Proxy);
        let staged = stage(dir.path(), "a", b"remote bytes");
        let hash = staged.hash().to_string();
        let staged_path = staged.path().to_path_buf();

        let outcome = driver.store(staged, &ContentMeta::default()).await.unwrap();
        assert_eq!(outcome, StoreOutcome::Stored);
        assert!(!staged_path.exists());
        assert!(driver.file_exists(&hash).await.unwrap());
        assert_eq!(
            driver.get_file(&hash).await.unwrap(),
            FileHandle::Remote {
                bucket: "drops".into(),
                key: hash.clone(),
                len: 12
            }
        );

        let dest = dir.path().join("back");
        assert_eq!(driver.download_to(&hash, &dest).await.unwrap(), 12);
        assert_eq!(std::fs::read(dest).unwrap(), b"remote bytes");
    }

    #[tokio::test]
    async fn test_store_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(ServePolicy::Proxy);
        driver
            .store(stage(dir.path(), "a", b"dup"), &ContentMeta::default())
            .await
            .unwrap();

        let second = stage(dir.path(), "b", b"dup");
        let second_path = second.path().to_path_buf();
        let outcome = driver.store(second, &ContentMeta::default()).await.unwrap();
        assert_eq!(outcome, StoreOutcome::Deduplicated);
        assert!(!second_path.exists());
    }

    #[tokio::test]
    async fn test_serve_policy() {
        let dir = tempfile::tempdir().unwrap();
        let redirect = driver(ServePolicy::Redirect);
        let staged = stage(dir.path(), "a", b"served");
        let hash = staged.hash().to_string();
        redirect.store(staged, &ContentMeta::default()).await.unwrap();

        match redirect.serve(&hash, false).await.unwrap() {
            ServeTarget::Redirect { url } => {
                assert!(url.starts_with("https://signed.example/"));
                assert!(url.ends_with("ttl=60"));
            }
            other => panic!("expected redirect, got {other:?}"),
        }
        // Encrypted objects are proxied regardless of policy
        assert!(matches!(
            redirect.serve(&hash, true).await.unwrap(),
            ServeTarget::Proxy(FileHandle::Remote { .. })
        ));
    }

    #[tokio::test]
    async fn test_proxy_policy_never_redirects() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = driver(ServePolicy::Proxy);
        let staged = stage(dir.path(), "a", b"served");
        let hash = staged.hash().to_string();
        proxy.store(staged, &ContentMeta::default()).await.unwrap();

        assert!(matches!(
            proxy.serve(&hash, false).await.unwrap(),
            ServeTarget::Proxy(_)
        ));
    }

    #[tokio::test]
    async fn test_delete_and_availability() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(ServePolicy::Proxy);
        let staged = stage(dir.path(), "a", b"bye");
        let hash = staged.hash().to_string();
        driver.store(staged, &ContentMeta::default()).await.unwrap();

        assert!(driver.is_available().await);
        driver.delete(&hash).await.unwrap();
        assert!(!driver.file_exists(&hash).await.unwrap());
        assert!(driver.get_file(&hash).await.unwrap_err().is_not_found());
    }

    #[test]
    #[should_panic(expected = "bucket")]
    fn test_empty_bucket_panics() {
        let cfg = S3Config {
            bucket: String::new(),
            ..Default::default()
        };
        let _ = RemoteDriver::new(&cfg, ServePolicy::Proxy, Duration::from_secs(1));
    }
}
