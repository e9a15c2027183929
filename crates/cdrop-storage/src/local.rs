//! Local disk driver: one file per object under a data directory

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cdrop_core::config::LocalConfig;
use cdrop_core::types::DriverKind;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::driver::{ContentMeta, FileHandle, ServeTarget, StorageDriver, StoreOutcome};
use crate::error::StorageError;
use crate::hash::{validate_hash, StagingFile};

#[derive(Debug, Clone)]
pub struct LocalDriver {
    data_dir: PathBuf,
    file_prefix: String,
}

impl LocalDriver {
    /// # Panics
    ///
    /// Panics if `cfg.data_dir` is empty.
    pub fn new(cfg: &LocalConfig) -> Self {
        assert!(
            !cfg.data_dir.as_os_str().is_empty(),
            "local storage driver requires a data directory"
        );
        Self {
            data_dir: cfg.data_dir.clone(),
            file_prefix: cfg.file_prefix.clone(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn object_path(&self, hash: &str) -> Result<PathBuf, StorageError> {
        validate_hash(hash)?;
        Ok(self.data_dir.join(format!("{}{}", self.file_prefix, hash)))
    }

    /// Copy `source` to `dest` through a temp file private to this call, so
    /// concurrent stores of one hash never write into the same partial file.
    async fn copy_into_place(&self, source: &Path, dest: &Path) -> Result<(), StorageError> {
        let tmp = self.partial_path(dest);
        let copied = match tokio::fs::copy(source, &tmp).await {
            Ok(_) => tokio::fs::rename(&tmp, dest).await,
            Err(e) => Err(e),
        };
        if let Err(e) = copied {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    fn partial_path(&self, dest: &Path) -> PathBuf {
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.data_dir
            .join(format!("{name}.{}.partial", Uuid::new_v4().simple()))
    }

    async fn existing_len(path: &Path) -> Result<Option<u64>, StorageError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StorageDriver for LocalDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Local
    }

    fn name(&self) -> &str {
        "local"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn store(
        &self,
        staged: StagingFile,
        meta: &ContentMeta,
    ) -> Result<StoreOutcome, StorageError> {
        let dest = self.object_path(staged.hash())?;
        tokio::fs::create_dir_all(&self.data_dir).await?;

        match Self::existing_len(&dest).await? {
            Some(len) if len == staged.len() => {
                tokio::fs::remove_file(staged.path()).await?;
                debug!(hash = %staged.hash(), file = %meta.file_name, "object already stored");
                return Ok(StoreOutcome::Deduplicated);
            }
            Some(len) => warn!(
                hash = %staged.hash(),
                existing = len,
                expected = staged.len(),
                "replacing object with unexpected length"
            ),
            None => {}
        }

        if let Err(e) = tokio::fs::rename(staged.path(), &dest).await {
            // Staging on another filesystem: fall back to copy + remove
            debug!(error = %e, "rename failed, copying staged object");
            self.copy_into_place(staged.path(), &dest).await?;
            tokio::fs::remove_file(staged.path()).await?;
        }

        info!(
            hash = %staged.hash(),
            bytes = staged.len(),
            file = %meta.file_name,
            "object stored locally"
        );
        Ok(StoreOutcome::Stored)
    }

    async fn file_exists(&self, hash: &str) -> Result<bool, StorageError> {
        Ok(Self::existing_len(&self.object_path(hash)?).await?.is_some())
    }

    async fn get_file(&self, hash: &str) -> Result<FileHandle, StorageError> {
        let path = self.object_path(hash)?;
        match Self::existing_len(&path).await? {
            Some(len) => Ok(FileHandle::Local { path, len }),
            None => Err(StorageError::NotFound(hash.to_string())),
        }
    }

    async fn serve(&self, hash: &str, _encrypted: bool) -> Result<ServeTarget, StorageError> {
        Ok(ServeTarget::Proxy(self.get_file(hash).await?))
    }

    async fn download_to(&self, hash: &str, dest: &Path) -> Result<u64, StorageError> {
        let path = self.object_path(hash)?;
        match tokio::fs::copy(&path, dest).await {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, hash: &str) -> Result<(), StorageError> {
        let path = self.object_path(hash)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(hash, "object deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(hash, "object already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    struct Fixture {
        _dir: tempfile::TempDir,
        staging: PathBuf,
        driver: LocalDriver,
    }

    fn fixture(prefix: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let driver = LocalDriver::new(&LocalConfig {
            data_dir: dir.path().join("data"),
            file_prefix: prefix.into(),
        });
        Fixture {
            _dir: dir,
            staging,
            driver,
        }
    }

    fn stage(fx: &Fixture, name: &str, data: &[u8]) -> StagingFile {
        let path = fx.staging.join(name);
        std::fs::write(&path, data).unwrap();
        StagingFile::new(path, hash_bytes(data), data.len() as u64).unwrap()
    }

    #[tokio::test]
    async fn test_store_and_get() {
        let fx = fixture("");
        let staged = stage(&fx, "a", b"hello");
        let hash = staged.hash().to_string();
        let staged_path = staged.path().to_path_buf();

        let outcome = fx.driver.store(staged, &ContentMeta::default()).await.unwrap();
        assert_eq!(outcome, StoreOutcome::Stored);
        assert!(!staged_path.exists(), "staging file must be consumed");
        assert!(fx.driver.file_exists(&hash).await.unwrap());

        match fx.driver.get_file(&hash).await.unwrap() {
            FileHandle::Local { path, len } => {
                assert_eq!(len, 5);
                assert_eq!(std::fs::read(path).unwrap(), b"hello");
            }
            other => panic!("unexpected handle {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_store_dedup_same_length() {
        let fx = fixture("");
        let first = stage(&fx, "a", b"same bytes");
        fx.driver.store(first, &ContentMeta::default()).await.unwrap();

        let second = stage(&fx, "b", b"same bytes");
        let second_path = second.path().to_path_buf();
        let outcome = fx.driver.store(second, &ContentMeta::default()).await.unwrap();

        assert_eq!(outcome, StoreOutcome::Deduplicated);
        assert!(!second_path.exists());
    }

    #[tokio::test]
    async fn test_store_replaces_mismatched_length() {
        let fx = fixture("");
        let staged = stage(&fx, "a", b"full content");
        let hash = staged.hash().to_string();

        // Simulate a torn earlier write under the same hash
        std::fs::create_dir_all(fx.driver.data_dir()).unwrap();
        std::fs::write(fx.driver.data_dir().join(&hash), b"torn").unwrap();

        let outcome = fx.driver.store(staged, &ContentMeta::default()).await.unwrap();
        assert_eq!(outcome, StoreOutcome::Stored);
        assert_eq!(fx.driver.get_file(&hash).await.unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_file_prefix() {
        let fx = fixture("obj-");
        let staged = stage(&fx, "a", b"x");
        let hash = staged.hash().to_string();
        fx.driver.store(staged, &ContentMeta::default()).await.unwrap();

        assert!(fx.driver.data_dir().join(format!("obj-{hash}")).exists());
    }

    #[tokio::test]
    async fn test_missing_and_delete() {
        let fx = fixture("");
        let hash = hash_bytes(b"never stored");
        assert!(!fx.driver.file_exists(&hash).await.unwrap());
        assert!(fx.driver.get_file(&hash).await.unwrap_err().is_not_found());

        let staged = stage(&fx, "a", b"to delete");
        let hash = staged.hash().to_string();
        fx.driver.store(staged, &ContentMeta::default()).await.unwrap();
        fx.driver.delete(&hash).await.unwrap();
        assert!(!fx.driver.file_exists(&hash).await.unwrap());
        // Idempotent
        fx.driver.delete(&hash).await.unwrap();
    }

    #[tokio::test]
    async fn test_serve_is_always_proxy() {
        let fx = fixture("");
        let staged = stage(&fx, "a", b"data");
        let hash = staged.hash().to_string();
        fx.driver.store(staged, &ContentMeta::default()).await.unwrap();

        for encrypted in [true, false] {
            assert!(matches!(
                fx.driver.serve(&hash, encrypted).await.unwrap(),
                ServeTarget::Proxy(FileHandle::Local { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_rejects_path_like_hash() {
        let fx = fixture("");
        let err = fx.driver.file_exists("../../etc/passwd").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidHash(_)));
    }

    #[test]
    #[should_panic(expected = "data directory")]
    fn test_empty_data_dir_panics() {
        LocalDriver::new(&LocalConfig {
            data_dir: PathBuf::new(),
            file_prefix: String::new(),
        });
    }

    fn partial_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".partial")
            })
            .count()
    }

    #[test]
    fn test_partial_paths_are_unique() {
        let fx = fixture("");
        let dest = fx.driver.data_dir().join("abc");
        let a = fx.driver.partial_path(&dest);
        let b = fx.driver.partial_path(&dest);
        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(fx.driver.data_dir()));
        assert!(a.file_name().unwrap().to_string_lossy().starts_with("abc."));
    }

    #[tokio::test]
    async fn test_concurrent_copies_never_tear() {
        let fx = fixture("");
        std::fs::create_dir_all(fx.driver.data_dir()).unwrap();
        let big_a = vec![b'a'; 2 * 1024 * 1024];
        let big_b = vec![b'b'; 2 * 1024 * 1024];
        let src_a = fx.staging.join("a");
        let src_b = fx.staging.join("b");
        std::fs::write(&src_a, &big_a).unwrap();
        std::fs::write(&src_b, &big_b).unwrap();
        let dest = fx.driver.data_dir().join("same");

        let (ra, rb) = tokio::join!(
            fx.driver.copy_into_place(&src_a, &dest),
            fx.driver.copy_into_place(&src_b, &dest),
        );
        ra.unwrap();
        rb.unwrap();

        let stored = std::fs::read(&dest).unwrap();
        assert!(stored == big_a || stored == big_b, "object mixes both writers");
        assert_eq!(partial_files(fx.driver.data_dir()), 0);
    }

    #[tokio::test]
    async fn test_failed_copy_leaves_no_partial() {
        let fx = fixture("");
        std::fs::create_dir_all(fx.driver.data_dir()).unwrap();
        let dest = fx.driver.data_dir().join("gone");

        let err = fx
            .driver
            .copy_into_place(&fx.staging.join("missing"), &dest)
            .await;
        assert!(err.is_err());
        assert!(!dest.exists());
        assert_eq!(partial_files(fx.driver.data_dir()), 0);
    }
}
