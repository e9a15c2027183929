//! Storage driver contract

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cdrop_core::config::{DriverConfig, StorageConfig};
use cdrop_core::types::DriverKind;

use crate::error::StorageError;
use crate::hash::StagingFile;
use crate::local::LocalDriver;
use crate::remote::RemoteDriver;

/// Descriptive attributes passed along with a staged object
#[derive(Debug, Clone, Default)]
pub struct ContentMeta {
    pub file_name: String,
    pub content_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The staged bytes became a new object
    Stored,
    /// An object of the same hash and length already existed; staging was dropped
    Deduplicated,
}

/// Location of a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileHandle {
    Local { path: PathBuf, len: u64 },
    Remote { bucket: String, key: String, len: u64 },
}

impl FileHandle {
    pub fn len(&self) -> u64 {
        match self {
            FileHandle::Local { len, .. } | FileHandle::Remote { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How a download should be answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeTarget {
    /// Stream the object through the server
    Proxy(FileHandle),
    /// Send the client to a presigned URL
    Redirect { url: String },
}

/// A backend holding content objects keyed by hash.
///
/// Implementations are shared across tasks and must tolerate concurrent
/// stores of the same hash.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    fn kind(&self) -> DriverKind;

    fn name(&self) -> &str;

    /// Bucket for remote drivers, empty for local ones
    fn bucket(&self) -> &str {
        ""
    }

    async fn is_available(&self) -> bool;

    /// Move a staged object into the backend under its hash. The staging file
    /// is consumed in either outcome.
    async fn store(
        &self,
        staged: StagingFile,
        meta: &ContentMeta,
    ) -> Result<StoreOutcome, StorageError>;

    async fn file_exists(&self, hash: &str) -> Result<bool, StorageError>;

    /// Fails with [`StorageError::NotFound`] if no object has this hash.
    async fn get_file(&self, hash: &str) -> Result<FileHandle, StorageError>;

    async fn serve(&self, hash: &str, encrypted: bool) -> Result<ServeTarget, StorageError>;

    /// Copy the object into a local file, returning the byte count.
    async fn download_to(&self, hash: &str, dest: &Path) -> Result<u64, StorageError>;

    /// Remove the object. Removing a missing object is not an error.
    async fn delete(&self, hash: &str) -> Result<(), StorageError>;
}

impl std::fmt::Debug for dyn StorageDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageDriver")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}

/// Construct the driver selected by config.
///
/// # Panics
///
/// Panics if the selected driver's config is structurally invalid (empty
/// data directory or bucket).
pub fn build_driver(cfg: &StorageConfig) -> Result<Arc<dyn StorageDriver>, StorageError> {
    match &cfg.driver {
        DriverConfig::Local(local) => Ok(Arc::new(LocalDriver::new(local))),
        DriverConfig::S3(s3) => Ok(Arc::new(RemoteDriver::new(
            s3,
            cfg.serve_policy,
            Duration::from_secs(cfg.presign_ttl_secs),
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdrop_core::config::{LocalConfig, S3Config};

    #[test]
    fn test_build_local_driver() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StorageConfig {
            driver: DriverConfig::Local(LocalConfig {
                data_dir: dir.path().to_path_buf(),
                file_prefix: String::new(),
            }),
            ..Default::default()
        };
        let driver = build_driver(&cfg).unwrap();
        assert_eq!(driver.kind(), DriverKind::Local);
        assert_eq!(driver.bucket(), "");
    }

    #[test]
    fn test_build_s3_driver() {
        let cfg = StorageConfig {
            driver: DriverConfig::S3(S3Config {
                bucket: "drops".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let driver = build_driver(&cfg).unwrap();
        assert_eq!(driver.kind(), DriverKind::S3);
        assert_eq!(driver.bucket(), "drops");
        assert!(format!("{:?}", driver.as_ref()).contains("S3"));
    }

    #[test]
    fn test_build_s3_driver_rejects_insecure_endpoint() {
        let cfg = StorageConfig {
            driver: DriverConfig::S3(S3Config {
                endpoint: "http://minio:9000".into(),
                enforce_tls: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(build_driver(&cfg), Err(StorageError::Config(_))));
    }
}
