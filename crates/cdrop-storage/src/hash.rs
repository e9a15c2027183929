//! BLAKE3 content hashing and staged objects
//!
//! The hash of the bytes as stored is the object's identity, so it is
//! computed over ciphertext whenever the file is encrypted.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::StorageError;

/// Hash a byte slice in memory, as lowercase hex (64 chars).
pub fn hash_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Hash a file from disk with a 64 KiB streaming buffer.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Reject anything that is not a 64-char lowercase hex digest, so a hash can
/// be used as a file name or object key unchanged.
pub fn validate_hash(hash: &str) -> Result<(), StorageError> {
    let ok = hash.len() == 64
        && hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidHash(hash.to_string()))
    }
}

/// `Write` adapter hashing and counting everything that passes through.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: blake3::Hasher,
    len: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            len: 0,
        }
    }

    /// Returns the inner writer, the hex hash and the byte count.
    pub fn finalize(self) -> (W, String, u64) {
        (self.inner, self.hasher.finalize().to_hex().to_string(), self.len)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.len += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// A fully written file waiting to be handed to a driver.
#[derive(Debug, Clone)]
pub struct StagingFile {
    path: PathBuf,
    hash: String,
    len: u64,
}

impl StagingFile {
    /// Wrap a staged file whose hash and length are already known.
    pub fn new(path: impl Into<PathBuf>, hash: String, len: u64) -> Result<Self, StorageError> {
        validate_hash(&hash)?;
        Ok(Self {
            path: path.into(),
            hash,
            len,
        })
    }

    /// Hash an existing file on a blocking thread.
    pub async fn from_path(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let hash_path = path.clone();
        let hash = tokio::task::spawn_blocking(move || hash_file(&hash_path))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))??;
        let len = tokio::fs::metadata(&path).await?.len();
        Ok(Self { path, hash, len })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_bytes_hex() {
        let h = hash_bytes(b"hello");
        assert_eq!(h.len(), 64);
        assert_eq!(h, blake3::hash(b"hello").to_hex().to_string());
        assert!(validate_hash(&h).is_ok());
    }

    #[test]
    fn test_hash_file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        assert_eq!(hash_file(&path).unwrap(), hash_bytes(&data));
    }

    #[test]
    fn test_hashing_writer() {
        let mut w = HashingWriter::new(Vec::new());
        w.write_all(b"hello ").unwrap();
        w.write_all(b"world").unwrap();
        let (inner, hash, len) = w.finalize();

        assert_eq!(inner, b"hello world");
        assert_eq!(len, 11);
        assert_eq!(hash, hash_bytes(b"hello world"));
    }

    #[test]
    fn test_validate_hash() {
        assert!(validate_hash(&"a".repeat(64)).is_ok());
        assert!(validate_hash(&"A".repeat(64)).is_err());
        assert!(validate_hash("../etc/passwd").is_err());
        assert!(validate_hash(&"a".repeat(63)).is_err());
    }

    #[tokio::test]
    async fn test_staging_file_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staged");
        std::fs::write(&path, b"abc").unwrap();

        let staged = StagingFile::from_path(&path).await.unwrap();
        assert_eq!(staged.len(), 3);
        assert_eq!(staged.hash(), hash_bytes(b"abc"));
        assert_eq!(staged.path(), path.as_path());
    }
}
