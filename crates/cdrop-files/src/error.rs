use cdrop_core::types::DriverKind;
use cdrop_core::WireError;
use cdrop_crypto::CryptoError;
use cdrop_storage::StorageError;
use cdrop_upload::UploadError;

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("file expired: {0}")]
    Expired(String),

    #[error("password required")]
    PasswordRequired,

    #[error("wrong password")]
    WrongPassword,

    #[error("stored content missing for file {0}")]
    ContentMissing(String),

    #[error("no storage driver registered for {kind} bucket {bucket:?}")]
    NoDriver { kind: DriverKind, bucket: String },

    #[error("rate limit exceeded for {0}")]
    RateLimited(String),

    #[error("password hashing failed: {0}")]
    PasswordHash(String),

    #[error("metadata store error: {0}")]
    Metadata(String),

    #[error("invalid upload id: {0}")]
    InvalidId(#[from] WireError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FileError {
    /// Whether the error is the caller's fault rather than the server's.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            FileError::NotFound(_)
                | FileError::Expired(_)
                | FileError::PasswordRequired
                | FileError::WrongPassword
                | FileError::RateLimited(_)
                | FileError::InvalidId(_)
                | FileError::Upload(_)
        )
    }
}

pub type FileResult<T> = Result<T, FileError>;
