use cdrop_crypto::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload {0} already exists")]
    AlreadyExists(String),

    #[error("upload {0} not found")]
    NotFound(String),

    #[error("chunk out of order: expected offset {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("upload {0} already received its last chunk")]
    AlreadyFinalized(String),

    #[error("upload {0} has not received its last chunk")]
    NotFinalized(String),

    #[error("chunk ending at {end} exceeds declared size {declared}")]
    SizeExceeded { declared: u64, end: u64 },

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("file of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: u64, max: u64 },

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
