use thiserror::Error;

/// Per-operation crypto failures. Callers report these for the affected file
/// only.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("decryption failed: invalid key or corrupted data")]
    DecryptionFailed,

    #[error("encrypted stream is truncated")]
    Truncated,

    #[error("unsupported stream version {0}")]
    UnsupportedVersion(u8),

    #[error("stream exceeds the maximum segment count")]
    StreamTooLong,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("file key unwrapping failed: master key changed or key info corrupted")]
    UnwrapFailed,

    #[error("file is not encrypted")]
    NotEncrypted,

    #[error("invalid envelope: {0}")]
    Envelope(String),

    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Master key vault failures. The daemon treats these as fatal at startup.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("master key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("master password must not be empty")]
    EmptyPassword,

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("vault has not been initialised")]
    NotInitialized,

    #[error("sealing the master key failed")]
    Seal,

    #[error("unsealing the master key failed")]
    Unseal,
}
