use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors decoding a chunk frame from the upload wire format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("frame truncated: needed {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("frame has {0} trailing bytes")]
    TrailingBytes(usize),

    #[error("invalid upload id: {0}")]
    InvalidId(String),

    #[error("chunk of {len} bytes at offset {offset} exceeds total size {total}")]
    OutOfBounds { offset: u64, len: u64, total: u64 },

    #[error("unknown frame flags: {0:#04x}")]
    UnknownFlags(u8),

    #[error("upload id of {0} bytes does not fit the frame")]
    IdTooLong(usize),

    #[error("payload of {0} bytes does not fit the frame")]
    PayloadTooLarge(usize),
}
