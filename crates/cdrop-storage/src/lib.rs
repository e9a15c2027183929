//! cdrop-storage: content-addressable object storage
//!
//! Objects are keyed by the lowercase hex BLAKE3 hash of their stored bytes.
//! Two drivers implement [`StorageDriver`]: [`LocalDriver`] (a directory on
//! disk) and [`RemoteDriver`] (any [`ObjectStore`], in production an OpenDAL
//! S3 operator). [`ActiveDriver`] selects which one receives new uploads.

pub mod active;
pub mod driver;
pub mod error;
pub mod hash;
pub mod health;
pub mod local;
pub mod object;
pub mod operator;
pub mod remote;

pub use active::ActiveDriver;
pub use driver::{build_driver, ContentMeta, FileHandle, ServeTarget, StorageDriver, StoreOutcome};
pub use error::StorageError;
pub use hash::{hash_bytes, hash_file, HashingWriter, StagingFile};
pub use health::check_health;
pub use local::LocalDriver;
pub use object::{ObjectStore, OpendalStore};
pub use operator::build_operator;
pub use remote::RemoteDriver;
