//! cdrop-files: the file-level service built on top of crypto, storage and
//! upload handling
//!
//! - [`MetadataStore`]: persistence contract for file records and E2E envelopes
//! - [`FileService`]: ingest, dedup, access rules, delivery, cleanup
//! - [`UploadPipeline`]: chunked uploads from first chunk to stored record

pub mod error;
pub mod metadata;
pub mod pipeline;
pub mod service;

pub use error::{FileError, FileResult};
pub use metadata::{JsonMetadataStore, MemoryMetadataStore, MetadataStore};
pub use pipeline::{BeginOutcome, UploadPipeline};
pub use service::{Delivery, FileService, NewFile};
