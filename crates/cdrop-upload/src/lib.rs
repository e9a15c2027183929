//! cdrop-upload: server-side handling of uploads in flight
//!
//! - [`Assembler`]: sequential chunk intake, encrypting on the fly
//! - [`StatusTable`]: monotonic per-upload processing status
//! - [`Publisher`]: live fan-out of status and download events to subscribers
//! - [`RateLimiter`]: per-key token buckets with idle eviction
//! - [`sweeper`]: cancellable periodic maintenance tasks

pub mod assembler;
pub mod error;
pub mod events;
pub mod limits;
pub mod status;
pub mod sweeper;

pub use assembler::{Assembler, CompletedUpload};
pub use error::UploadError;
pub use events::{Event, Frame, Publisher, Subscription};
pub use limits::RateLimiter;
pub use status::StatusTable;
