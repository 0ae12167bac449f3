//! Directory-to-ZIP packaging with a retryable compress-and-upload pipeline.
//!
//! `compress` turns directory trees into archives, either one at a time or
//! through a pausable `TaskQueue`. `upload` drives `CompressUploadUnit`s
//! through a retrying `TaskExecutor` into any `Uploader`.

pub mod compress;
pub mod error;
pub mod upload;
pub mod utils;

pub use compress::{CompressStatistics, CompressionOptions, CompressionResult, CompressionTask, TaskQueue};
pub use error::{CompressError, QueueError};
pub use upload::{CompressUploadUnit, LocalStore, TaskExecutor, Uploader};
