pub mod engine;
pub mod queue;
pub mod scanner;
pub mod statistics;

pub use engine::{generate_simple_zip_name, generate_unique_zip_name, CompressionTask};
pub use queue::{QueueEvent, QueueHandle, QueueItem, QueueObserver, QueueStatus, TaskQueue};
pub use scanner::{get_sub_directories, select_directories};
pub use statistics::CompressStatistics;

use crate::error::CompressError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_COMPRESSION_LEVEL: i64 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionOptions {
    /// Directory selection depth: 0 = the path itself, 1 = its children, <0 = unlimited
    pub depth: i32,
    pub include_hidden: bool,
    /// Deflate level, clamped to 1..=9 when the archive is written
    pub compression_level: i64,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            depth: -1,
            include_hidden: false,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

/// Outcome of one `CompressionTask::execute`
#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub success: bool,
    pub source_path: PathBuf,
    pub target_path: PathBuf,
    pub total_files: u64,
    pub total_size: u64,
    /// Uncompressed bytes actually written into the archive
    pub compressed_size: u64,
    pub duration: Duration,
    pub error: Option<CompressError>,
}

impl CompressionResult {
    fn new(source_path: &Path, target_path: &Path) -> Self {
        Self {
            success: false,
            source_path: source_path.to_path_buf(),
            target_path: target_path.to_path_buf(),
            total_files: 0,
            total_size: 0,
            compressed_size: 0,
            duration: Duration::ZERO,
            error: None,
        }
    }

    fn failed(mut self, error: CompressError) -> Self {
        self.success = false;
        self.error = Some(error);
        self
    }
}
