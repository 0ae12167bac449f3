//! Error types for dirzip-upload
//!
//! Compression failures are classified so callers can tell a missing source
//! from a full disk without string matching. Task units and the binary wrap
//! these in `anyhow::Error` once they leave the library.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Errors produced while packaging a single directory
#[derive(Error, Debug, Clone)]
pub enum CompressError {
    #[error("source path does not exist: {}", .0.display())]
    SourceNotExist(PathBuf),

    #[error("source path is not a directory: {}", .0.display())]
    SourceNotDirectory(PathBuf),

    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("insufficient disk space: need {required} bytes, {available} available")]
    DiskSpaceInsufficient { required: u64, available: u64 },

    #[error("failed to create archive {}: {source}", path.display())]
    CreateArchiveFailed {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("compression failed: {source}")]
    CompressFailed {
        #[source]
        source: Arc<io::Error>,
    },

    #[error("directory is empty, nothing to compress: {}", .0.display())]
    EmptyDirectory(PathBuf),

    #[error("failed to scan {}: {source}", path.display())]
    ScanFailed {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },
}

impl CompressError {
    /// Classify a failed `stat` of the source directory
    pub fn from_source_io(path: PathBuf, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => CompressError::SourceNotExist(path),
            io::ErrorKind::PermissionDenied => CompressError::PermissionDenied(path),
            _ => CompressError::ScanFailed {
                path,
                source: Arc::new(err),
            },
        }
    }

    pub fn compress_failed(err: io::Error) -> Self {
        CompressError::CompressFailed {
            source: Arc::new(err),
        }
    }
}

/// Errors produced by the sequential compression queue
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue is not idle")]
    AlreadyRunning,

    #[error("invalid path {}: {source}", path.display())]
    InvalidPath {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to list sub-directories: {0}")]
    Scan(#[from] CompressError),
}

pub type Result<T> = std::result::Result<T, CompressError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_io_classification() {
        let p = PathBuf::from("/nope");
        let err = CompressError::from_source_io(p.clone(), io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, CompressError::SourceNotExist(_)));

        let err = CompressError::from_source_io(p.clone(), io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, CompressError::PermissionDenied(_)));

        let err = CompressError::from_source_io(p, io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(matches!(err, CompressError::ScanFailed { .. }));
    }

    #[test]
    fn test_compress_failed_keeps_cause() {
        use std::error::Error as _;
        let err = CompressError::compress_failed(io::Error::new(io::ErrorKind::Other, "disk gone"));
        assert!(err.to_string().contains("disk gone"));
        assert!(err.source().is_some());
    }
}
