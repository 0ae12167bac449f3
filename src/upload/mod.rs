pub mod executor;
pub mod local_store;
pub mod unit;

pub use executor::{Backoff, FailedUnit, TaskExecutor, TaskInfo, TaskUnit, UnitRunResult};
pub use local_store::LocalStore;
pub use unit::CompressUploadUnit;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What to do when the remote path already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadPolicy {
    /// Keep the remote file
    Skip,
    /// Replace the remote file
    #[default]
    Overwrite,
    /// Replace only when content differs
    Rsync,
}

impl FromStr for UploadPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(UploadPolicy::Skip),
            "overwrite" => Ok(UploadPolicy::Overwrite),
            "rsync" => Ok(UploadPolicy::Rsync),
            other => Err(anyhow::anyhow!(
                "unknown upload policy '{}', expected skip, overwrite or rsync",
                other
            )),
        }
    }
}

impl fmt::Display for UploadPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UploadPolicy::Skip => "skip",
            UploadPolicy::Overwrite => "overwrite",
            UploadPolicy::Rsync => "rsync",
        };
        f.write_str(s)
    }
}

/// Per-upload transfer counters
#[derive(Debug)]
pub struct UploadStatistics {
    uploaded: AtomicU64,
    start_time: RwLock<Instant>,
}

impl UploadStatistics {
    pub fn new() -> Self {
        Self {
            uploaded: AtomicU64::new(0),
            start_time: RwLock::new(Instant::now()),
        }
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn start_timer(&self) {
        *self.start_time.write() = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.read().elapsed()
    }

    /// Bytes per second since the timer started
    pub fn speed(&self) -> u64 {
        let secs = self.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0;
        }
        (self.uploaded() as f64 / secs) as u64
    }
}

impl Default for UploadStatistics {
    fn default() -> Self {
        Self::new()
    }
}

/// One archive handed to an upload engine
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub local_path: PathBuf,
    /// Remote destination, `/`-separated
    pub save_path: String,
    pub parallel: usize,
    pub policy: UploadPolicy,
    pub no_rapid_upload: bool,
    pub statistics: Arc<UploadStatistics>,
}

/// Upload engine seam. Implementations decide success, retry and messages.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, info: &TaskInfo, request: &UploadRequest) -> UnitRunResult;
}

/// Join a remote directory and a file name into a clean absolute remote path
pub fn join_remote_path(dir: &str, name: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in dir.split('/').chain(name.split('/')) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}
