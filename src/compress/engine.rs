use super::scanner::{self, absolute_path};
use super::{CompressionOptions, CompressionResult};
use crate::error::{CompressError, Result};
use crate::utils::disk::{self, FsSpaceQuery, SpaceQuery};
use parking_lot::RwLock;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Called after every archived file with (processed, total, current path)
pub type ProgressFn = Box<dyn Fn(u64, u64, &Path) + Send + Sync>;

// Files at or above this size need zip64 headers
const LARGE_FILE_THRESHOLD: u64 = u32::MAX as u64;

/// Packages one directory tree into one ZIP archive.
///
/// Counters are atomics so `progress()` and `speed()` can be polled from
/// another thread while `execute()` runs. A task is meant to be executed
/// once; retries build a new task.
pub struct CompressionTask {
    source_path: PathBuf,
    target_path: PathBuf,
    options: CompressionOptions,

    total_files: AtomicU64,
    total_size: AtomicU64,
    processed_files: AtomicU64,
    compressed_size: AtomicU64,

    started_at: RwLock<Option<Instant>>,
    finished_at: RwLock<Option<Instant>>,

    on_progress: Option<ProgressFn>,
    space_query: Arc<dyn SpaceQuery>,
    open_source: fn(&Path) -> io::Result<File>,
}

impl CompressionTask {
    pub fn new(
        source_path: impl Into<PathBuf>,
        target_path: impl Into<PathBuf>,
        options: CompressionOptions,
    ) -> Self {
        Self {
            source_path: source_path.into(),
            target_path: target_path.into(),
            options,
            total_files: AtomicU64::new(0),
            total_size: AtomicU64::new(0),
            processed_files: AtomicU64::new(0),
            compressed_size: AtomicU64::new(0),
            started_at: RwLock::new(None),
            finished_at: RwLock::new(None),
            on_progress: None,
            space_query: Arc::new(FsSpaceQuery),
            open_source: open_file,
        }
    }

    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64, u64, &Path) + Send + Sync + 'static,
    {
        self.on_progress = Some(Box::new(callback));
        self
    }

    /// Replace the free space query used by the preflight check
    pub fn with_space_query(mut self, query: Arc<dyn SpaceQuery>) -> Self {
        self.space_query = query;
        self
    }

    #[cfg(test)]
    fn with_opener(mut self, open: fn(&Path) -> io::Result<File>) -> Self {
        self.open_source = open;
        self
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    pub fn options(&self) -> &CompressionOptions {
        &self.options
    }

    /// (processed files, total files, percentage)
    pub fn progress(&self) -> (u64, u64, f64) {
        let processed = self.processed_files.load(Ordering::Acquire);
        let total = self.total_files.load(Ordering::Acquire);
        (processed, total, crate::utils::format::percentage(processed, total))
    }

    pub fn elapsed(&self) -> Duration {
        let started = match *self.started_at.read() {
            Some(started) => started,
            None => return Duration::ZERO,
        };
        match *self.finished_at.read() {
            Some(finished) => finished.duration_since(started),
            None => started.elapsed(),
        }
    }

    /// Bytes packaged per second
    pub fn speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        (self.compressed_size.load(Ordering::Acquire) as f64 / elapsed) as u64
    }

    pub fn execute(&self) -> CompressionResult {
        let result = CompressionResult::new(&self.source_path, &self.target_path);

        let metadata = match std::fs::metadata(&self.source_path) {
            Ok(metadata) => metadata,
            Err(e) => {
                return result.failed(CompressError::from_source_io(self.source_path.clone(), e))
            }
        };
        if !metadata.is_dir() {
            return result.failed(CompressError::SourceNotDirectory(self.source_path.clone()));
        }

        let start = Instant::now();
        *self.started_at.write() = Some(start);

        let outcome = self.run();

        let end = Instant::now();
        *self.finished_at.write() = Some(end);

        let mut result = match outcome {
            Ok(compressed_size) => CompressionResult {
                success: true,
                total_files: self.total_files.load(Ordering::Acquire),
                total_size: self.total_size.load(Ordering::Acquire),
                compressed_size,
                ..result
            },
            Err(e) => result.failed(e),
        };
        result.duration = end.duration_since(start);

        if result.success {
            info!(
                "Compressed {} -> {} ({} files, {} bytes in {:?})",
                self.source_path.display(),
                self.target_path.display(),
                result.total_files,
                result.compressed_size,
                result.duration
            );
        }

        result
    }

    fn run(&self) -> Result<u64> {
        // The target may live inside the source; it must not pack itself
        let skip = scanner::archive_location(&self.target_path);
        let summary =
            scanner::scan_tree(&self.source_path, self.options.include_hidden, skip.as_deref())?;
        self.total_files.store(summary.total_files, Ordering::Release);
        self.total_size.store(summary.total_size, Ordering::Release);

        if summary.total_files == 0 {
            return Err(CompressError::EmptyDirectory(self.source_path.clone()));
        }

        self.check_disk_space(summary.total_size)?;

        let file = File::create(&self.target_path).map_err(|e| {
            if e.kind() == io::ErrorKind::PermissionDenied {
                CompressError::PermissionDenied(self.target_path.clone())
            } else {
                CompressError::CreateArchiveFailed {
                    path: self.target_path.clone(),
                    source: Arc::new(e),
                }
            }
        })?;

        match self.write_archive(file, skip) {
            Ok(written) => Ok(written),
            Err(e) => {
                // Don't leave a truncated archive behind
                if let Err(remove_err) = std::fs::remove_file(&self.target_path) {
                    warn!(
                        "Failed to remove partial archive {}: {}",
                        self.target_path.display(),
                        remove_err
                    );
                }
                Err(e)
            }
        }
    }

    fn check_disk_space(&self, required: u64) -> Result<()> {
        let dir = disk::target_dir(&self.target_path);
        match self.space_query.available_space(dir) {
            Some(available) if required > available => {
                Err(CompressError::DiskSpaceInsufficient { required, available })
            }
            Some(_) => Ok(()),
            None => {
                debug!("Free space unknown for {}, skipping preflight", dir.display());
                Ok(())
            }
        }
    }

    fn write_archive(&self, file: File, skip: Option<PathBuf>) -> Result<u64> {
        let mut writer = ZipWriter::new(BufWriter::new(file));
        let root_name = archive_root_name(&self.source_path);
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(self.options.compression_level.clamp(1, 9)));

        let mut processed = 0u64;
        let mut written = 0u64;
        // Directory with nothing archived under it yet: (entry name, depth)
        let mut pending_dir: Option<(String, usize)> = None;

        for entry in scanner::walk_eligible(&self.source_path, self.options.include_hidden, skip) {
            let entry = entry.map_err(|e| CompressError::compress_failed(io::Error::from(e)))?;
            if entry.depth() == 0 {
                continue;
            }

            if let Some((name, depth)) = pending_dir.take() {
                if entry.depth() <= depth {
                    writer.add_directory(name, options).map_err(zip_error)?;
                } else if !entry.file_type().is_dir() {
                    // A child file may still be skipped; keep waiting
                    pending_dir = Some((name, depth));
                }
            }

            let relative = entry
                .path()
                .strip_prefix(&self.source_path)
                .map_err(|e| CompressError::compress_failed(io::Error::new(io::ErrorKind::Other, e)))?;
            let name = entry_name(&root_name, relative);

            if entry.file_type().is_dir() {
                pending_dir = Some((format!("{}/", name), entry.depth()));
                continue;
            }

            let mut source = match (self.open_source)(entry.path()) {
                Ok(source) => source,
                Err(e) if is_skippable(&e) => {
                    warn!("Skipping unreadable file: {}", entry.path().display());
                    continue;
                }
                Err(e) => return Err(CompressError::compress_failed(e)),
            };

            let size = source
                .metadata()
                .map(|m| m.len())
                .map_err(CompressError::compress_failed)?;
            let file_options = options.large_file(size >= LARGE_FILE_THRESHOLD);

            writer.start_file(name, file_options).map_err(zip_error)?;
            pending_dir = None;
            let copied = io::copy(&mut source, &mut writer).map_err(|e| {
                CompressError::compress_failed(io::Error::new(
                    e.kind(),
                    format!("writing {}: {}", entry.path().display(), e),
                ))
            })?;

            processed += 1;
            written += copied;
            self.update_progress(processed, written, entry.path());
        }

        if let Some((name, _)) = pending_dir.take() {
            writer.add_directory(name, options).map_err(zip_error)?;
        }

        let mut inner = writer.finish().map_err(zip_error)?;
        inner.flush().map_err(CompressError::compress_failed)?;

        Ok(written)
    }

    fn update_progress(&self, processed: u64, written: u64, current: &Path) {
        self.processed_files.store(processed, Ordering::Release);
        self.compressed_size.store(written, Ordering::Release);

        if let Some(callback) = &self.on_progress {
            callback(processed, self.total_files.load(Ordering::Acquire), current);
        }
    }
}

fn open_file(path: &Path) -> io::Result<File> {
    File::open(path)
}

// Unreadable files are left out of the archive instead of failing it
fn is_skippable(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::PermissionDenied
}

fn zip_error(err: zip::result::ZipError) -> CompressError {
    let io_err = match err {
        zip::result::ZipError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    };
    CompressError::compress_failed(io_err)
}

// Base name of the source; every entry lives under it
fn archive_root_name(source: &Path) -> String {
    let absolute = absolute_path(source).unwrap_or_else(|_| source.to_path_buf());
    absolute
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string())
}

/// `<root>/<relative>` with `/` separators on every platform
fn entry_name(root: &str, relative: &Path) -> String {
    let mut name = root.to_string();
    for component in relative.components() {
        name.push('/');
        name.push_str(&component.as_os_str().to_string_lossy());
    }
    name
}

fn base_name(source: &Path) -> String {
    archive_root_name(source)
}

/// `<base>.zip`. Two sources with the same base name collide; callers that
/// package several directories must disambiguate.
pub fn generate_simple_zip_name(source: &Path) -> String {
    format!("{}.zip", base_name(source))
}

/// `<base>_<YYYYmmdd_HHMMSS>.zip`
pub fn generate_unique_zip_name(source: &Path) -> String {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    format!("{}_{}.zip", base_name(source), timestamp)
}
