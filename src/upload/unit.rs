use super::executor::{Backoff, TaskInfo, TaskUnit, UnitRunResult};
use super::{join_remote_path, UploadPolicy, UploadRequest, UploadStatistics, Uploader};
use crate::compress::{CompressStatistics, CompressionOptions, CompressionResult, CompressionTask};
use crate::utils::disk::SpaceQuery;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Packages one directory and hands the archive to an `Uploader`.
///
/// Every attempt recompresses from scratch, so a retry after a failed upload
/// never reuses a possibly truncated archive.
pub struct CompressUploadUnit {
    source_path: PathBuf,
    zip_path: PathBuf,
    save_path: String,
    options: CompressionOptions,

    uploader: Arc<dyn Uploader>,
    statistics: Option<Arc<CompressStatistics>>,
    space_query: Option<Arc<dyn SpaceQuery>>,

    parallel: usize,
    policy: UploadPolicy,
    no_rapid_upload: bool,
    delete_after_upload: bool,
    backoff: Backoff,

    // Totals go into `statistics` only once even when the unit is retried
    counted: bool,
    last_result: Option<CompressionResult>,
    last_upload: Option<Arc<UploadStatistics>>,
}

impl CompressUploadUnit {
    /// `save_path` is the remote directory; the archive file name is appended
    pub fn new(
        source_path: impl Into<PathBuf>,
        zip_path: impl Into<PathBuf>,
        save_path: impl Into<String>,
        uploader: Arc<dyn Uploader>,
    ) -> Self {
        Self {
            source_path: source_path.into(),
            zip_path: zip_path.into(),
            save_path: save_path.into(),
            options: CompressionOptions::default(),
            uploader,
            statistics: None,
            space_query: None,
            parallel: 1,
            policy: UploadPolicy::default(),
            no_rapid_upload: false,
            delete_after_upload: false,
            backoff: Backoff::default(),
            counted: false,
            last_result: None,
            last_upload: None,
        }
    }

    pub fn with_options(mut self, options: CompressionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_statistics(mut self, statistics: Arc<CompressStatistics>) -> Self {
        self.statistics = Some(statistics);
        self
    }

    pub fn with_space_query(mut self, query: Arc<dyn SpaceQuery>) -> Self {
        self.space_query = Some(query);
        self
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel.max(1);
        self
    }

    pub fn with_policy(mut self, policy: UploadPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_no_rapid_upload(mut self, no_rapid_upload: bool) -> Self {
        self.no_rapid_upload = no_rapid_upload;
        self
    }

    pub fn with_delete_after_upload(mut self, delete: bool) -> Self {
        self.delete_after_upload = delete;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn zip_path(&self) -> &Path {
        &self.zip_path
    }

    /// Full remote path of the archive
    pub fn remote_path(&self) -> String {
        let name = self
            .zip_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        join_remote_path(&self.save_path, &name)
    }

    /// Compression outcome of the most recent attempt
    pub fn last_result(&self) -> Option<&CompressionResult> {
        self.last_result.as_ref()
    }

    /// Transfer counters of the most recent upload attempt
    pub fn last_upload(&self) -> Option<&UploadStatistics> {
        self.last_upload.as_deref()
    }

    async fn compress(&self, info: &TaskInfo) -> anyhow::Result<CompressionResult> {
        let source = self.source_path.clone();
        let target = self.zip_path.clone();
        let options = self.options.clone();
        let query = self.space_query.clone();
        let id = info.id().to_string();

        let result = tokio::task::spawn_blocking(move || {
            let mut task = CompressionTask::new(source, target, options).with_progress(
                move |processed, total, path| {
                    debug!("[{}] compressing {}/{} {}", id, processed, total, path.display());
                },
            );
            if let Some(query) = query {
                task = task.with_space_query(query);
            }
            task.execute()
        })
        .await?;

        Ok(result)
    }

    fn record_statistics(&mut self, result: &CompressionResult) {
        if self.counted {
            return;
        }
        if let Some(stats) = &self.statistics {
            stats.add_total_size(result.total_size);
            stats.add_compressed_size(result.compressed_size);
            stats.add_file_count(result.total_files);
        }
        self.counted = true;
    }

    fn remove_archive(&self) {
        match std::fs::remove_file(&self.zip_path) {
            Ok(()) => debug!("Removed archive {}", self.zip_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove archive {}: {}", self.zip_path.display(), e),
        }
    }
}

#[async_trait]
impl TaskUnit for CompressUploadUnit {
    async fn run(&mut self, info: &TaskInfo) -> UnitRunResult {
        info!("[{}] compressing {}", info.id(), self.source_path.display());

        let result = match self.compress(info).await {
            Ok(result) => result,
            Err(e) => return UnitRunResult::fatal(e, "compression task aborted"),
        };

        let success = result.success;
        let error = result.error.clone();
        if success {
            self.record_statistics(&result);
        }
        self.last_result = Some(result);

        if !success {
            let err = match error {
                Some(e) => anyhow::Error::new(e),
                None => anyhow::anyhow!("compression failed"),
            };
            return UnitRunResult::fatal(err, "compression failed");
        }

        let statistics = Arc::new(UploadStatistics::new());
        self.last_upload = Some(statistics.clone());

        let request = UploadRequest {
            local_path: self.zip_path.clone(),
            save_path: self.remote_path(),
            parallel: self.parallel,
            policy: self.policy,
            no_rapid_upload: self.no_rapid_upload,
            statistics,
        };

        info!("[{}] uploading {} -> {}", info.id(), self.zip_path.display(), request.save_path);
        let verdict = self.uploader.upload(info, &request).await;

        if verdict.succeed && self.delete_after_upload {
            if let Err(e) = std::fs::remove_file(&self.zip_path) {
                error!("[{}] failed to delete {}: {}", info.id(), self.zip_path.display(), e);
            }
        }

        verdict
    }

    fn on_retry(&mut self, info: &TaskInfo, last: &UnitRunResult) {
        info!(
            "[{}] {} failed: {}, retry {}/{}",
            info.id(),
            self.source_path.display(),
            last,
            info.retry(),
            info.max_retry()
        );
    }

    fn on_success(&mut self, info: &TaskInfo, last: &UnitRunResult) {
        info!("[{}] {} done: {}", info.id(), self.source_path.display(), last.message);
    }

    fn on_failed(&mut self, info: &TaskInfo, last: &UnitRunResult) {
        error!("[{}] {} failed: {}", info.id(), self.source_path.display(), last);
        self.remove_archive();
    }

    fn retry_wait(&self, attempt: u32) -> Duration {
        self.backoff.wait(attempt)
    }

    fn label(&self) -> String {
        self.source_path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Fails retryably a fixed number of times, then succeeds
    struct FlakyUploader {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
        requests: Mutex<Vec<String>>,
    }

    impl FlakyUploader {
        fn new(failures: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Uploader for FlakyUploader {
        async fn upload(&self, _info: &TaskInfo, request: &UploadRequest) -> UnitRunResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push(request.save_path.clone());
            assert!(request.local_path.exists());

            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return UnitRunResult::retryable(anyhow::anyhow!("connection reset"), "upload failed");
            }
            request.statistics.add_uploaded(1);
            UnitRunResult::success("uploaded")
        }
    }

    fn source_tree() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        let src = dir.path().join("photos");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("a.jpg"), vec![1u8; 10]).unwrap();
        fs::write(src.join("b.jpg"), vec![2u8; 20]).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_run_compresses_then_uploads() {
        let dir = source_tree();
        let uploader = Arc::new(FlakyUploader::new(0));
        let stats = Arc::new(CompressStatistics::new());
        let mut unit = CompressUploadUnit::new(
            dir.path().join("photos"),
            dir.path().join("photos.zip"),
            "/backup/2024",
            uploader.clone(),
        )
        .with_statistics(stats.clone());

        let info = TaskInfo::new("1", 3);
        let result = unit.run(&info).await;

        assert!(result.succeed);
        assert_eq!(uploader.requests.lock().as_slice(), ["/backup/2024/photos.zip"]);
        assert_eq!(stats.file_count(), 2);
        assert_eq!(stats.total_size(), 30);
        assert_eq!(unit.last_upload().map(|s| s.uploaded()), Some(1));
        assert!(dir.path().join("photos.zip").exists());
    }

    #[tokio::test]
    async fn test_statistics_counted_once_across_attempts() {
        let dir = source_tree();
        let uploader = Arc::new(FlakyUploader::new(1));
        let stats = Arc::new(CompressStatistics::new());
        let mut unit = CompressUploadUnit::new(
            dir.path().join("photos"),
            dir.path().join("photos.zip"),
            "/",
            uploader.clone(),
        )
        .with_statistics(stats.clone());

        let info = TaskInfo::new("1", 3);
        let first = unit.run(&info).await;
        assert!(!first.succeed);
        assert!(first.need_retry);

        let second = unit.run(&info).await;
        assert!(second.succeed);
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 2);
        assert_eq!(stats.file_count(), 2);
        assert_eq!(stats.total_size(), 30);
    }

    #[tokio::test]
    async fn test_compression_failure_is_not_retryable() {
        let dir = tempdir().unwrap();
        let uploader = Arc::new(FlakyUploader::new(0));
        let mut unit = CompressUploadUnit::new(
            dir.path().join("missing"),
            dir.path().join("missing.zip"),
            "/",
            uploader.clone(),
        );

        let result = unit.run(&TaskInfo::new("1", 3)).await;

        assert!(!result.succeed);
        assert!(!result.need_retry);
        assert!(result.err.is_some());
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            unit.last_result().and_then(|r| r.error.as_ref()),
            Some(crate::error::CompressError::SourceNotExist(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_after_upload() {
        let dir = source_tree();
        let mut unit = CompressUploadUnit::new(
            dir.path().join("photos"),
            dir.path().join("photos.zip"),
            "/",
            Arc::new(FlakyUploader::new(0)),
        )
        .with_delete_after_upload(true);

        let result = unit.run(&TaskInfo::new("1", 0)).await;

        assert!(result.succeed);
        assert!(!dir.path().join("photos.zip").exists());
    }

    #[tokio::test]
    async fn test_on_failed_removes_archive() {
        let dir = source_tree();
        let mut unit = CompressUploadUnit::new(
            dir.path().join("photos"),
            dir.path().join("photos.zip"),
            "/",
            Arc::new(FlakyUploader::new(10)),
        );
        let info = TaskInfo::new("1", 0);

        let result = unit.run(&info).await;
        assert!(dir.path().join("photos.zip").exists());

        unit.on_failed(&info, &result);
        assert!(!dir.path().join("photos.zip").exists());
    }

    #[test]
    fn test_retry_wait_uses_backoff() {
        let unit = CompressUploadUnit::new("/src", "/src.zip", "/", Arc::new(FlakyUploader::new(0)))
            .with_backoff(Backoff::new(Duration::from_millis(10), Duration::from_millis(25)));
        assert_eq!(unit.retry_wait(1), Duration::from_millis(10));
        assert_eq!(unit.retry_wait(3), Duration::from_millis(25));
        assert_eq!(unit.label(), "/src");
        assert_eq!(unit.remote_path(), "/src.zip");
    }
}
