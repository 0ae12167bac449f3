use async_trait::async_trait;
use dirzip_upload::compress::CompressStatistics;
use dirzip_upload::upload::{
    Backoff, CompressUploadUnit, LocalStore, TaskExecutor, TaskInfo, UnitRunResult, UploadRequest,
    Uploader,
};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

/// Fails the first `fail_first` calls retryably, then delegates to a `LocalStore`
struct Unreliable {
    inner: LocalStore,
    fail_first: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl Uploader for Unreliable {
    async fn upload(&self, info: &TaskInfo, request: &UploadRequest) -> UnitRunResult {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            return UnitRunResult::retryable(anyhow::anyhow!("network down"), "upload failed");
        }
        self.inner.upload(info, request).await
    }
}

fn fast_backoff() -> Backoff {
    Backoff::new(Duration::from_millis(1), Duration::from_millis(5))
}

fn make_source(root: &Path, name: &str, files: &[(&str, usize)]) -> std::path::PathBuf {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    for (file, size) in files {
        fs::write(dir.join(file), vec![b'z'; *size]).unwrap();
    }
    dir
}

#[tokio::test]
async fn test_retryable_upload_recompresses_and_succeeds() {
    let dir = tempdir().unwrap();
    let src = make_source(dir.path(), "music", &[("a.flac", 100), ("b.flac", 200)]);
    let uploader = Arc::new(Unreliable {
        inner: LocalStore::new(dir.path().join("store")),
        fail_first: 2,
        calls: AtomicUsize::new(0),
    });
    let stats = Arc::new(CompressStatistics::new());

    let unit = CompressUploadUnit::new(&src, dir.path().join("music.zip"), "/backup", uploader.clone())
        .with_statistics(stats.clone())
        .with_backoff(fast_backoff());

    let mut executor = TaskExecutor::new();
    executor.append(Box::new(unit), 3);
    executor.execute().await;

    assert!(executor.failed_units().is_empty());
    assert_eq!(uploader.calls.load(Ordering::SeqCst), 3);
    assert!(dir.path().join("store/backup/music.zip").is_file());
    // Retries do not double count
    assert_eq!(stats.file_count(), 2);
    assert_eq!(stats.total_size(), 300);
}

#[tokio::test]
async fn test_exhausted_retries_remove_archive() {
    let dir = tempdir().unwrap();
    let src = make_source(dir.path(), "video", &[("clip.mp4", 50)]);
    let uploader = Arc::new(Unreliable {
        inner: LocalStore::new(dir.path().join("store")),
        fail_first: usize::MAX,
        calls: AtomicUsize::new(0),
    });
    let zip_path = dir.path().join("video.zip");

    let unit = CompressUploadUnit::new(&src, &zip_path, "/", uploader.clone()).with_backoff(fast_backoff());

    let mut executor = TaskExecutor::new();
    executor.append(Box::new(unit), 2);
    executor.execute().await;

    assert_eq!(uploader.calls.load(Ordering::SeqCst), 3);
    let failed = executor.failed_units();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].info.id(), "1");
    assert_eq!(failed[0].unit.label(), src.display().to_string());
    assert!(!zip_path.exists());
}

#[tokio::test]
async fn test_compression_failure_is_not_retried() {
    let dir = tempdir().unwrap();
    let empty = dir.path().join("empty");
    fs::create_dir(&empty).unwrap();
    let uploader = Arc::new(Unreliable {
        inner: LocalStore::new(dir.path().join("store")),
        fail_first: 0,
        calls: AtomicUsize::new(0),
    });

    let unit = CompressUploadUnit::new(&empty, dir.path().join("empty.zip"), "/", uploader.clone())
        .with_backoff(fast_backoff());

    let mut executor = TaskExecutor::new();
    let info = executor.append(Box::new(unit), 5);
    executor.execute().await;

    assert_eq!(uploader.calls.load(Ordering::SeqCst), 0);
    let failed = executor.failed_units();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].info.id(), info.id());
    assert_eq!(failed[0].info.retry(), 0);
}

#[tokio::test]
async fn test_rapid_upload_of_known_content() {
    let dir = tempdir().unwrap();
    let store = Arc::new(LocalStore::new(dir.path().join("store")));
    let archive = dir.path().join("data.zip");
    fs::write(&archive, b"zip bytes").unwrap();

    let request = |save_path: &str| UploadRequest {
        local_path: archive.clone(),
        save_path: save_path.to_string(),
        parallel: 1,
        policy: Default::default(),
        no_rapid_upload: false,
        statistics: Arc::new(Default::default()),
    };

    let first = request("/a/data.zip");
    assert!(store.upload(&TaskInfo::new("1", 0), &first).await.succeed);
    assert_eq!(first.statistics.uploaded(), 9);

    let second = request("/b/data.zip");
    let result = store.upload(&TaskInfo::new("2", 0), &second).await;
    assert!(result.succeed);
    assert_eq!(result.message, "rapid uploaded");
    assert_eq!(second.statistics.uploaded(), 0);
    assert_eq!(fs::read(dir.path().join("store/b/data.zip")).unwrap(), b"zip bytes");
}

#[tokio::test]
async fn test_parallel_units_share_statistics() {
    let dir = tempdir().unwrap();
    let store = Arc::new(LocalStore::new(dir.path().join("store")));
    let stats = Arc::new(CompressStatistics::new());
    let mut executor = TaskExecutor::new();

    for i in 0..4 {
        let src = make_source(dir.path(), &format!("src{}", i), &[("f", 10 * (i + 1))]);
        let unit = CompressUploadUnit::new(&src, dir.path().join(format!("src{}.zip", i)), "/all", store.clone())
            .with_statistics(stats.clone())
            .with_delete_after_upload(true);
        executor.append(Box::new(unit), 1);
    }
    executor.set_parallel(2);
    executor.execute().await;

    assert!(executor.failed_units().is_empty());
    assert_eq!(stats.file_count(), 4);
    assert_eq!(stats.total_size(), 100);
    for i in 0..4 {
        assert!(dir.path().join(format!("store/all/src{}.zip", i)).is_file());
        assert!(!dir.path().join(format!("src{}.zip", i)).exists());
    }
}
