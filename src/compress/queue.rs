use super::engine::{generate_simple_zip_name, generate_unique_zip_name, CompressionTask};
use super::scanner::{absolute_path, get_sub_directories};
use super::{CompressionOptions, CompressionResult};
use crate::error::QueueError;
use crate::utils::disk::{FsSpaceQuery, SpaceQuery};
use crate::utils::format::{format_size, percentage};
use crossbeam_channel::Sender;
use parking_lot::RwLock;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl QueueStatus {
    fn as_u8(self) -> u8 {
        match self {
            QueueStatus::Idle => 0,
            QueueStatus::Running => 1,
            QueueStatus::Paused => 2,
            QueueStatus::Stopped => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => QueueStatus::Running,
            2 => QueueStatus::Paused,
            3 => QueueStatus::Stopped,
            _ => QueueStatus::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Running => "running",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct QueueItem {
    /// 1-based position in the queue
    pub id: usize,
    pub source_path: PathBuf,
    pub target_path: PathBuf,
    pub options: CompressionOptions,
    pub result: Option<CompressionResult>,
    pub status: ItemStatus,
    pub retry_count: u32,
}

/// Receives queue lifecycle notifications on the queue's own thread.
///
/// A slow observer stalls the queue.
pub trait QueueObserver: Send + Sync {
    fn on_task_start(&self, _item: &QueueItem) {}

    fn on_task_progress(&self, _item: &QueueItem, _processed: u64, _total: u64, _current: &Path) {}

    /// Fires after every item, successful or not
    fn on_task_complete(&self, _item: &QueueItem) {}

    /// Fires once when every item has been run; not fired after `stop()`
    fn on_queue_complete(&self, _items: &[QueueItem]) {}
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    TaskStarted(QueueItem),
    TaskProgress {
        item_id: usize,
        source_path: PathBuf,
        processed: u64,
        total: u64,
        current: PathBuf,
    },
    TaskCompleted(QueueItem),
    QueueCompleted(Vec<QueueItem>),
}

// Event-channel form of the observer; a disconnected receiver is ignored
impl QueueObserver for Sender<QueueEvent> {
    fn on_task_start(&self, item: &QueueItem) {
        let _ = self.send(QueueEvent::TaskStarted(item.clone()));
    }

    fn on_task_progress(&self, item: &QueueItem, processed: u64, total: u64, current: &Path) {
        let _ = self.send(QueueEvent::TaskProgress {
            item_id: item.id,
            source_path: item.source_path.clone(),
            processed,
            total,
            current: current.to_path_buf(),
        });
    }

    fn on_task_complete(&self, item: &QueueItem) {
        let _ = self.send(QueueEvent::TaskCompleted(item.clone()));
    }

    fn on_queue_complete(&self, items: &[QueueItem]) {
        let _ = self.send(QueueEvent::QueueCompleted(items.to_vec()));
    }
}

/// Cloneable control over a queue's status word, usable from any thread
#[derive(Debug, Clone)]
pub struct QueueHandle {
    status: Arc<AtomicU8>,
}

impl QueueHandle {
    fn new() -> Self {
        Self {
            status: Arc::new(AtomicU8::new(QueueStatus::Idle.as_u8())),
        }
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Running -> Paused
    pub fn pause(&self) -> bool {
        self.transition(QueueStatus::Running, QueueStatus::Paused)
    }

    /// Paused -> Running
    pub fn resume(&self) -> bool {
        self.transition(QueueStatus::Paused, QueueStatus::Running)
    }

    /// Running or Paused -> Stopped. Takes effect at the next item boundary.
    pub fn stop(&self) -> bool {
        self.status
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                match QueueStatus::from_u8(current) {
                    QueueStatus::Running | QueueStatus::Paused => {
                        Some(QueueStatus::Stopped.as_u8())
                    }
                    _ => None,
                }
            })
            .is_ok()
    }

    fn transition(&self, from: QueueStatus, to: QueueStatus) -> bool {
        self.status
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn finish(&self) {
        self.status.store(QueueStatus::Idle.as_u8(), Ordering::SeqCst);
    }
}

// Returns the queue to Idle however the run loop exits
struct IdleGuard<'a>(&'a QueueHandle);

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Stopped,
}

/// Runs compression tasks one at a time, in insertion order.
pub struct TaskQueue {
    items: RwLock<Vec<QueueItem>>,
    handle: QueueHandle,
    // Stored for callers; execution is always serial
    max_concurrent: usize,
    observer: Option<Arc<dyn QueueObserver>>,
    space_query: Arc<dyn SpaceQuery>,
}

impl TaskQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            items: RwLock::new(Vec::new()),
            handle: QueueHandle::new(),
            max_concurrent: max_concurrent.max(1),
            observer: None,
            space_query: Arc::new(FsSpaceQuery),
        }
    }

    pub fn set_observer(&mut self, observer: Arc<dyn QueueObserver>) {
        self.observer = Some(observer);
    }

    pub fn take_observer(&mut self) -> Option<Arc<dyn QueueObserver>> {
        self.observer.take()
    }

    pub fn set_space_query(&mut self, query: Arc<dyn SpaceQuery>) {
        self.space_query = query;
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    pub fn status(&self) -> QueueStatus {
        self.handle.status()
    }

    pub fn pause(&self) -> bool {
        self.handle.pause()
    }

    pub fn resume(&self) -> bool {
        self.handle.resume()
    }

    pub fn stop(&self) -> bool {
        self.handle.stop()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Queue `source` for compression into `target`.
    ///
    /// Without a target the archive is named after the source: the plain
    /// name for the first item, a timestamped one after that.
    pub fn add_task(
        &self,
        source: &Path,
        target: Option<&Path>,
        options: CompressionOptions,
    ) -> Result<usize, QueueError> {
        let source_path = absolute_path(source).map_err(|e| QueueError::InvalidPath {
            path: source.to_path_buf(),
            source: e,
        })?;

        let mut items = self.items.write();

        let target = match target {
            Some(target) => target.to_path_buf(),
            None if items.is_empty() => PathBuf::from(generate_simple_zip_name(&source_path)),
            None => PathBuf::from(generate_unique_zip_name(&source_path)),
        };
        let target_path = absolute_path(&target).map_err(|e| QueueError::InvalidPath {
            path: target.clone(),
            source: e,
        })?;

        let id = items.len() + 1;
        debug!("Queued [{}] {} -> {}", id, source_path.display(), target_path.display());

        items.push(QueueItem {
            id,
            source_path,
            target_path,
            options,
            result: None,
            status: ItemStatus::Pending,
            retry_count: 0,
        });

        Ok(id)
    }

    /// Queue every directory `get_sub_directories(parent, depth)` selects
    pub fn add_directory(
        &self,
        parent: &Path,
        depth: i32,
        options: CompressionOptions,
    ) -> Result<usize, QueueError> {
        let dirs = get_sub_directories(parent, depth)?;
        let single = dirs.len() == 1;

        for dir in &dirs {
            let name = if single {
                generate_simple_zip_name(dir)
            } else {
                generate_unique_zip_name(dir)
            };
            self.add_task(dir, Some(Path::new(&name)), options.clone())?;
        }

        Ok(dirs.len())
    }

    /// Run every pending item. Returns `AlreadyRunning` unless the queue is idle.
    pub fn execute(&self) -> Result<RunOutcome, QueueError> {
        if !self.handle.transition(QueueStatus::Idle, QueueStatus::Running) {
            return Err(QueueError::AlreadyRunning);
        }
        let _idle = IdleGuard(&self.handle);

        let count = self.len();
        info!("Starting compression queue with {} items", count);

        for index in 0..count {
            if !self.wait_while_paused() {
                info!("Compression queue stopped before item {}", index + 1);
                return Ok(RunOutcome::Stopped);
            }

            let started = {
                let mut items = self.items.write();
                let item = &mut items[index];
                if item.status != ItemStatus::Pending {
                    continue;
                }
                item.status = ItemStatus::Running;
                item.clone()
            };

            self.run_item(index, started);
        }

        if self.handle.status() == QueueStatus::Stopped {
            return Ok(RunOutcome::Stopped);
        }

        if let Some(observer) = &self.observer {
            observer.on_queue_complete(&self.results());
        }

        Ok(RunOutcome::Completed)
    }

    fn run_item(&self, index: usize, started: QueueItem) {
        if let Some(observer) = &self.observer {
            observer.on_task_start(&started);
        }

        let mut task = CompressionTask::new(
            started.source_path.clone(),
            started.target_path.clone(),
            started.options.clone(),
        )
        .with_space_query(self.space_query.clone());

        if let Some(observer) = &self.observer {
            let observer = observer.clone();
            let tagged = started.clone();
            task = task.with_progress(move |processed, total, current| {
                observer.on_task_progress(&tagged, processed, total, current);
            });
        }

        let result = task.execute();
        if let Some(error) = &result.error {
            warn!("Compression of {} failed: {}", started.source_path.display(), error);
        }

        let finished = {
            let mut items = self.items.write();
            let item = &mut items[index];
            item.status = if result.success {
                ItemStatus::Completed
            } else {
                ItemStatus::Failed
            };
            item.result = Some(result);
            item.clone()
        };

        if let Some(observer) = &self.observer {
            observer.on_task_complete(&finished);
        }
    }

    // false once the queue is stopped
    fn wait_while_paused(&self) -> bool {
        loop {
            match self.handle.status() {
                QueueStatus::Stopped => return false,
                QueueStatus::Paused => std::thread::sleep(PAUSE_POLL_INTERVAL),
                _ => return true,
            }
        }
    }

    pub fn results(&self) -> Vec<QueueItem> {
        self.items.read().clone()
    }

    /// Archive paths of successful items, in completion order
    pub fn completed_zip_paths(&self) -> Vec<PathBuf> {
        self.items
            .read()
            .iter()
            .filter_map(|item| match &item.result {
                Some(result) if result.success => Some(result.target_path.clone()),
                _ => None,
            })
            .collect()
    }

    /// Remove archives left on disk by failed items. Returns how many were removed.
    pub fn cleanup_failed_tasks(&self) -> usize {
        let items = self.items.read();
        let mut removed = 0;

        for item in items.iter().filter(|i| i.status == ItemStatus::Failed) {
            if !item.target_path.exists() {
                continue;
            }
            match std::fs::remove_file(&item.target_path) {
                Ok(()) => {
                    debug!("Removed failed archive {}", item.target_path.display());
                    removed += 1;
                }
                Err(e) => warn!(
                    "Failed to remove archive {}: {}",
                    item.target_path.display(),
                    e
                ),
            }
        }

        removed
    }

    pub fn summary(&self) -> QueueSummary {
        QueueSummary::from_items(&self.items.read())
    }
}

#[derive(Debug, Clone)]
pub struct SummaryEntry {
    pub source_path: PathBuf,
    pub target_path: PathBuf,
    pub status: ItemStatus,
    pub error: Option<String>,
}

/// End-of-run rollup of a queue
#[derive(Debug, Clone, Default)]
pub struct QueueSummary {
    pub entries: Vec<SummaryEntry>,
    pub succeeded: usize,
    pub failed: usize,
    pub pending: usize,
    pub original_size: u64,
    pub compressed_size: u64,
}

impl QueueSummary {
    fn from_items(items: &[QueueItem]) -> Self {
        let mut summary = QueueSummary::default();

        for item in items {
            match item.status {
                ItemStatus::Completed => {
                    summary.succeeded += 1;
                    if let Some(result) = &item.result {
                        summary.original_size += result.total_size;
                        summary.compressed_size += result.compressed_size;
                    }
                }
                ItemStatus::Failed => summary.failed += 1,
                ItemStatus::Pending | ItemStatus::Running => summary.pending += 1,
            }

            summary.entries.push(SummaryEntry {
                source_path: item.source_path.clone(),
                target_path: item.target_path.clone(),
                status: item.status,
                error: item
                    .result
                    .as_ref()
                    .and_then(|r| r.error.as_ref())
                    .map(|e| e.to_string()),
            });
        }

        summary
    }

    pub fn ratio(&self) -> f64 {
        percentage(self.compressed_size, self.original_size)
    }
}

impl fmt::Display for QueueSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "========== Compression summary ==========")?;
        for (i, entry) in self.entries.iter().enumerate() {
            writeln!(
                f,
                "[{}] {} -> {} ({})",
                i + 1,
                entry.source_path.display(),
                entry.target_path.display(),
                entry.status
            )?;
            if let Some(error) = &entry.error {
                writeln!(f, "    error: {}", error)?;
            }
        }
        writeln!(f, "=========================================")?;
        write!(f, "succeeded: {}, failed: {}", self.succeeded, self.failed)?;
        if self.pending > 0 {
            write!(f, ", not run: {}", self.pending)?;
        }
        writeln!(f)?;
        if self.original_size > 0 {
            writeln!(
                f,
                "original: {}, packaged: {}, ratio: {:.2}%",
                format_size(self.original_size),
                format_size(self.compressed_size),
                self.ratio()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::fs;
    use std::thread;
    use tempfile::{tempdir, TempDir};

    fn make_sources(count: usize) -> (TempDir, Vec<PathBuf>) {
        let dir = tempdir().unwrap();
        let mut sources = Vec::new();
        for i in 0..count {
            let src = dir.path().join(format!("src{}", i));
            fs::create_dir(&src).unwrap();
            fs::write(src.join("data.txt"), format!("payload {}", i)).unwrap();
            sources.push(src);
        }
        fs::create_dir(dir.path().join("out")).unwrap();
        (dir, sources)
    }

    fn fill(queue: &TaskQueue, dir: &TempDir, sources: &[PathBuf]) {
        for (i, src) in sources.iter().enumerate() {
            let target = dir.path().join("out").join(format!("src{}.zip", i));
            queue
                .add_task(src, Some(&target), CompressionOptions::default())
                .unwrap();
        }
    }

    #[derive(Default)]
    struct Recorder {
        started: Mutex<Vec<usize>>,
        completed: Mutex<Vec<(usize, ItemStatus)>>,
        queue_done: Mutex<usize>,
        progress: Mutex<Vec<usize>>,
    }

    impl QueueObserver for Recorder {
        fn on_task_start(&self, item: &QueueItem) {
            self.started.lock().push(item.id);
        }

        fn on_task_progress(&self, item: &QueueItem, _processed: u64, _total: u64, _current: &Path) {
            self.progress.lock().push(item.id);
        }

        fn on_task_complete(&self, item: &QueueItem) {
            self.completed.lock().push((item.id, item.status));
        }

        fn on_queue_complete(&self, _items: &[QueueItem]) {
            *self.queue_done.lock() += 1;
        }
    }

    #[test]
    fn test_runs_in_insertion_order() {
        let (dir, sources) = make_sources(3);
        let mut queue = TaskQueue::new(1);
        let recorder = Arc::new(Recorder::default());
        queue.set_observer(recorder.clone());
        fill(&queue, &dir, &sources);

        assert_eq!(queue.execute().unwrap(), RunOutcome::Completed);
        assert_eq!(queue.status(), QueueStatus::Idle);

        assert_eq!(*recorder.started.lock(), vec![1, 2, 3]);
        assert_eq!(*recorder.progress.lock(), vec![1, 2, 3]);
        assert_eq!(
            *recorder.completed.lock(),
            vec![
                (1, ItemStatus::Completed),
                (2, ItemStatus::Completed),
                (3, ItemStatus::Completed)
            ]
        );
        assert_eq!(*recorder.queue_done.lock(), 1);

        let expected: Vec<PathBuf> = (0..3)
            .map(|i| dir.path().join("out").join(format!("src{}.zip", i)))
            .collect();
        assert_eq!(queue.completed_zip_paths(), expected);
    }

    #[test]
    fn test_failed_items_do_not_stop_the_queue() {
        let (dir, sources) = make_sources(2);
        let queue = TaskQueue::new(1);
        queue
            .add_task(&sources[0], Some(&dir.path().join("out/a.zip")), CompressionOptions::default())
            .unwrap();
        queue
            .add_task(
                &dir.path().join("does-not-exist"),
                Some(&dir.path().join("out/missing.zip")),
                CompressionOptions::default(),
            )
            .unwrap();
        queue
            .add_task(&sources[1], Some(&dir.path().join("out/b.zip")), CompressionOptions::default())
            .unwrap();

        queue.execute().unwrap();

        let results = queue.results();
        let statuses: Vec<_> = results.iter().map(|i| i.status).collect();
        assert_eq!(
            statuses,
            vec![ItemStatus::Completed, ItemStatus::Failed, ItemStatus::Completed]
        );
        assert_eq!(
            queue.completed_zip_paths(),
            vec![dir.path().join("out/a.zip"), dir.path().join("out/b.zip")]
        );

        let summary = queue.summary();
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert!(summary.to_string().contains("succeeded: 2, failed: 1"));
    }

    struct StopAfter {
        handle: QueueHandle,
        after_id: usize,
    }

    impl QueueObserver for StopAfter {
        fn on_task_complete(&self, item: &QueueItem) {
            if item.id == self.after_id {
                self.handle.stop();
            }
        }
    }

    #[test]
    fn test_stop_leaves_remaining_items_pending() {
        let (dir, sources) = make_sources(5);
        let mut queue = TaskQueue::new(1);
        let handle = queue.handle();
        queue.set_observer(Arc::new(StopAfter { handle, after_id: 2 }));
        fill(&queue, &dir, &sources);

        assert_eq!(queue.execute().unwrap(), RunOutcome::Stopped);
        assert_eq!(queue.status(), QueueStatus::Idle);

        let results = queue.results();
        let terminal = results.iter().filter(|i| i.status.is_terminal()).count();
        assert_eq!(terminal, 2);
        assert!(results[2..].iter().all(|i| i.status == ItemStatus::Pending));

        // Restarting picks up only the pending items
        assert_eq!(queue.execute().unwrap(), RunOutcome::Completed);
        assert_eq!(queue.completed_zip_paths().len(), 5);
    }

    #[test]
    fn test_queue_complete_not_fired_on_stop() {
        let (dir, sources) = make_sources(2);
        let mut queue = TaskQueue::new(1);
        let recorder = Arc::new(Recorder::default());
        queue.set_observer(recorder.clone());
        fill(&queue, &dir, &sources);

        let handle = queue.handle();
        // Stop is rejected while idle; the queue stays startable
        assert!(!handle.stop());
        assert_eq!(queue.status(), QueueStatus::Idle);

        queue.execute().unwrap();
        assert_eq!(*recorder.queue_done.lock(), 1);
    }

    struct PauseThenResume {
        handle: QueueHandle,
    }

    impl QueueObserver for PauseThenResume {
        fn on_task_complete(&self, item: &QueueItem) {
            if item.id == 1 {
                assert!(self.handle.pause());
                let handle = self.handle.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(250));
                    handle.resume();
                });
            }
        }
    }

    #[test]
    fn test_pause_and_resume() {
        let (dir, sources) = make_sources(2);
        let mut queue = TaskQueue::new(1);
        let handle = queue.handle();
        queue.set_observer(Arc::new(PauseThenResume { handle }));
        fill(&queue, &dir, &sources);

        let started = std::time::Instant::now();
        assert_eq!(queue.execute().unwrap(), RunOutcome::Completed);
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(queue.completed_zip_paths().len(), 2);
    }

    struct PauseAfterFirst {
        handle: QueueHandle,
    }

    impl QueueObserver for PauseAfterFirst {
        fn on_task_complete(&self, item: &QueueItem) {
            if item.id == 1 {
                self.handle.pause();
            }
        }
    }

    #[test]
    fn test_concurrent_execute_is_rejected() {
        let (dir, sources) = make_sources(2);
        let mut queue = TaskQueue::new(1);
        let handle = queue.handle();
        queue.set_observer(Arc::new(PauseAfterFirst { handle: handle.clone() }));
        fill(&queue, &dir, &sources);
        let queue = Arc::new(queue);

        let runner = {
            let queue = queue.clone();
            thread::spawn(move || queue.execute())
        };

        // The runner parks before item 2 until resumed
        while handle.status() != QueueStatus::Paused {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(queue.execute(), Err(QueueError::AlreadyRunning)));

        assert!(handle.resume());
        assert_eq!(runner.join().unwrap().unwrap(), RunOutcome::Completed);
        assert_eq!(queue.status(), QueueStatus::Idle);
        assert_eq!(queue.completed_zip_paths().len(), 2);
    }

    #[test]
    fn test_event_channel_observer() {
        let (dir, sources) = make_sources(2);
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut queue = TaskQueue::new(1);
        queue.set_observer(Arc::new(tx));
        fill(&queue, &dir, &sources);

        queue.execute().unwrap();
        drop(queue.take_observer());
        drop(queue);

        let events: Vec<QueueEvent> = rx.iter().collect();
        assert!(matches!(events.first(), Some(QueueEvent::TaskStarted(item)) if item.id == 1));
        assert!(matches!(events.last(), Some(QueueEvent::QueueCompleted(items)) if items.len() == 2));
        let progress_ids: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                QueueEvent::TaskProgress { item_id, .. } => Some(*item_id),
                _ => None,
            })
            .collect();
        assert_eq!(progress_ids, vec![1, 2]);
    }

    #[test]
    fn test_default_target_names() {
        let (dir, sources) = make_sources(2);
        let queue = TaskQueue::new(0);
        assert_eq!(queue.max_concurrent(), 1);

        queue.add_task(&sources[0], None, CompressionOptions::default()).unwrap();
        queue.add_task(&sources[1], None, CompressionOptions::default()).unwrap();

        let items = queue.results();
        assert_eq!(items[0].target_path.file_name().unwrap(), "src0.zip");
        let second = items[1].target_path.file_name().unwrap().to_string_lossy();
        assert!(second.starts_with("src1_"));
        assert!(items.iter().all(|i| i.target_path.is_absolute()));
        drop(dir);
    }

    #[test]
    fn test_add_directory_uses_sub_directories() {
        let (dir, _sources) = make_sources(3);
        let queue = TaskQueue::new(1);
        let added = queue.add_directory(dir.path(), 1, CompressionOptions::default()).unwrap();
        // src0..src2 plus out/
        assert_eq!(added, 4);
        assert_eq!(queue.len(), 4);

        let err = queue.add_directory(&dir.path().join("nope"), 1, CompressionOptions::default());
        assert!(matches!(err, Err(QueueError::Scan(_))));
    }

    #[test]
    fn test_cleanup_failed_tasks() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("dots");
        fs::create_dir(&src).unwrap();
        fs::write(src.join(".only"), b"x").unwrap();
        let target = dir.path().join("dots.zip");

        let queue = TaskQueue::new(1);
        queue.add_task(&src, Some(&target), CompressionOptions::default()).unwrap();
        queue.execute().unwrap();
        assert_eq!(queue.results()[0].status, ItemStatus::Failed);

        // Simulate a stale artifact from an earlier run
        fs::write(&target, b"stale").unwrap();
        assert_eq!(queue.cleanup_failed_tasks(), 1);
        assert!(!target.exists());
    }
}
