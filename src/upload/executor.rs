use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Identity and retry bookkeeping of one queued unit
#[derive(Debug, Clone)]
pub struct TaskInfo {
    id: String,
    retry: u32,
    max_retry: u32,
}

impl TaskInfo {
    pub fn new(id: impl Into<String>, max_retry: u32) -> Self {
        Self {
            id: id.into(),
            retry: 0,
            max_retry,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Retries performed so far
    pub fn retry(&self) -> u32 {
        self.retry
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }
}

/// Verdict of one `TaskUnit::run` attempt
#[derive(Debug, Default)]
pub struct UnitRunResult {
    pub succeed: bool,
    pub need_retry: bool,
    pub err: Option<anyhow::Error>,
    pub message: String,
}

impl UnitRunResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            succeed: true,
            message: message.into(),
            ..Default::default()
        }
    }

    /// Failure worth another attempt
    pub fn retryable(err: anyhow::Error, message: impl Into<String>) -> Self {
        Self {
            need_retry: true,
            err: Some(err),
            message: message.into(),
            ..Default::default()
        }
    }

    /// Failure that no retry will fix
    pub fn fatal(err: anyhow::Error, message: impl Into<String>) -> Self {
        Self {
            err: Some(err),
            message: message.into(),
            ..Default::default()
        }
    }
}

impl fmt::Display for UnitRunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.err {
            Some(err) => write!(f, "{}, {:#}", self.message, err),
            None => f.write_str(&self.message),
        }
    }
}

/// A retryable job driven by `TaskExecutor`.
///
/// The executor owns retry counting; a unit only reports whether another
/// attempt makes sense through `UnitRunResult::need_retry`.
#[async_trait]
pub trait TaskUnit: Send {
    async fn run(&mut self, info: &TaskInfo) -> UnitRunResult;

    /// Before a repeat attempt
    fn on_retry(&mut self, info: &TaskInfo, last: &UnitRunResult);

    fn on_success(&mut self, info: &TaskInfo, last: &UnitRunResult);

    /// Retries exhausted or the failure was not retryable
    fn on_failed(&mut self, info: &TaskInfo, last: &UnitRunResult);

    /// After `on_success` or `on_failed`
    fn on_complete(&mut self, _info: &TaskInfo, _last: &UnitRunResult) {}

    /// Delay before retry number `attempt` (1-based)
    fn retry_wait(&self, attempt: u32) -> Duration;

    /// Short description for failure reports
    fn label(&self) -> String;
}

/// Linear backoff with a ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    step: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(step: Duration, max: Duration) -> Self {
        Self { step, max }
    }

    pub fn wait(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(6))
    }
}

pub struct FailedUnit {
    pub info: TaskInfo,
    pub unit: Box<dyn TaskUnit>,
}

impl fmt::Debug for FailedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailedUnit")
            .field("info", &self.info)
            .field("unit", &self.unit.label())
            .finish()
    }
}

type WorkQueue = Arc<Mutex<VecDeque<(TaskInfo, Box<dyn TaskUnit>)>>>;

/// Runs task units with bounded parallelism and per-unit retries
pub struct TaskExecutor {
    pending: Vec<(TaskInfo, Box<dyn TaskUnit>)>,
    parallel: usize,
    next_id: u64,
    failed: Vec<FailedUnit>,
}

impl TaskExecutor {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            parallel: 1,
            next_id: 0,
            failed: Vec::new(),
        }
    }

    /// Queue a unit; it will be retried at most `max_retry` times
    pub fn append(&mut self, unit: Box<dyn TaskUnit>, max_retry: u32) -> TaskInfo {
        self.next_id += 1;
        let info = TaskInfo::new(self.next_id.to_string(), max_retry);
        self.pending.push((info.clone(), unit));
        info
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn set_parallel(&mut self, parallel: usize) {
        self.parallel = parallel.max(1);
    }

    pub fn parallel(&self) -> usize {
        self.parallel
    }

    /// Run every queued unit to success or terminal failure
    pub async fn execute(&mut self) {
        let total = self.pending.len();
        if total == 0 {
            return;
        }

        let queue: WorkQueue = Arc::new(Mutex::new(self.pending.drain(..).collect()));
        let failed = Arc::new(Mutex::new(Vec::new()));
        let workers = self.parallel.min(total);

        info!("Starting executor: {} units, {} workers", total, workers);

        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            set.spawn(worker_loop(worker_id, queue.clone(), failed.clone()));
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!("Executor worker ended abnormally: {}", e);
            }
        }

        self.failed.append(&mut failed.lock());
    }

    /// Units that failed terminally, in the order they failed
    pub fn failed_units(&self) -> &[FailedUnit] {
        &self.failed
    }

    pub fn take_failed(&mut self) -> Vec<FailedUnit> {
        std::mem::take(&mut self.failed)
    }
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self::new()
    }
}

async fn worker_loop(worker_id: usize, queue: WorkQueue, failed: Arc<Mutex<Vec<FailedUnit>>>) {
    debug!("Worker {} started", worker_id);

    loop {
        let next = queue.lock().pop_front();
        let Some((info, unit)) = next else {
            break;
        };

        if let Some(failure) = run_unit(info, unit).await {
            failed.lock().push(failure);
        }
    }

    debug!("Worker {} finished", worker_id);
}

async fn run_unit(mut info: TaskInfo, mut unit: Box<dyn TaskUnit>) -> Option<FailedUnit> {
    loop {
        // A panicking unit fails terminally but is still reported
        let attempt = AssertUnwindSafe(unit.run(&info)).catch_unwind().await;
        let result = match attempt {
            Ok(result) => result,
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!("[{}] {} panicked: {}", info.id(), unit.label(), reason);
                UnitRunResult::fatal(anyhow::anyhow!("panicked: {}", reason), "task unit panicked")
            }
        };

        if result.succeed {
            unit.on_success(&info, &result);
            unit.on_complete(&info, &result);
            return None;
        }

        if result.need_retry && info.retry < info.max_retry {
            info.retry += 1;
            unit.on_retry(&info, &result);
            tokio::time::sleep(unit.retry_wait(info.retry)).await;
            continue;
        }

        unit.on_failed(&info, &result);
        unit.on_complete(&info, &result);
        return Some(FailedUnit { info, unit });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
