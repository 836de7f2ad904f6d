//! Concurrent task execution with staggered backoff.
//!
//! The [`Executor`] drains a FIFO queue of [`Task`]s onto the tokio runtime.
//! Tasks may enqueue further tasks while the executor runs (through a cloned
//! [`ExecutorHandle`]); [`Executor::run`] returns only once the queue is empty
//! and every dispatched task has finished.
//!
//! # Dispatch Policy
//!
//! Every dequeued task gets a dispatch index `i`, counted from zero for the
//! lifetime of one `run` call. With a backoff bucket `b > 0` and period `p`,
//! task `i` sleeps before its body runs:
//!
//! | Mode | Start delay |
//! |------|-------------|
//! | parallel | `p * floor(i / b)` |
//! | serial | `p` |
//!
//! With `b == 0` no delay is applied. In serial mode the executor waits for
//! all in-flight tasks after the last task of every bucket (after every task
//! when `b == 0`), so six parallel tasks with `b = 2, p = 2s` start at
//! `+0, +0, +2s, +2s, +4s, +4s`.
//!
//! Tasks never report errors to the executor. A panicking task is logged and
//! the remaining tasks keep running.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::TimeDelta;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error};

/// Errors raised for an invalid [`ExecutorConfig`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("backoff bucket must not be negative, got {0}")]
    NegativeBackoffBucket(i64),

    #[error("backoff period must not be negative, got {0}")]
    NegativeBackoffPeriod(TimeDelta),
}

/// Dispatch settings of an [`Executor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Run one bucket at a time.
    pub serial: bool,

    /// Number of tasks sharing one start delay step. `0` disables backoff.
    pub backoff_bucket: i64,

    /// Delay added per bucket.
    pub backoff_period: TimeDelta,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            serial: false,
            backoff_bucket: 0,
            backoff_period: TimeDelta::zero(),
        }
    }
}

/// Identifier of a task, unique within the process.
pub type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

/// A named unit of work.
pub struct Task {
    id: TaskId,
    name: String,
    fut: BoxFuture<'static, ()>,
}

impl Task {
    pub fn new<F>(name: impl Into<String>, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            fut: fut.boxed(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

struct Queue {
    items: Mutex<VecDeque<Task>>,
    added: Notify,
}

impl Queue {
    fn push(&self, task: Task) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(task);
        self.added.notify_one();
    }

    fn pop(&self) -> Option<Task> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Cloneable handle for adding tasks, usable from inside running tasks.
#[derive(Clone)]
pub struct ExecutorHandle {
    queue: Arc<Queue>,
}

impl ExecutorHandle {
    /// Appends a task to the queue.
    pub fn add_item(&self, task: Task) {
        debug!(task = %task.name, id = task.id, "Enqueued task");
        self.queue.push(task);
    }
}

/// Drains queued tasks concurrently according to an [`ExecutorConfig`].
pub struct Executor {
    config: ExecutorConfig,
    backoff_period: Duration,
    handle: ExecutorHandle,
}

impl Executor {
    /// Creates an executor.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the bucket or the period is negative.
    pub fn new(config: ExecutorConfig) -> Result<Self, ConfigError> {
        if config.backoff_bucket < 0 {
            return Err(ConfigError::NegativeBackoffBucket(config.backoff_bucket));
        }
        let backoff_period = config
            .backoff_period
            .to_std()
            .map_err(|_| ConfigError::NegativeBackoffPeriod(config.backoff_period))?;

        Ok(Self {
            config,
            backoff_period,
            handle: ExecutorHandle {
                queue: Arc::new(Queue {
                    items: Mutex::new(VecDeque::new()),
                    added: Notify::new(),
                }),
            },
        })
    }

    pub fn handle(&self) -> ExecutorHandle {
        self.handle.clone()
    }

    pub fn add_item(&self, task: Task) {
        self.handle.add_item(task);
    }

    /// Runs until the queue is empty and no task is in flight.
    pub async fn run(&self) {
        let queue = &self.handle.queue;
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut index: u64 = 0;

        loop {
            if let Some(task) = queue.pop() {
                let delay = self.start_delay(index);
                debug!(
                    task = %task.name,
                    id = task.id,
                    index,
                    "Dispatching task with delay {:?}",
                    delay
                );
                in_flight.spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    task.fut.await;
                });

                let completes_bucket = self.completes_bucket(index);
                index += 1;
                if self.config.serial && completes_bucket {
                    while let Some(result) = in_flight.join_next().await {
                        log_join(result);
                    }
                }
                continue;
            }

            if in_flight.is_empty() {
                break;
            }

            // Register for wake-ups before re-checking the queue so an item
            // added in between is not missed.
            let notified = queue.added.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if queue.len() > 0 {
                continue;
            }

            tokio::select! {
                _ = &mut notified => {}
                Some(result) = in_flight.join_next() => log_join(result),
            }
        }

        debug!("Executor finished after {} tasks", index);
    }

    fn start_delay(&self, index: u64) -> Duration {
        let Ok(bucket) = u64::try_from(self.config.backoff_bucket) else {
            return Duration::ZERO;
        };
        if bucket == 0 {
            return Duration::ZERO;
        }
        let multiplier = if self.config.serial { 1 } else { index / bucket };
        self.backoff_period
            .saturating_mul(u32::try_from(multiplier).unwrap_or(u32::MAX))
    }

    fn completes_bucket(&self, index: u64) -> bool {
        is_last_of_bucket(index, self.config.backoff_bucket)
    }
}

/// True if `index` is the last position of its bucket. Every index completes
/// a bucket of size zero.
fn is_last_of_bucket(index: u64, bucket: i64) -> bool {
    match u64::try_from(bucket) {
        Ok(0) | Err(_) => true,
        Ok(size) => (index + 1) % size == 0,
    }
}

fn log_join(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("Task panicked: {}", e);
        } else {
            error!("Task was cancelled: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    type Starts = Arc<Mutex<Vec<(usize, Instant)>>>;

    fn config(serial: bool, bucket: i64, period_secs: i64) -> ExecutorConfig {
        ExecutorConfig {
            serial,
            backoff_bucket: bucket,
            backoff_period: TimeDelta::seconds(period_secs),
        }
    }

    fn recording_task(n: usize, starts: &Starts, runtime: Duration) -> Task {
        let starts = starts.clone();
        Task::new(format!("task-{n}"), async move {
            starts.lock().unwrap().push((n, Instant::now()));
            tokio::time::sleep(runtime).await;
        })
    }

    /// Start offsets in whole seconds, ordered by task number.
    fn offsets(starts: &Starts, t0: Instant) -> Vec<u64> {
        let mut starts = starts.lock().unwrap().clone();
        starts.sort_by_key(|(n, _)| *n);
        starts
            .into_iter()
            .map(|(_, at)| ((at - t0).as_millis() as f64 / 1000.0).round() as u64)
            .collect()
    }

    async fn run_tasks(config: ExecutorConfig, count: usize, runtime: Duration) -> Vec<u64> {
        let executor = Executor::new(config).unwrap();
        let starts: Starts = Arc::default();
        for n in 0..count {
            executor.add_item(recording_task(n, &starts, runtime));
        }
        let t0 = Instant::now();
        executor.run().await;
        offsets(&starts, t0)
    }

    #[test]
    fn test_negative_config_is_rejected() {
        let err = Executor::new(config(false, -1, 0)).err().unwrap();
        assert_eq!(err, ConfigError::NegativeBackoffBucket(-1));

        let err = Executor::new(config(false, 1, -2)).err().unwrap();
        assert!(matches!(err, ConfigError::NegativeBackoffPeriod(_)));
    }

    #[test]
    fn test_is_last_of_bucket() {
        assert!(is_last_of_bucket(0, 0));
        assert!(is_last_of_bucket(7, 0));
        assert!(!is_last_of_bucket(0, 2));
        assert!(is_last_of_bucket(1, 2));
        assert!(is_last_of_bucket(5, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_empty() {
        let executor = Executor::new(ExecutorConfig::default()).unwrap();
        executor.run().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_without_backoff() {
        let starts = run_tasks(config(true, 0, 0), 3, Duration::from_secs(1)).await;
        assert_eq!(starts, [0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_without_backoff() {
        let starts = run_tasks(config(false, 0, 5), 4, Duration::from_secs(1)).await;
        assert_eq!(starts, [0, 0, 0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_bucket_of_one() {
        let starts = run_tasks(config(true, 1, 2), 3, Duration::ZERO).await;
        assert_eq!(starts, [2, 4, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_buckets() {
        let starts = run_tasks(config(false, 2, 2), 6, Duration::from_secs(1)).await;
        assert_eq!(starts, [0, 0, 2, 2, 4, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_buckets() {
        let starts = run_tasks(config(true, 2, 2), 4, Duration::from_secs(1)).await;
        assert_eq!(starts, [2, 2, 5, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_added_from_running_task() {
        let executor = Executor::new(config(true, 0, 0)).unwrap();
        let starts: Starts = Arc::default();
        let handle = executor.handle();

        executor.add_item(recording_task(0, &starts, Duration::from_secs(1)));
        let inner_starts = starts.clone();
        executor.add_item(Task::new("task-1", async move {
            inner_starts.lock().unwrap().push((1, Instant::now()));
            handle.add_item(recording_task(2, &inner_starts, Duration::from_secs(1)));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }));

        let t0 = Instant::now();
        executor.run().await;
        assert_eq!(offsets(&starts, t0), [0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_item_wakes_idle_executor() {
        let executor = Executor::new(ExecutorConfig::default()).unwrap();
        let starts: Starts = Arc::default();
        let handle = executor.handle();

        let inner_starts = starts.clone();
        executor.add_item(Task::new("long", async move {
            inner_starts.lock().unwrap().push((0, Instant::now()));
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle.add_item(recording_task(1, &inner_starts, Duration::ZERO));
            tokio::time::sleep(Duration::from_secs(4)).await;
        }));

        let t0 = Instant::now();
        executor.run().await;
        assert_eq!(offsets(&starts, t0), [0, 1]);
        assert!(Instant::now() - t0 >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_task_does_not_abort_run() {
        let executor = Executor::new(ExecutorConfig::default()).unwrap();
        let starts: Starts = Arc::default();
        executor.add_item(Task::new("boom", async {
            panic!("boom");
        }));
        executor.add_item(recording_task(1, &starts, Duration::ZERO));

        executor.run().await;
        assert_eq!(starts.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = Task::new("a", async {});
        let b = Task::new("b", async {});
        assert_ne!(a.id(), b.id());
        assert_eq!(a.name(), "a");
    }
}
