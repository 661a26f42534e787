//! Worker pool for task execution
//!
//! Runs a bounded number of asynchronous tasks concurrently and retries
//! failures with exponential backoff.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, trace, warn};

use crate::error::Result;
use crate::reliability::BackoffPolicy;
use crate::util::env_parse;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerPoolConfig {
    /// Maximum number of tasks executing at once
    pub max_workers: usize,

    /// Retries after the first attempt before a task is rejected
    pub max_retries: u32,

    /// Wait between a failed attempt and its retry
    pub backoff: BackoffPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 5,
            max_retries: 30,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a new worker pool configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// - `BATCH_MAX_WORKERS` (default 5)
    /// - `BATCH_MAX_RETRIES` (default 30)
    /// - `BATCH_INITIAL_BACKOFF_MS` (default 500)
    /// - `BATCH_BACKOFF_BASE` (default 2.0)
    /// - `BATCH_JITTER_MS` (default 100)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut backoff = defaults.backoff.clone();
        if let Some(ms) = env_parse("BATCH_INITIAL_BACKOFF_MS") {
            backoff = backoff.with_initial_wait(std::time::Duration::from_millis(ms));
        }
        if let Some(base) = env_parse("BATCH_BACKOFF_BASE") {
            backoff = backoff.with_base(base);
        }
        if let Some(ms) = env_parse("BATCH_JITTER_MS") {
            backoff = backoff.with_jitter_max(std::time::Duration::from_millis(ms));
        }

        Self {
            max_workers: env_parse::<usize>("BATCH_MAX_WORKERS")
                .unwrap_or(defaults.max_workers)
                .max(1),
            max_retries: env_parse("BATCH_MAX_RETRIES").unwrap_or(defaults.max_retries),
            backoff,
        }
    }

    /// Set the maximum number of concurrent tasks
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max.max(1);
        self
    }

    /// Set the maximum number of retries
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the wait before the first retry
    pub fn with_initial_backoff_wait(mut self, wait: std::time::Duration) -> Self {
        self.backoff = self.backoff.with_initial_wait(wait);
        self
    }

    /// Set the backoff base
    pub fn with_backoff_base(mut self, base: f64) -> Self {
        self.backoff = self.backoff.with_base(base);
        self
    }

    /// Set the jitter upper bound
    pub fn with_jitter_max(mut self, jitter: std::time::Duration) -> Self {
        self.backoff = self.backoff.with_jitter_max(jitter);
        self
    }

    /// Replace the whole backoff policy
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(crate::EditError::config("max_workers must be at least 1"));
        }
        self.backoff.validate()
    }
}

/// Why a submitted task did not produce a value
#[derive(Debug, thiserror::Error)]
pub enum TaskError<E> {
    /// Every attempt failed; carries the error of the last one
    #[error("task failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    /// The pool was dropped while the task was queued or backing off
    #[error("worker pool is closed")]
    PoolClosed,
}

impl<E> TaskError<E> {
    /// The error returned by the final attempt, if any
    pub fn into_source(self) -> Option<E> {
        match self {
            TaskError::Exhausted { source, .. } => Some(source),
            TaskError::PoolClosed => None,
        }
    }

    /// Number of attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            TaskError::Exhausted { attempts, .. } => *attempts,
            TaskError::PoolClosed => 0,
        }
    }
}

/// Type-erased unit of work owned by the pool until it settles
trait Job: Send {
    /// Run one attempt. Returns the job back when it failed and may be retried.
    fn run(self: Box<Self>, final_attempt: bool) -> BoxFuture<'static, Option<Box<dyn Job>>>;
}

struct Submission<F, T, E> {
    action: F,
    reply: oneshot::Sender<std::result::Result<T, TaskError<E>>>,
    attempts: u32,
}

impl<F, Fut, T, E> Job for Submission<F, T, E>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    fn run(mut self: Box<Self>, final_attempt: bool) -> BoxFuture<'static, Option<Box<dyn Job>>> {
        self.attempts += 1;
        let attempt = (self.action)();

        Box::pin(async move {
            match attempt.await {
                Ok(value) => {
                    let _ = self.reply.send(Ok(value));
                    None
                }
                Err(error) if final_attempt => {
                    let Submission {
                        reply, attempts, ..
                    } = *self;
                    warn!(attempts, error = %error, "task failed permanently");
                    let _ = reply.send(Err(TaskError::Exhausted {
                        attempts,
                        source: error,
                    }));
                    None
                }
                Err(_) if self.reply.is_closed() => {
                    debug!(attempts = self.attempts, "submitter went away, dropping task");
                    None
                }
                Err(error) => {
                    warn!(attempts = self.attempts, error = %error, "task attempt failed, will retry");
                    Some(self as Box<dyn Job>)
                }
            }
        })
    }
}

struct QueuedTask {
    id: u64,
    retries: u32,
    job: Box<dyn Job>,
}

#[derive(Default)]
struct PoolStats {
    queued: AtomicUsize,
    active: AtomicUsize,
}

/// Holds a worker slot for the duration of one attempt
struct SlotGuard {
    _permit: OwnedSemaphorePermit,
    stats: Arc<PoolStats>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bounded-concurrency task scheduler
///
/// Tasks enter a FIFO queue as soon as they are submitted. A dispatcher hands
/// them a worker slot (one of `max_workers` semaphore permits) in order; a
/// slot is released as soon as the attempt settles. Failed attempts wait out
/// their backoff *without* a slot and then rejoin the back of the queue.
///
/// The pool is a cheap handle: clones share the same queue and slots. Once
/// every handle is dropped the dispatcher drains what is already queued and
/// exits; tasks still backing off then resolve with [`TaskError::PoolClosed`].
///
/// Must be created from within a Tokio runtime.
///
/// # Example
///
/// ```ignore
/// use batchedit_core::{WorkerPool, WorkerPoolConfig};
///
/// let pool = WorkerPool::new(WorkerPoolConfig::new().with_max_workers(5));
///
/// let label = pool
///     .submit(move || {
///         let image = image.clone();
///         async move { image.post(json!(["cats"])).await }
///     })
///     .await?;
/// ```
#[derive(Clone)]
pub struct WorkerPool {
    config: Arc<WorkerPoolConfig>,
    queue: mpsc::UnboundedSender<QueuedTask>,
    stats: Arc<PoolStats>,
    next_task_id: Arc<AtomicU64>,
}

impl WorkerPool {
    /// Create a pool and start its dispatcher
    pub fn new(config: WorkerPoolConfig) -> Self {
        let config = Arc::new(WorkerPoolConfig {
            max_workers: config.max_workers.max(1),
            ..config
        });
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(PoolStats::default());

        info!(
            max_workers = config.max_workers,
            max_retries = config.max_retries,
            "Starting worker pool"
        );

        tokio::spawn(dispatch_loop(
            queue_rx,
            queue.downgrade(),
            Arc::clone(&config),
            Arc::clone(&stats),
        ));

        Self {
            config,
            queue,
            stats,
            next_task_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Submit an action
    ///
    /// The task is queued immediately, before the returned future is polled.
    /// The action is called once per attempt: at most `max_retries + 1` times.
    pub fn submit<F, Fut, T, E>(
        &self,
        action: F,
    ) -> impl Future<Output = std::result::Result<T, TaskError<E>>> + Send + 'static
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let task = QueuedTask {
            id,
            retries: 0,
            job: Box::new(Submission {
                action,
                reply,
                attempts: 0,
            }),
        };

        self.stats.queued.fetch_add(1, Ordering::AcqRel);
        if self.queue.send(task).is_err() {
            // Dispatcher is gone; the reply sender was dropped with the task.
            self.stats.queued.fetch_sub(1, Ordering::AcqRel);
        } else {
            trace!(task_id = id, "task queued");
        }

        async move { result.await.unwrap_or(Err(TaskError::PoolClosed)) }
    }

    /// Tasks waiting for a worker slot
    pub fn queued(&self) -> usize {
        self.stats.queued.load(Ordering::Acquire)
    }

    /// Tasks currently holding a worker slot
    pub fn active(&self) -> usize {
        self.stats.active.load(Ordering::Acquire)
    }

    /// Maximum concurrent tasks
    pub fn max_workers(&self) -> usize {
        self.config.max_workers
    }

    /// Get the configuration
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_workers", &self.config.max_workers)
            .field("queued", &self.queued())
            .field("active", &self.active())
            .finish()
    }
}

async fn dispatch_loop(
    mut queue_rx: mpsc::UnboundedReceiver<QueuedTask>,
    requeue: mpsc::WeakUnboundedSender<QueuedTask>,
    config: Arc<WorkerPoolConfig>,
    stats: Arc<PoolStats>,
) {
    let slots = Arc::new(Semaphore::new(config.max_workers));

    while let Some(task) = queue_rx.recv().await {
        let permit = match Arc::clone(&slots).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        stats.queued.fetch_sub(1, Ordering::AcqRel);
        stats.active.fetch_add(1, Ordering::AcqRel);
        let slot = SlotGuard {
            _permit: permit,
            stats: Arc::clone(&stats),
        };

        let final_attempt = task.retries >= config.max_retries;
        let requeue = requeue.clone();
        let stats = Arc::clone(&stats);
        let backoff = config.backoff.clone();

        tokio::spawn(async move {
            let QueuedTask { id, retries, job } = task;
            trace!(task_id = id, retries, "task attempt started");

            let outcome = job.run(final_attempt).await;
            drop(slot);

            let Some(job) = outcome else {
                return;
            };

            let wait = backoff.wait_for(retries);
            debug!(
                task_id = id,
                retries,
                wait_ms = wait.as_millis() as u64,
                "Backing off before retry"
            );
            tokio::time::sleep(wait).await;

            match requeue.upgrade() {
                Some(queue) => {
                    stats.queued.fetch_add(1, Ordering::AcqRel);
                    let retry = QueuedTask {
                        id,
                        retries: retries + 1,
                        job,
                    };
                    if queue.send(retry).is_err() {
                        stats.queued.fetch_sub(1, Ordering::AcqRel);
                    }
                }
                None => debug!(task_id = id, "worker pool dropped during backoff, abandoning task"),
            }
        });
    }

    debug!("Worker pool dispatcher exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EditError;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn quick_pool(max_workers: usize, max_retries: u32) -> WorkerPool {
        WorkerPool::new(
            WorkerPoolConfig::new()
                .with_max_workers(max_workers)
                .with_max_retries(max_retries)
                .with_initial_backoff_wait(Duration::from_millis(1))
                .with_jitter_max(Duration::ZERO),
        )
    }

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.max_workers, 5);
        assert_eq!(config.max_retries, 30);
        assert_eq!(config.backoff.initial_wait, Duration::from_millis(500));
        assert_eq!(config.backoff.base, 2.0);
        assert_eq!(config.backoff.jitter_max, Duration::from_millis(100));
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerPoolConfig::new()
            .with_max_workers(0)
            .with_max_retries(3)
            .with_initial_backoff_wait(Duration::from_millis(20))
            .with_backoff_base(3.0);

        assert_eq!(config.max_workers, 1);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff.initial_wait, Duration::from_millis(20));
        assert_eq!(config.backoff.base, 3.0);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_resolves_with_action_value() {
        let pool = quick_pool(5, 30);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let result = pool
            .submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, EditError>("YES") }
            })
            .await;

        assert_eq!(result.unwrap(), "YES");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_ceiling() {
        let max_retries = 5;
        let pool = quick_pool(5, max_retries);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let result: std::result::Result<(), _> = pool
            .submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(EditError::request("Never going to work.")) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts(), max_retries + 1);
        assert_eq!(
            err.into_source(),
            Some(EditError::request("Never going to work."))
        );
        assert_eq!(calls.load(Ordering::SeqCst), max_retries + 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let pool = quick_pool(2, 5);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let result = pool
            .submit(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(EditError::request("502"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_zero_retries_attempts_once() {
        let pool = quick_pool(1, 0);

        let result: std::result::Result<(), _> = pool
            .submit(|| async { Err(EditError::request("nope")) })
            .await;

        assert_eq!(result.unwrap_err().attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_does_not_hold_a_slot() {
        let pool = WorkerPool::new(
            WorkerPoolConfig::new()
                .with_max_workers(1)
                .with_max_retries(1)
                .with_initial_backoff_wait(Duration::from_secs(60))
                .with_jitter_max(Duration::ZERO),
        );

        let failing =
            tokio::spawn(pool.submit(|| async { Err::<(), _>(EditError::request("down")) }));

        // While the first task waits out its 60s backoff the only slot is free.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let started = tokio::time::Instant::now();
        let quick = pool.submit(|| async { Ok::<_, EditError>(42) }).await;

        assert_eq!(quick.unwrap(), 42);
        assert!(started.elapsed() < Duration::from_secs(1));

        let failed = failing.await.unwrap();
        assert_eq!(failed.unwrap_err().attempts(), 2);
    }

    #[tokio::test]
    async fn test_stats_settle_to_zero() {
        let pool = quick_pool(3, 0);

        let tasks: Vec<_> = (0..6)
            .map(|i| pool.submit(move || async move { Ok::<_, EditError>(i) }))
            .collect();
        let values = futures::future::join_all(tasks).await;
        // Slots are released just after the reply is delivered.
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(values.len(), 6);
        assert_eq!(pool.queued(), 0);
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.max_workers(), 3);
    }
}
