//! Batch operation orchestrator
//!
//! Drives every item of a batch through the shared [`WorkerPool`] and
//! reports the batch's lifecycle on [`BatchEvents`].

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{info, instrument, warn};

use super::events::{BatchEvent, BatchEventReceiver, BatchEvents};
use crate::error::{EditError, Result};
use crate::worker::WorkerPool;

/// One step of a staged batch item
///
/// Receives the item and the value produced by the previous stage (`None`
/// for the first stage).
pub type Stage<I, V> = Arc<dyn Fn(I, Option<V>) -> BoxFuture<'static, Result<V>> + Send + Sync>;

/// Wrap a closure as a [`Stage`]
pub fn stage<I, V, F, Fut>(f: F) -> Stage<I, V>
where
    F: Fn(I, Option<V>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V>> + Send + 'static,
{
    Arc::new(
        move |item: I, previous: Option<V>| -> BoxFuture<'static, Result<V>> {
            Box::pin(f(item, previous))
        },
    )
}

/// Per-item outcome of a settled batch
#[derive(Debug)]
pub struct BatchReport<T> {
    /// Key of the batch
    pub key: String,
    /// Outcome of every item, in input order
    pub outcomes: Vec<Result<T>>,
    first_failure: Option<EditError>,
}

impl<T> BatchReport<T> {
    /// Number of items in the batch
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    /// Number of items that succeeded
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_ok()).count()
    }

    /// Number of items that failed permanently
    pub fn failed(&self) -> usize {
        self.total() - self.succeeded()
    }

    /// The first failure in completion order
    pub fn first_failure(&self) -> Option<&EditError> {
        self.first_failure.as_ref()
    }

    /// All values in input order, or the first failure observed
    pub fn into_result(self) -> Result<Vec<T>> {
        if let Some(err) = self.first_failure {
            return Err(err);
        }
        self.outcomes.into_iter().collect()
    }
}

/// Counts settled items and announces the batch lifecycle
///
/// `Complete` is published when this is dropped, so it fires exactly once
/// even if the caller stops awaiting the batch.
struct BatchProgress {
    events: BatchEvents,
    key: String,
    completed: usize,
}

impl BatchProgress {
    fn start(events: BatchEvents, key: String, total: usize) -> Self {
        events.publish(BatchEvent::Start {
            key: key.clone(),
            completed: 0,
            total,
        });
        Self {
            events,
            key,
            completed: 0,
        }
    }

    fn item_settled(&mut self) {
        self.completed += 1;
        self.events.publish(BatchEvent::Progress {
            key: self.key.clone(),
            completed: self.completed,
        });
    }
}

impl Drop for BatchProgress {
    fn drop(&mut self) {
        self.events.publish(BatchEvent::Complete {
            key: self.key.clone(),
        });
    }
}

/// Runs batches of items through a shared worker pool
///
/// # Example
///
/// ```ignore
/// use batchedit_core::{BatchEvents, BatchOrchestrator, WorkerPool, WorkerPoolConfig};
///
/// let orchestrator = BatchOrchestrator::new(
///     WorkerPool::new(WorkerPoolConfig::default()),
///     BatchEvents::new(),
/// );
/// let mut events = orchestrator.subscribe();
///
/// let labelled = orchestrator
///     .run_batch("label", images, move |image| add_label(image, "cat"))
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct BatchOrchestrator {
    pool: WorkerPool,
    events: BatchEvents,
}

impl BatchOrchestrator {
    pub fn new(pool: WorkerPool, events: BatchEvents) -> Self {
        Self { pool, events }
    }

    /// The pool items run on
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// The hub lifecycle events are published on
    pub fn events(&self) -> &BatchEvents {
        &self.events
    }

    /// Subscribe to lifecycle events of every batch run from now on
    pub fn subscribe(&self) -> BatchEventReceiver {
        self.events.subscribe()
    }

    /// Run `action` for every item and collect the values in input order
    ///
    /// Waits for every item to settle. If any item failed permanently the
    /// batch fails with the first failure observed, wrapped in
    /// [`EditError::BatchItem`].
    pub async fn run_batch<I, F, Fut, T>(&self, key: &str, items: Vec<I>, action: F) -> Result<Vec<T>>
    where
        I: Clone + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.run_batch_settled(key, items, action)
            .await
            .into_result()
    }

    /// Like [`run_batch`](Self::run_batch) but reports every item's outcome
    #[instrument(skip_all, fields(key = %key, total = items.len()))]
    pub async fn run_batch_settled<I, F, Fut, T>(
        &self,
        key: &str,
        items: Vec<I>,
        action: F,
    ) -> BatchReport<T>
    where
        I: Clone + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        info!(key, total = items.len(), "Starting batch");
        let progress = BatchProgress::start(self.events.clone(), key.to_string(), items.len());

        let action = Arc::new(action);
        let running = items
            .into_iter()
            .map(|item| {
                let action = Arc::clone(&action);
                let task = self.pool.submit(move || action(item.clone()));
                async move { task.await.map_err(EditError::from) }
            })
            .collect();

        settle_all(progress, running).await
    }

    /// Run every item through `stages` in order
    ///
    /// Each stage of each item is its own pool task, so a retry repeats only
    /// the stage that failed. Progress counts items, not stages. Resolves
    /// with the value of the last stage per item.
    #[instrument(skip_all, fields(key = %key, total = items.len(), stages = stages.len()))]
    pub async fn run_staged<I, V>(
        &self,
        key: &str,
        items: Vec<I>,
        stages: Vec<Stage<I, V>>,
    ) -> Result<Vec<V>>
    where
        I: Clone + Send + 'static,
        V: Clone + Send + 'static,
    {
        let Some((first, rest)) = stages.split_first() else {
            return Err(EditError::config(format!(
                "batch '{key}' needs at least one stage"
            )));
        };

        info!(key, total = items.len(), stages = stages.len(), "Starting staged batch");
        let progress = BatchProgress::start(self.events.clone(), key.to_string(), items.len());

        let rest: Arc<[Stage<I, V>]> = rest.into();
        let running = items
            .into_iter()
            .map(|item| {
                let pool = self.pool.clone();
                let rest = Arc::clone(&rest);
                let first = submit_stage(&pool, Arc::clone(first), item.clone(), None);
                async move {
                    let mut value = first.await?;
                    for next in rest.iter() {
                        value =
                            submit_stage(&pool, Arc::clone(next), item.clone(), Some(value)).await?;
                    }
                    Ok(value)
                }
            })
            .collect();

        settle_all(progress, running).await.into_result()
    }
}

fn submit_stage<I, V>(
    pool: &WorkerPool,
    stage: Stage<I, V>,
    item: I,
    previous: Option<V>,
) -> impl Future<Output = Result<V>> + Send + 'static
where
    I: Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    let task = pool.submit(move || stage(item.clone(), previous.clone()));
    async move { task.await.map_err(EditError::from) }
}

/// Await every item, publishing progress as each one settles
async fn settle_all<T, Fut>(mut progress: BatchProgress, running: Vec<Fut>) -> BatchReport<T>
where
    Fut: Future<Output = Result<T>>,
{
    let key = progress.key.clone();
    let total = running.len();
    let mut outcomes: Vec<Option<Result<T>>> = (0..total).map(|_| None).collect();
    let mut first_failure = None;

    let mut pending: FuturesUnordered<_> = running
        .into_iter()
        .enumerate()
        .map(|(index, item)| async move { (index, item.await) })
        .collect();

    while let Some((index, outcome)) = pending.next().await {
        let outcome = outcome.map_err(|source| EditError::BatchItem {
            key: key.clone(),
            index,
            source: Box::new(source),
        });
        if let Err(err) = &outcome {
            warn!(key = %key, index, error = %err, "batch item failed");
            first_failure.get_or_insert_with(|| err.clone());
        }
        progress.item_settled();
        outcomes[index] = Some(outcome);
    }
    drop(progress);

    let outcomes: Vec<Result<T>> = outcomes
        .into_iter()
        .map(|outcome| outcome.unwrap_or(Err(EditError::PoolClosed)))
        .collect();
    let failed = outcomes.iter().filter(|o| o.is_err()).count();
    info!(key = %key, total, failed, "Batch complete");

    BatchReport {
        key,
        outcomes,
        first_failure,
    }
}
