//! Edit engine
//!
//! Wires one instance of every component together so that batch items,
//! single edits and watchers all share the same worker pool, update chains
//! and event hubs.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::batch::{BatchEventReceiver, BatchEvents, BatchOrchestrator};
use crate::coalesce::UpdatePool;
use crate::config::EditEngineConfig;
use crate::edits::{EditOp, EditsService, Matcher};
use crate::error::Result;
use crate::reliability::ApiPoller;
use crate::resource::{RemoteResource, Resource};
use crate::watcher::ResourceWatcher;
use crate::worker::WorkerPool;

/// One edit of a batch: what to send where, and how to recognise it landed
#[derive(Clone)]
pub struct BatchEdit {
    pub target: Arc<dyn RemoteResource>,
    pub op: EditOp,
    pub observed: Arc<dyn RemoteResource>,
    pub matches: Matcher,
}

impl BatchEdit {
    /// Replace `target`'s data, confirmed by reading `target` back
    pub fn update(target: Arc<dyn RemoteResource>, data: Value) -> Self {
        Self {
            observed: Arc::clone(&target),
            target,
            op: EditOp::Update(data),
            matches: crate::edits::same_data(),
        }
    }
}

impl std::fmt::Debug for BatchEdit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchEdit")
            .field("target", &self.target.get_uri())
            .field("op", &self.op)
            .field("observed", &self.observed.get_uri())
            .finish()
    }
}

/// Shared batch edit machinery
///
/// Must be created from within a Tokio runtime. Clones share everything.
///
/// # Example
///
/// ```ignore
/// use batchedit_core::{BatchEdit, EditEngine, EditEngineConfig};
///
/// let engine = EditEngine::new(EditEngineConfig::from_env())?;
/// let mut events = engine.subscribe();
///
/// let edits = images.into_iter().map(|image| BatchEdit::update(image, json!({"archived": true})));
/// let archived = engine.apply_batch("archive", edits.collect()).await?;
/// ```
#[derive(Debug, Clone)]
pub struct EditEngine {
    config: Arc<EditEngineConfig>,
    batches: BatchOrchestrator,
    edits: EditsService<ApiPoller>,
}

impl EditEngine {
    /// Validate `config` and start the engine's worker pool
    pub fn new(config: EditEngineConfig) -> Result<Self> {
        config.validate()?;

        let watcher = ResourceWatcher::new();
        let pool = WorkerPool::new(config.worker_pool.clone());
        let events = BatchEvents::new();
        let edits = EditsService::new(UpdatePool::new(watcher), ApiPoller::new(config.poll.clone()));

        info!(
            max_workers = config.worker_pool.max_workers,
            poll_max_wait_ms = config.poll.max_wait.as_millis() as u64,
            "Edit engine ready"
        );

        Ok(Self {
            config: Arc::new(config),
            batches: BatchOrchestrator::new(pool, events),
            edits,
        })
    }

    /// Create an engine configured from the environment
    pub fn from_env() -> Result<Self> {
        Self::new(EditEngineConfig::from_env())
    }

    pub fn config(&self) -> &EditEngineConfig {
        &self.config
    }

    /// Per-resource `update-*` events
    pub fn watcher(&self) -> &ResourceWatcher {
        self.edits.watcher()
    }

    pub fn pool(&self) -> &WorkerPool {
        self.batches.pool()
    }

    pub fn batches(&self) -> &BatchOrchestrator {
        &self.batches
    }

    pub fn edits(&self) -> &EditsService<ApiPoller> {
        &self.edits
    }

    /// Batch lifecycle events of every batch run from now on
    pub fn subscribe(&self) -> BatchEventReceiver {
        self.batches.subscribe()
    }

    /// Apply and confirm every edit as one batch
    ///
    /// Each edit is one pool task, so a failing edit is retried with backoff
    /// and at most `max_workers` edits are in flight. Resolves with the
    /// confirmed resources in input order.
    pub async fn apply_batch(&self, key: &str, edits: Vec<BatchEdit>) -> Result<Vec<Resource>> {
        let service = self.edits.clone();
        self.batches
            .run_batch(key, edits, move |edit: BatchEdit| {
                service.apply(edit.target, edit.op, edit.observed, edit.matches)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EditError;
    use crate::reliability::PollConfig;
    use crate::resource::InMemoryResource;
    use crate::worker::WorkerPoolConfig;
    use serde_json::json;
    use std::time::Duration;

    fn quick_config() -> EditEngineConfig {
        EditEngineConfig::new()
            .with_worker_pool(
                WorkerPoolConfig::new()
                    .with_max_workers(2)
                    .with_max_retries(2)
                    .with_initial_backoff_wait(Duration::from_millis(1))
                    .with_jitter_max(Duration::ZERO),
            )
            .with_poll(
                PollConfig::new()
                    .with_poll_every(Duration::from_millis(5))
                    .with_jitter_max(Duration::ZERO),
            )
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let result = EditEngine::new(
            EditEngineConfig::new().with_poll(PollConfig::new().with_max_wait(Duration::ZERO)),
        );
        assert!(matches!(result, Err(EditError::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_batch_confirms_every_edit() {
        let engine = EditEngine::new(quick_config()).unwrap();
        let images: Vec<Arc<InMemoryResource>> = (0..4)
            .map(|i| Arc::new(InMemoryResource::new(format!("images/{i}"), json!({})).with_index_lag(1)))
            .collect();

        let edits = images
            .iter()
            .map(|image| BatchEdit::update(image.clone(), json!({"archived": true})))
            .collect();
        let confirmed = engine.apply_batch("archive", edits).await.unwrap();

        assert_eq!(confirmed.len(), 4);
        assert_eq!(confirmed[2].uri.as_str(), "images/2");
        assert!(images
            .iter()
            .all(|image| image.visible() == json!({"archived": true})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_writes_are_retried_through_the_pool() {
        let engine = EditEngine::new(quick_config()).unwrap();
        let image = Arc::new(InMemoryResource::new("images/flaky", json!(0)));
        image.fail_next_writes(2);

        let confirmed = engine
            .apply_batch("retry", vec![BatchEdit::update(image.clone(), json!(1))])
            .await
            .unwrap();

        assert_eq!(confirmed[0].data, json!(1));
        assert_eq!(image.writes(), 1);
    }
}
