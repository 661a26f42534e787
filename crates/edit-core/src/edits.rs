//! Edits service
//!
//! Writes to a remote resource through the [`UpdatePool`] and only resolves
//! once a read of the observed resource reflects the write.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::coalesce::UpdatePool;
use crate::error::{EditError, Result};
use crate::reliability::{ApiPoller, ConsistencyPoll};
use crate::resource::{RemoteResource, Resource};
use crate::watcher::ResourceWatcher;

/// A write against a remote resource
#[derive(Debug, Clone, PartialEq)]
pub enum EditOp {
    /// POST, e.g. append to a collection
    Add(Value),
    /// PUT, replace the data
    Update(Value),
    /// DELETE
    Remove,
    /// Named action, optionally with a body
    Perform { action: String, body: Option<Value> },
}

impl EditOp {
    pub fn name(&self) -> &str {
        match self {
            EditOp::Add(_) => "add",
            EditOp::Update(_) => "update",
            EditOp::Remove => "remove",
            EditOp::Perform { action, .. } => action,
        }
    }

    async fn send(self, target: &dyn RemoteResource) -> Result<Resource> {
        match self {
            EditOp::Add(data) => target.post(data).await,
            EditOp::Update(data) => target.put(data).await,
            EditOp::Remove => {
                target.delete().await?;
                Ok(Resource::new(target.get_uri(), Value::Null))
            }
            EditOp::Perform { action, body } => target.perform(&action, body).await,
        }
    }
}

/// Decides whether an observed read reflects a write
///
/// Called with the resource returned by the write and the resource just read.
pub type Matcher = Arc<dyn Fn(&Resource, &Resource) -> bool + Send + Sync>;

/// The observed data equals the written data
pub fn same_data() -> Matcher {
    Arc::new(|written: &Resource, observed: &Resource| {
        written.data == observed.data
    })
}

/// The observed data is gone
pub fn removed() -> Matcher {
    Arc::new(|_: &Resource, observed: &Resource| observed.data.is_null())
}

/// Applies confirmed edits to remote resources
///
/// Edits are coalesced per target URI: concurrent edits of one record all
/// resolve with the outcome of the most recent one.
pub struct EditsService<P = ApiPoller> {
    updates: UpdatePool<Resource>,
    poller: Arc<P>,
}

impl<P> Clone for EditsService<P> {
    fn clone(&self) -> Self {
        Self {
            updates: self.updates.clone(),
            poller: Arc::clone(&self.poller),
        }
    }
}

impl<P> EditsService<P>
where
    P: ConsistencyPoll + 'static,
{
    pub fn new(updates: UpdatePool<Resource>, poller: P) -> Self {
        Self {
            updates,
            poller: Arc::new(poller),
        }
    }

    /// Watcher on which edits announce `update-*` events
    pub fn watcher(&self) -> &ResourceWatcher {
        self.updates.watcher()
    }

    /// The coalescing pool edits go through
    pub fn updates(&self) -> &UpdatePool<Resource> {
        &self.updates
    }

    /// Send `op` to `target`, then poll `observed` until `matches` holds
    ///
    /// Resolves with the observed resource. `observed` is usually `target`
    /// itself, or the parent record whose representation embeds it.
    pub fn apply(
        &self,
        target: Arc<dyn RemoteResource>,
        op: EditOp,
        observed: Arc<dyn RemoteResource>,
        matches: Matcher,
    ) -> impl Future<Output = Result<Resource>> + Send + 'static {
        let uri = target.get_uri();
        debug!(resource = %uri, op = op.name(), "applying edit");

        let poller = Arc::clone(&self.poller);
        self.updates.update(
            &uri,
            move || async move { op.send(target.as_ref()).await },
            move |written: Resource| async move {
                poller
                    .poll(move || {
                        let observed = Arc::clone(&observed);
                        let matches = Arc::clone(&matches);
                        let written = written.clone();
                        async move {
                            let current = observed.get().await?;
                            if matches(&written, &current) {
                                Ok(current)
                            } else {
                                Err(EditError::not_consistent(format!(
                                    "{} does not reflect the write yet",
                                    current.uri
                                )))
                            }
                        }
                    })
                    .await
            },
        )
    }

    /// POST `data` to `target`
    pub fn add(
        &self,
        target: Arc<dyn RemoteResource>,
        data: Value,
        observed: Arc<dyn RemoteResource>,
        matches: Matcher,
    ) -> impl Future<Output = Result<Resource>> + Send + 'static {
        self.apply(target, EditOp::Add(data), observed, matches)
    }

    /// PUT `data` to `target`, confirmed once `target` reads back the same data
    pub fn update(
        &self,
        target: Arc<dyn RemoteResource>,
        data: Value,
    ) -> impl Future<Output = Result<Resource>> + Send + 'static {
        let observed = Arc::clone(&target);
        self.apply(target, EditOp::Update(data), observed, same_data())
    }

    /// DELETE `target`, confirmed once `target` reads back empty
    pub fn remove(
        &self,
        target: Arc<dyn RemoteResource>,
    ) -> impl Future<Output = Result<Resource>> + Send + 'static {
        let observed = Arc::clone(&target);
        self.apply(target, EditOp::Remove, observed, removed())
    }

    /// Invoke `action` on `target`
    pub fn perform(
        &self,
        target: Arc<dyn RemoteResource>,
        action: impl Into<String>,
        body: Option<Value>,
        observed: Arc<dyn RemoteResource>,
        matches: Matcher,
    ) -> impl Future<Output = Result<Resource>> + Send + 'static {
        let op = EditOp::Perform {
            action: action.into(),
            body,
        };
        self.apply(target, op, observed, matches)
    }
}

impl<P> fmt::Debug for EditsService<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EditsService")
            .field("updates", &self.updates)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::PollConfig;
    use crate::resource::InMemoryResource;
    use crate::watcher::UpdateEvent;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn service(max_attempts: u32) -> EditsService {
        let poller = ApiPoller::new(
            PollConfig::new()
                .with_poll_every(Duration::from_millis(5))
                .with_backoff_base(1.0)
                .with_jitter_max(Duration::ZERO)
                .with_max_attempts(max_attempts),
        );
        EditsService::new(UpdatePool::new(ResourceWatcher::new()), poller)
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_waits_for_index() {
        let edits = service(10);
        let image = Arc::new(InMemoryResource::new("images/a", json!({"title": "old"})).with_index_lag(3));

        let confirmed = edits
            .update(image.clone(), json!({"title": "new"}))
            .await
            .unwrap();

        assert_eq!(confirmed.data, json!({"title": "new"}));
        assert_eq!(image.reads(), 4);
        assert_eq!(image.writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unindexed_write_times_out() {
        let edits = service(3);
        let image = Arc::new(InMemoryResource::new("images/a", json!(1)).with_index_lag(10));
        let errors = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&errors);
        edits.watcher().on(&"images/a".into(), UpdateEvent::UpdateError, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let result = edits.update(image.clone(), json!(2)).await;

        assert!(matches!(
            result,
            Err(EditError::ConsistencyTimeout { attempts: 3, .. })
        ));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(!edits.updates().in_flight(&"images/a".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_label_to_collection() {
        let edits = service(10);
        let labels: Arc<dyn RemoteResource> =
            Arc::new(InMemoryResource::new("images/a/labels", json!(["cat"])).with_index_lag(1));

        let contains_dog: Matcher = Arc::new(|_: &Resource, observed: &Resource| {
            observed
                .data
                .as_array()
                .is_some_and(|labels| labels.contains(&json!("dog")))
        });
        let confirmed = edits
            .add(labels.clone(), json!(["dog"]), labels, contains_dog)
            .await
            .unwrap();

        assert_eq!(confirmed.data, json!(["cat", "dog"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_and_perform() {
        let edits = service(10);
        let image = Arc::new(InMemoryResource::new("images/a", json!({"archived": false})).with_index_lag(1));

        let archived: Matcher =
            Arc::new(|_: &Resource, observed: &Resource| observed.data["archived"] == json!(true));
        edits
            .perform(
                image.clone(),
                "archive",
                Some(json!({"archived": true})),
                image.clone(),
                archived,
            )
            .await
            .unwrap();
        assert_eq!(image.actions(), vec!["archive"]);

        let gone = edits.remove(image.clone()).await.unwrap();
        assert_eq!(gone.data, Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_edits_share_latest_outcome() {
        let edits = service(10);
        let image = Arc::new(InMemoryResource::new("images/a", json!("v0")).with_index_lag(2));

        let first = edits.update(image.clone(), json!("v1"));
        let second = edits.update(image.clone(), json!("v2"));
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.unwrap().data, json!("v2"));
        assert_eq!(second.unwrap().data, json!("v2"));
        assert_eq!(image.visible(), json!("v2"));
    }

    #[test]
    fn test_op_names() {
        assert_eq!(EditOp::Add(json!(1)).name(), "add");
        assert_eq!(EditOp::Remove.name(), "remove");
        assert_eq!(
            EditOp::Perform {
                action: "archive".into(),
                body: None
            }
            .name(),
            "archive"
        );
    }
}
