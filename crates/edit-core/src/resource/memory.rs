//! In-memory implementation of RemoteResource for testing

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::trace;

use super::{RemoteResource, Resource, ResourceId};
use crate::error::{EditError, Result};

/// A write accepted by the API but not yet visible to readers
struct PendingWrite {
    data: Value,
    reads_left: usize,
}

struct State {
    visible: Value,
    pending: Option<PendingWrite>,
}

impl State {
    /// The state the next write builds on
    fn latest(&self) -> &Value {
        self.pending
            .as_ref()
            .map(|pending| &pending.data)
            .unwrap_or(&self.visible)
    }
}

/// In-memory remote resource with simulated index lag
///
/// Writes are acknowledged immediately but only become visible to `get`
/// after `index_lag` further reads, like a search index catching up. A
/// later write replaces any pending one and restarts the lag.
///
/// # Example
///
/// ```
/// use batchedit_core::InMemoryResource;
/// use serde_json::json;
///
/// let image = InMemoryResource::new("images/abc", json!({"labels": []}))
///     .with_index_lag(2);
/// assert_eq!(image.reads(), 0);
/// ```
pub struct InMemoryResource {
    uri: ResourceId,
    state: RwLock<State>,
    index_lag: usize,
    fail_writes: AtomicU32,
    reads: AtomicUsize,
    writes: AtomicUsize,
    actions: RwLock<Vec<String>>,
}

impl InMemoryResource {
    /// Create a resource whose initial data is immediately visible
    pub fn new(uri: impl Into<ResourceId>, data: Value) -> Self {
        Self {
            uri: uri.into(),
            state: RwLock::new(State {
                visible: data,
                pending: None,
            }),
            index_lag: 0,
            fail_writes: AtomicU32::new(0),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            actions: RwLock::new(Vec::new()),
        }
    }

    /// Number of reads a write stays invisible for
    pub fn with_index_lag(mut self, reads: usize) -> Self {
        self.index_lag = reads;
        self
    }

    /// Make the next `count` writes fail with a request error
    pub fn fail_next_writes(&self, count: u32) {
        self.fail_writes.store(count, Ordering::SeqCst);
    }

    /// Number of `get` calls so far
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of accepted writes so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Names of the actions performed, in order
    pub fn actions(&self) -> Vec<String> {
        self.actions.read().clone()
    }

    /// Data as a reader would currently see it, without counting as a read
    pub fn visible(&self) -> Value {
        self.state.read().visible.clone()
    }

    fn check_injected_failure(&self) -> Result<()> {
        let injected = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(EditError::request(format!("{}: injected write failure", self.uri)));
        }
        Ok(())
    }

    fn write(&self, apply: impl FnOnce(&Value) -> Value) -> Result<Resource> {
        self.check_injected_failure()?;

        let mut state = self.state.write();
        let data = apply(state.latest());
        if self.index_lag == 0 {
            state.visible = data.clone();
            state.pending = None;
        } else {
            state.pending = Some(PendingWrite {
                data: data.clone(),
                reads_left: self.index_lag,
            });
        }
        self.writes.fetch_add(1, Ordering::SeqCst);

        trace!(uri = %self.uri, lag = self.index_lag, "write accepted");
        Ok(Resource::new(self.uri.clone(), data))
    }
}

/// Append `data` to `current`, treating non-arrays as empty collections
fn append(current: &Value, data: Value) -> Value {
    let mut items = match current {
        Value::Array(items) => items.clone(),
        _ => Vec::new(),
    };
    match data {
        Value::Array(more) => items.extend(more),
        single => items.push(single),
    }
    Value::Array(items)
}

#[async_trait]
impl RemoteResource for InMemoryResource {
    fn get_uri(&self) -> ResourceId {
        self.uri.clone()
    }

    async fn get(&self) -> Result<Resource> {
        self.reads.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.write();
        let indexed = match state.pending.as_mut() {
            Some(pending) if pending.reads_left == 0 => true,
            Some(pending) => {
                pending.reads_left -= 1;
                false
            }
            None => false,
        };
        if indexed {
            if let Some(pending) = state.pending.take() {
                state.visible = pending.data;
            }
        }

        Ok(Resource::new(self.uri.clone(), state.visible.clone()))
    }

    async fn put(&self, data: Value) -> Result<Resource> {
        self.write(|_| data)
    }

    async fn post(&self, data: Value) -> Result<Resource> {
        self.write(|current| append(current, data))
    }

    async fn perform(&self, action: &str, body: Option<Value>) -> Result<Resource> {
        let resource = match body {
            Some(data) => self.write(|_| data)?,
            None => {
                self.check_injected_failure()?;
                Resource::new(self.uri.clone(), self.state.read().latest().clone())
            }
        };
        self.actions.write().push(action.to_string());
        Ok(resource)
    }

    async fn delete(&self) -> Result<()> {
        self.write(|_| Value::Null).map(|_| ())
    }
}

impl std::fmt::Debug for InMemoryResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryResource")
            .field("uri", &self.uri)
            .field("index_lag", &self.index_lag)
            .field("reads", &self.reads())
            .field("writes", &self.writes())
            .finish()
    }
}
