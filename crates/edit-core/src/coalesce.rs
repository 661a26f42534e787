//! Update coalescing
//!
//! Several callers may edit the same resource at once (two label editors,
//! a batch and a single edit...). The [`UpdatePool`] keeps one chain per
//! resource: every update joins the chain, the most recently registered
//! attempt decides the outcome, and every joined caller receives that same
//! outcome together.
//!
//! ```text
//! caller A ──update──▶ ┌───────────────────────┐
//!                      │ chain(resource)       │──▶ update-start
//! caller B ──update──▶ │ attempts: A, B(latest)│
//!                      └──────────┬────────────┘
//!                                 │ B settles
//!                                 ▼
//!                      A and B receive B's outcome ──▶ update-end / update-error
//! ```
//!
//! Outcomes of superseded attempts are discarded. Attempts are spawned, so a
//! caller that stops waiting never strands the other callers of its chain.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::{EditError, Result};
use crate::resource::ResourceId;
use crate::watcher::{ResourceWatcher, UpdateEvent};

/// Per-resource chain state
struct ChainEntry<T> {
    chain: u64,
    latest: u64,
    joined: usize,
    outcome: watch::Sender<Option<Result<T>>>,
    /// Held by the chain creator while `update-start` is emitted
    announcing: Arc<Mutex<()>>,
}

struct Inner<T> {
    watcher: ResourceWatcher,
    chains: Mutex<HashMap<ResourceId, ChainEntry<T>>>,
    next_id: AtomicU64,
}

impl<T> Inner<T> {
    /// Publish `outcome` if `generation` is still the latest attempt of `chain`
    fn settle(&self, resource: &ResourceId, chain: u64, generation: u64, outcome: Result<T>) {
        let entry = {
            let mut chains = self.chains.lock();
            let current = chains
                .get(resource)
                .is_some_and(|entry| entry.chain == chain && entry.latest == generation);
            if current {
                chains.remove(resource)
            } else {
                None
            }
        };

        let Some(entry) = entry else {
            debug!(resource = %resource, chain, generation, "superseded update attempt discarded");
            return;
        };

        let event = match &outcome {
            Ok(_) => UpdateEvent::UpdateEnd,
            Err(err) => {
                debug!(resource = %resource, chain, error = %err, "update chain failed");
                UpdateEvent::UpdateError
            }
        };
        trace!(resource = %resource, chain, callers = entry.joined, %event, "update chain settled");

        // update-start must reach every observer first.
        drop(entry.announcing.lock());
        self.watcher.emit(resource, event);
        entry.outcome.send_replace(Some(outcome));
    }
}

/// One registered attempt; settles as abandoned if dropped unsettled (e.g. on
/// runtime shutdown)
struct Attempt<T> {
    inner: Arc<Inner<T>>,
    resource: ResourceId,
    chain: u64,
    generation: u64,
    settled: bool,
}

impl<T> Attempt<T> {
    fn settle(mut self, outcome: Result<T>) {
        self.settled = true;
        self.inner
            .settle(&self.resource, self.chain, self.generation, outcome);
    }
}

impl<T> Drop for Attempt<T> {
    fn drop(&mut self) {
        if !self.settled {
            let abandoned = Err(EditError::ChainAbandoned(self.resource.to_string()));
            self.inner
                .settle(&self.resource, self.chain, self.generation, abandoned);
        }
    }
}

/// Coalesces concurrent updates per resource
///
/// Clones share the same chains. Must be used from within a Tokio runtime.
///
/// # Example
///
/// ```ignore
/// use batchedit_core::{ResourceWatcher, UpdatePool};
///
/// let pool = UpdatePool::new(ResourceWatcher::new());
/// let image = pool
///     .update(
///         &uri,
///         move || async move { labels.post(json!(["cat"])).await },
///         move |_| async move { poller.poll(check_labels).await },
///     )
///     .await?;
/// ```
pub struct UpdatePool<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for UpdatePool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> UpdatePool<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a pool announcing lifecycle events on `watcher`
    pub fn new(watcher: ResourceWatcher) -> Self {
        Self {
            inner: Arc::new(Inner {
                watcher,
                chains: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Write to `resource` and wait until the write is confirmed
    ///
    /// `perform` is called immediately and its result handed to `confirm`,
    /// which must resolve once readers can see the write (and must give up
    /// eventually). The update is registered at call time: if a chain for
    /// `resource` is already in flight this attempt becomes its latest
    /// registration, and the returned future yields whatever the latest
    /// registration of the chain settles with.
    ///
    /// `update-start` fires when a chain begins, `update-end` or
    /// `update-error` right before its callers are released. A chain that
    /// settles while its `update-start` callbacks are still running waits for
    /// them, so observers never see the end of a chain before its start.
    pub fn update<P, PFut, R, C, CFut>(
        &self,
        resource: &ResourceId,
        perform: P,
        confirm: C,
    ) -> impl Future<Output = Result<T>> + Send + 'static
    where
        P: FnOnce() -> PFut,
        PFut: Future<Output = Result<R>> + Send + 'static,
        R: Send + 'static,
        C: FnOnce(R) -> CFut + Send + 'static,
        CFut: Future<Output = Result<T>> + Send + 'static,
    {
        let generation = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let announcing = Arc::new(Mutex::new(()));

        let (chain, outcome, start_guard) = {
            let mut chains = self.inner.chains.lock();
            match chains.get_mut(resource) {
                Some(entry) => {
                    entry.latest = generation;
                    entry.joined += 1;
                    (entry.chain, entry.outcome.subscribe(), None)
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    // Taken before the chain is visible so no settle can overtake the start event.
                    let guard = announcing.lock();
                    chains.insert(
                        resource.clone(),
                        ChainEntry {
                            chain: generation,
                            latest: generation,
                            joined: 1,
                            outcome: tx,
                            announcing: Arc::clone(&announcing),
                        },
                    );
                    (generation, rx, Some(guard))
                }
            }
        };

        if let Some(guard) = start_guard {
            debug!(resource = %resource, chain, "update chain started");
            self.inner.watcher.emit(resource, UpdateEvent::UpdateStart);
            drop(guard);
        } else {
            debug!(resource = %resource, chain, generation, "joined in-flight update chain");
        }

        let attempt = Attempt {
            inner: Arc::clone(&self.inner),
            resource: resource.clone(),
            chain,
            generation,
            settled: false,
        };
        let write = perform();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(async move {
                match write.await {
                    Ok(raw) => confirm(raw).await,
                    Err(err) => Err(err),
                }
            })
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(EditError::ChainAbandoned(attempt.resource.to_string())));
            attempt.settle(outcome);
        });

        let resource = resource.clone();
        async move {
            let mut outcome = outcome;
            let settled = match outcome.wait_for(Option::is_some).await {
                Ok(value) => (*value).clone(),
                Err(_) => None,
            };
            settled.unwrap_or_else(|| Err(EditError::ChainAbandoned(resource.to_string())))
        }
    }

    /// Whether a chain is in flight for `resource`
    pub fn in_flight(&self, resource: &ResourceId) -> bool {
        self.inner.chains.lock().contains_key(resource)
    }

    /// Number of resources with an in-flight chain
    pub fn active_chains(&self) -> usize {
        self.inner.chains.lock().len()
    }

    /// The watcher lifecycle events are announced on
    pub fn watcher(&self) -> &ResourceWatcher {
        &self.inner.watcher
    }
}

impl<T> std::fmt::Debug for UpdatePool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdatePool")
            .field("active_chains", &self.inner.chains.lock().len())
            .finish()
    }
}
