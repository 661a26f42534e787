// Resource Watcher
//
// Per-resource registry of update lifecycle subscribers. Any component that
// writes a resource announces `update-start` / `update-end` / `update-error`
// here, and every observer of that resource hears about it regardless of
// which caller triggered the write.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::resource::ResourceId;

// ============================================================================
// UpdateEvent
// ============================================================================

/// Lifecycle events announced per resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateEvent {
    /// A write chain for the resource started
    UpdateStart,
    /// The write chain settled and the write is visible
    UpdateEnd,
    /// The write chain failed
    UpdateError,
}

impl UpdateEvent {
    /// All recognised events
    pub const ALL: [UpdateEvent; 3] = [
        UpdateEvent::UpdateStart,
        UpdateEvent::UpdateEnd,
        UpdateEvent::UpdateError,
    ];

    /// Wire name of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateEvent::UpdateStart => "update-start",
            UpdateEvent::UpdateEnd => "update-end",
            UpdateEvent::UpdateError => "update-error",
        }
    }
}

impl fmt::Display for UpdateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown event name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown update event: {0}")]
pub struct UnknownEvent(pub String);

impl FromStr for UpdateEvent {
    type Err = UnknownEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UpdateEvent::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| UnknownEvent(s.to_string()))
    }
}

// ============================================================================
// ResourceWatcher
// ============================================================================

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Subscriber {
    id: u64,
    callback: Callback,
}

#[derive(Default)]
struct WatcherEntry {
    subscribers: HashMap<UpdateEvent, Vec<Subscriber>>,
}

#[derive(Default)]
struct Registry {
    entries: DashMap<ResourceId, WatcherEntry>,
    next_id: AtomicU64,
}

/// Per-resource, per-event subscriber registry
///
/// Entries are created lazily on first subscription and never removed;
/// callers unsubscribe through the returned [`Subscription`]. Clones share
/// the same registry.
///
/// # Example
///
/// ```
/// use batchedit_core::{ResourceId, ResourceWatcher, UpdateEvent};
///
/// let watcher = ResourceWatcher::new();
/// let image = ResourceId::from("https://api.example/images/abc");
///
/// let saving = watcher.on(&image, UpdateEvent::UpdateStart, || println!("saving..."));
/// watcher.emit(&image, UpdateEvent::UpdateStart);
/// saving.unsubscribe();
/// ```
#[derive(Clone, Default)]
pub struct ResourceWatcher {
    registry: Arc<Registry>,
}

impl ResourceWatcher {
    /// Create an empty watcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `event` on `resource`
    pub fn on<F>(&self, resource: &ResourceId, event: UpdateEvent, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);

        self.registry
            .entries
            .entry(resource.clone())
            .or_default()
            .subscribers
            .entry(event)
            .or_default()
            .push(Subscriber {
                id,
                callback: Arc::new(callback),
            });

        trace!(resource = %resource, %event, subscription = id, "subscribed");

        Subscription {
            registry: Arc::downgrade(&self.registry),
            resource: resource.clone(),
            event,
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Invoke every callback registered for `event` on `resource`
    ///
    /// Callbacks run synchronously in registration order. The subscriber list
    /// is snapshotted first, so callbacks may subscribe or unsubscribe freely.
    /// Returns the number of callbacks invoked.
    pub fn emit(&self, resource: &ResourceId, event: UpdateEvent) -> usize {
        let callbacks: Vec<Callback> = match self.registry.entries.get(resource) {
            Some(entry) => entry
                .subscribers
                .get(&event)
                .map(|subs| subs.iter().map(|s| Arc::clone(&s.callback)).collect())
                .unwrap_or_default(),
            None => return 0,
        };

        trace!(resource = %resource, %event, subscribers = callbacks.len(), "emitting");

        for callback in &callbacks {
            callback();
        }
        callbacks.len()
    }

    /// Number of live subscribers for `event` on `resource`
    pub fn subscriber_count(&self, resource: &ResourceId, event: UpdateEvent) -> usize {
        self.registry
            .entries
            .get(resource)
            .and_then(|entry| entry.subscribers.get(&event).map(Vec::len))
            .unwrap_or(0)
    }
}

impl fmt::Debug for ResourceWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceWatcher")
            .field("resources", &self.registry.entries.len())
            .finish()
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Handle returned by [`ResourceWatcher::on`]
///
/// Dropping the handle does not unsubscribe; call
/// [`unsubscribe`](Self::unsubscribe), which is idempotent.
pub struct Subscription {
    registry: Weak<Registry>,
    resource: ResourceId,
    event: UpdateEvent,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    /// Stop delivering events to this callback
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }

        let Some(registry) = self.registry.upgrade() else {
            return;
        };

        if let Some(mut entry) = registry.entries.get_mut(&self.resource) {
            if let Some(subs) = entry.subscribers.get_mut(&self.event) {
                subs.retain(|s| s.id != self.id);
            }
        }

        trace!(resource = %self.resource, event = %self.event, subscription = self.id, "unsubscribed");
    }

    /// Whether the callback is still registered
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Resource this subscription listens to
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// Event this subscription listens to
    pub fn event(&self) -> UpdateEvent {
        self.event
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("resource", &self.resource)
            .field("event", &self.event)
            .field("active", &self.is_active())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
