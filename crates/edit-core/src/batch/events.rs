// Batch lifecycle events
//
// Every subscriber gets its own unbounded queue so any number of observers
// (a progress bar, a log sink, a UI bridge) can follow a batch without
// polling it and without losing events when they fall behind.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

/// Receiving end of a [`BatchEvents`] subscription
pub type BatchEventReceiver = mpsc::UnboundedReceiver<BatchEvent>;

/// Lifecycle event of one batch operation
///
/// Serialised with the event name as the `event` tag:
///
/// ```json
/// {"event": "events:batch-operations:progress", "key": "label", "completed": 3}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum BatchEvent {
    /// Fired once before any item runs
    #[serde(rename = "events:batch-operations:start")]
    Start {
        key: String,
        completed: usize,
        total: usize,
    },

    /// Fired once per settled item, `completed` strictly increasing
    #[serde(rename = "events:batch-operations:progress")]
    Progress { key: String, completed: usize },

    /// Fired once after every item settled, whatever the outcome
    #[serde(rename = "events:batch-operations:complete")]
    Complete { key: String },
}

impl BatchEvent {
    /// Key of the batch this event belongs to
    pub fn key(&self) -> &str {
        match self {
            BatchEvent::Start { key, .. }
            | BatchEvent::Progress { key, .. }
            | BatchEvent::Complete { key } => key,
        }
    }

    /// Event name
    pub fn name(&self) -> &'static str {
        match self {
            BatchEvent::Start { .. } => "events:batch-operations:start",
            BatchEvent::Progress { .. } => "events:batch-operations:progress",
            BatchEvent::Complete { .. } => "events:batch-operations:complete",
        }
    }
}

/// Fan-out hub for [`BatchEvent`]s
///
/// Publishing never blocks and never fails; with no subscribers events are
/// simply dropped. Each subscriber receives every event published after it
/// subscribed, in publish order. Dropping the receiver ends the subscription.
#[derive(Debug, Clone, Default)]
pub struct BatchEvents {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<BatchEvent>>>>,
}

impl BatchEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> BatchEventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Publish an event to current subscribers
    pub fn publish(&self, event: BatchEvent) {
        trace!(event = event.name(), key = event.key(), "batch event");
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| !subscriber.is_closed());
        subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_format() {
        let start = BatchEvent::Start {
            key: "label".into(),
            completed: 0,
            total: 15,
        };
        assert_eq!(
            serde_json::to_value(&start).unwrap(),
            json!({"event": "events:batch-operations:start", "key": "label", "completed": 0, "total": 15})
        );

        let complete: BatchEvent = serde_json::from_value(
            json!({"event": "events:batch-operations:complete", "key": "label"}),
        )
        .unwrap();
        assert_eq!(complete, BatchEvent::Complete { key: "label".into() });
        assert_eq!(complete.name(), "events:batch-operations:complete");
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let events = BatchEvents::new();
        let mut a = events.subscribe();
        let mut b = events.subscribe();
        assert_eq!(events.subscriber_count(), 2);

        events.publish(BatchEvent::Progress {
            key: "rights".into(),
            completed: 1,
        });

        assert_eq!(a.recv().await.unwrap().key(), "rights");
        assert_eq!(b.recv().await.unwrap().key(), "rights");
    }

    #[test]
    fn test_publish_without_subscribers() {
        BatchEvents::new().publish(BatchEvent::Complete { key: "x".into() });
    }

    #[test]
    fn test_slow_subscriber_keeps_every_event() {
        let events = BatchEvents::new();
        let mut rx = events.subscribe();

        for completed in 1..=5000 {
            events.publish(BatchEvent::Progress {
                key: "label".into(),
                completed,
            });
        }

        let mut received = Vec::new();
        while let Ok(BatchEvent::Progress { completed, .. }) = rx.try_recv() {
            received.push(completed);
        }
        assert_eq!(received, (1..=5000).collect::<Vec<_>>());
    }

    #[test]
    fn test_dropped_receiver_unsubscribes() {
        let events = BatchEvents::new();
        let rx = events.subscribe();
        let _kept = events.subscribe();
        assert_eq!(events.subscriber_count(), 2);

        drop(rx);
        events.publish(BatchEvent::Complete { key: "x".into() });
        assert_eq!(events.subscriber_count(), 1);
    }
}
