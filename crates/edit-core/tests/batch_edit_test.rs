//! End-to-end batch edit tests against in-memory resources
//!
//! Run with: cargo test -p batchedit-core --test batch_edit_test

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use batchedit_core::prelude::*;
use serde_json::json;
use tokio::sync::Notify;

fn engine(max_retries: u32) -> EditEngine {
    let config = EditEngineConfig::new()
        .with_worker_pool(
            WorkerPoolConfig::new()
                .with_max_workers(5)
                .with_max_retries(max_retries)
                .with_initial_backoff_wait(Duration::from_millis(1))
                .with_jitter_max(Duration::ZERO),
        )
        .with_poll(
            PollConfig::new()
                .with_poll_every(Duration::from_millis(5))
                .with_backoff_base(1.0)
                .with_jitter_max(Duration::ZERO),
        );
    EditEngine::new(config).expect("valid config")
}

fn image(i: usize, lag: usize) -> Arc<InMemoryResource> {
    Arc::new(InMemoryResource::new(format!("images/{i}"), json!({"labels": []})).with_index_lag(lag))
}

fn count(watcher: &ResourceWatcher, resource: &ResourceId, event: UpdateEvent) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    watcher.on(resource, event, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    count
}

fn drain(rx: &mut BatchEventReceiver) -> Vec<BatchEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_batch_lifecycle_with_permanent_failures() {
    let engine = engine(1);
    let mut rx = engine.subscribe();

    let images: Vec<_> = (0..15).map(|i| image(i, 1)).collect();
    for broken in [3, 7, 11] {
        images[broken].fail_next_writes(u32::MAX);
    }

    let ends: Vec<_> = images
        .iter()
        .map(|image| count(engine.watcher(), &image.get_uri(), UpdateEvent::UpdateEnd))
        .collect();
    let errors = count(engine.watcher(), &images[7].get_uri(), UpdateEvent::UpdateError);

    let edits = images
        .iter()
        .map(|image| BatchEdit::update(image.clone(), json!({"labels": ["cat"]})))
        .collect();
    let result = engine.apply_batch("label", edits).await;

    let err = result.unwrap_err();
    assert!(matches!(err, EditError::BatchItem { .. }));
    assert!(matches!(err.root_cause(), EditError::Request(_)));

    let events = drain(&mut rx);
    assert_eq!(
        events.first(),
        Some(&BatchEvent::Start {
            key: "label".into(),
            completed: 0,
            total: 15
        })
    );
    let progress: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            BatchEvent::Progress { completed, .. } => Some(*completed),
            _ => None,
        })
        .collect();
    assert_eq!(progress, (1..=15).collect::<Vec<_>>());
    assert_eq!(events.last(), Some(&BatchEvent::Complete { key: "label".into() }));
    assert_eq!(events.len(), 17);

    for (i, ended) in ends.iter().enumerate() {
        let expected = if [3, 7, 11].contains(&i) { 0 } else { 1 };
        assert_eq!(ended.load(Ordering::SeqCst), expected, "image {i}");
    }
    // One failed chain per attempt: the first try and one retry.
    assert_eq!(errors.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_empty_batch_starts_and_completes() {
    let engine = engine(0);
    let mut rx = engine.subscribe();

    let confirmed = engine.apply_batch("nothing", Vec::new()).await.unwrap();

    assert!(confirmed.is_empty());
    assert_eq!(
        drain(&mut rx),
        vec![
            BatchEvent::Start {
                key: "nothing".into(),
                completed: 0,
                total: 0
            },
            BatchEvent::Complete {
                key: "nothing".into()
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_watchers_only_hear_their_resource() {
    let engine = engine(0);
    let a = image(1, 0);
    let b = image(2, 2);

    let a_events = count(engine.watcher(), &a.get_uri(), UpdateEvent::UpdateEnd);
    let b_events = count(engine.watcher(), &b.get_uri(), UpdateEvent::UpdateEnd);

    engine
        .apply_batch("b-only", vec![BatchEdit::update(b.clone(), json!({"labels": ["dog"]}))])
        .await
        .unwrap();

    assert_eq!(a_events.load(Ordering::SeqCst), 0);
    assert_eq!(b_events.load(Ordering::SeqCst), 1);
    assert_eq!(a.writes(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_single_edit_joins_batch_edit_of_same_record() {
    let engine = engine(0);
    let shared = image(1, 3);
    let uri = shared.get_uri();

    let started = Arc::new(Notify::new());
    let signal = Arc::clone(&started);
    let subscription = engine.watcher().on(&uri, UpdateEvent::UpdateStart, move || {
        signal.notify_one();
    });

    let batch = {
        let engine = engine.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            engine
                .apply_batch("label", vec![BatchEdit::update(shared, json!({"labels": ["v1"]}))])
                .await
        })
    };

    started.notified().await;
    assert!(engine.edits().updates().in_flight(&uri));
    let single = engine
        .edits()
        .update(shared.clone(), json!({"labels": ["v2"]}))
        .await
        .unwrap();

    let batch = batch.await.unwrap().unwrap();
    assert_eq!(single.data, json!({"labels": ["v2"]}));
    assert_eq!(batch[0].data, json!({"labels": ["v2"]}));
    assert_eq!(shared.visible(), json!({"labels": ["v2"]}));

    subscription.unsubscribe();
    subscription.unsubscribe();
    assert_eq!(
        engine.watcher().subscriber_count(&uri, UpdateEvent::UpdateStart),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_settled_batch_reports_partial_failure() {
    let engine = engine(0);
    let images: Vec<_> = (0..4).map(|i| image(i, 0)).collect();
    images[2].fail_next_writes(1);

    let edits = engine.edits().clone();
    let report = engine
        .batches()
        .run_batch_settled("rights", images.clone(), move |image| {
            edits.update(image, json!({"usage_rights": "handout"}))
        })
        .await;

    assert_eq!(report.succeeded(), 3);
    assert_eq!(report.failed(), 1);
    assert!(report.outcomes[2].is_err());
    assert!(matches!(
        report.first_failure(),
        Some(EditError::BatchItem { index: 2, .. })
    ));
}
