use std::sync::Arc;

use anyhow::{Context, Result};
use batchedit_core::telemetry::{init_telemetry, TelemetryConfig};
use batchedit_core::{
    BatchEdit, BatchEvent, EditEngine, EditEngineConfig, EditOp, InMemoryResource, Matcher,
    RemoteResource, Resource, UpdateEvent,
};
use serde_json::json;

const LABEL: &str = "cat";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "batchedit_demo=info,batchedit_core=info")
    // - BATCH_* / POLL_*: engine settings, see EditEngineConfig::from_env
    // - DEMO_IMAGES: number of records to label (default: 15)
    let mut telemetry_config = TelemetryConfig::from_env().with_service_name("batchedit-demo");
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some("batchedit_demo=info,batchedit_core=info".to_string());
    }
    init_telemetry(telemetry_config);

    let config = EditEngineConfig::from_env();
    let engine = EditEngine::new(config).context("Invalid edit engine configuration")?;

    let count: usize = std::env::var("DEMO_IMAGES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(15);

    // Every fourth record's first write fails so the pool has something to retry.
    let labels: Vec<Arc<InMemoryResource>> = (0..count)
        .map(|i| {
            let resource = InMemoryResource::new(format!("images/{i}/labels"), json!([]))
                .with_index_lag(i % 3);
            if i % 4 == 0 {
                resource.fail_next_writes(1);
            }
            Arc::new(resource)
        })
        .collect();

    let mut subscriptions = Vec::with_capacity(labels.len());
    for resource in &labels {
        let uri = resource.get_uri();
        let failed = uri.clone();
        subscriptions.push(engine.watcher().on(&uri, UpdateEvent::UpdateError, move || {
            tracing::warn!(resource = %failed, "Label write failed");
        }));
    }

    let mut events = engine.subscribe();
    let reporter = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event {
                BatchEvent::Start { key, total, .. } => {
                    tracing::info!(key = %key, total, "Batch started")
                }
                BatchEvent::Progress { key, completed } => {
                    tracing::info!(key = %key, completed, "Batch progress")
                }
                BatchEvent::Complete { key } => {
                    tracing::info!(key = %key, "Batch complete");
                    break;
                }
            }
        }
    });

    let has_label: Matcher = Arc::new(|_: &Resource, observed: &Resource| {
        observed
            .data
            .as_array()
            .is_some_and(|labels| labels.contains(&json!(LABEL)))
    });
    let edits = labels
        .iter()
        .map(|resource| {
            let target: Arc<dyn RemoteResource> = resource.clone();
            BatchEdit {
                observed: Arc::clone(&target),
                target,
                op: EditOp::Add(json!([LABEL])),
                matches: Arc::clone(&has_label),
            }
        })
        .collect();

    tracing::info!(records = count, label = LABEL, "Labelling records");

    tokio::select! {
        result = engine.apply_batch("label", edits) => {
            let labelled = result.context("Label batch failed")?;
            tracing::info!(labelled = labelled.len(), "All records labelled");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            reporter.abort();
        }
    }

    reporter.await.ok();
    for subscription in &subscriptions {
        subscription.unsubscribe();
    }

    Ok(())
}
