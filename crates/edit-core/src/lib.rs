//! # Batch Edit Core
//!
//! Concurrency machinery for applying edits to many remotely stored records
//! at once, where the backing store indexes writes asynchronously.
//!
//! ## Features
//!
//! - **Bounded worker pool**: at most `max_workers` operations in flight, FIFO admission
//! - **Automatic retries**: exponential backoff with jitter; backoff never holds a worker slot
//! - **Update coalescing**: concurrent edits of one record resolve together with the latest outcome
//! - **Consistency polling**: a write only counts once readers can see it
//! - **Lifecycle events**: per-resource `update-*` watchers and batch start/progress/complete events delivered to every subscriber
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    BatchOrchestrator                         │
//! │  (one pool task per item, start/progress/complete events)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  (bounded concurrency, retries with BackoffPolicy)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ per-item action
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │               EditsService / UpdatePool                      │
//! │  (coalesces per resource, emits update-* on ResourceWatcher)│
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          RemoteResource  +  ConsistencyPoll (ApiPoller)      │
//! │  (write, then read until the write is visible)              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use batchedit_core::prelude::*;
//!
//! let engine = EditEngine::new(EditEngineConfig::from_env())?;
//! let mut events = engine.subscribe();
//!
//! let edits = images
//!     .into_iter()
//!     .map(|image| BatchEdit::update(image, json!({"usage_rights": {"category": "handout"}})))
//!     .collect();
//! let updated = engine.apply_batch("usage-rights", edits).await?;
//! ```

pub mod batch;
pub mod coalesce;
pub mod config;
pub mod edits;
pub mod engine;
pub mod error;
pub mod reliability;
pub mod resource;
pub mod telemetry;
pub mod watcher;
pub mod worker;

mod util;

/// Prelude for common imports
pub mod prelude {
    pub use crate::batch::{
        stage, BatchEvent, BatchEventReceiver, BatchEvents, BatchOrchestrator, BatchReport, Stage,
    };
    pub use crate::coalesce::UpdatePool;
    pub use crate::config::EditEngineConfig;
    pub use crate::edits::{EditOp, EditsService, Matcher};
    pub use crate::engine::{BatchEdit, EditEngine};
    pub use crate::error::{EditError, Result};
    pub use crate::reliability::{ApiPoller, BackoffPolicy, ConsistencyPoll, PollConfig};
    pub use crate::resource::{InMemoryResource, RemoteResource, Resource, ResourceId};
    pub use crate::watcher::{ResourceWatcher, Subscription, UpdateEvent};
    pub use crate::worker::{TaskError, WorkerPool, WorkerPoolConfig};
}

// Re-export key types at crate root
pub use batch::{
    stage, BatchEvent, BatchEventReceiver, BatchEvents, BatchOrchestrator, BatchReport, Stage,
};
pub use coalesce::UpdatePool;
pub use config::EditEngineConfig;
pub use edits::{EditOp, EditsService, Matcher};
pub use engine::{BatchEdit, EditEngine};
pub use error::{EditError, Result};
pub use reliability::{
    compute_wait, compute_wait_with, ApiPoller, BackoffPolicy, ConsistencyPoll, PollConfig,
};
pub use resource::{InMemoryResource, RemoteResource, Resource, ResourceId};
pub use watcher::{ResourceWatcher, Subscription, UpdateEvent};
pub use worker::{TaskError, WorkerPool, WorkerPoolConfig};
