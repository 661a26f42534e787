//! Batch operations
//!
//! ```text
//!   run_batch(key, items, action)
//!          │
//!          ├──▶ events:batch-operations:start {key, completed: 0, total}
//!          │
//!          ▼
//!   ┌──────────────┐   one task per item (or per item stage)
//!   │  WorkerPool  │──────────────────────────────────────────┐
//!   └──────────────┘                                          │
//!          │ each settled item                                │
//!          ├──▶ events:batch-operations:progress {key, completed}
//!          │                                                  │
//!          ▼ all settled                                      │
//!   events:batch-operations:complete {key} ◀──────────────────┘
//! ```

mod events;
mod orchestrator;

pub use events::{BatchEvent, BatchEventReceiver, BatchEvents};
pub use orchestrator::{stage, BatchOrchestrator, BatchReport, Stage};
