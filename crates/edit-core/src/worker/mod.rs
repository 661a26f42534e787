//! Worker pool for bounded, retrying task execution
//!
//! This module provides:
//! - [`WorkerPool`] - FIFO task admission with at most `max_workers` attempts in flight
//! - [`WorkerPoolConfig`] - Concurrency, retry ceiling and backoff settings
//! - [`TaskError`] - Why a submission did not produce a value
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                            │
//! │   submit() ──► FIFO queue ──► dispatcher                     │
//! │                                   │ acquire slot             │
//! │                                   ▼                          │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │        Attempts (Semaphore-limited, max_workers)     │    │
//! │  │  [Task 1] [Task 2] [Task 3] ... [Task N]             │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │           │ failed, retries left                             │
//! │           ▼                                                  │
//! │     backoff sleep (no slot held) ──► back of the queue       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod pool;

pub use pool::{TaskError, WorkerPool, WorkerPoolConfig};
