//! Reliability patterns for edit execution
//!
//! This module provides:
//! - [`BackoffPolicy`] - Exponential backoff with jitter between retries
//! - [`ConsistencyPoll`] / [`ApiPoller`] - Read-until-visible polling with a bounded budget

mod backoff;
mod poll;

pub use backoff::{compute_wait, compute_wait_with, BackoffPolicy};
pub use poll::{ApiPoller, ConsistencyPoll, PollConfig};
