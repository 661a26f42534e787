//! Backoff policy implementation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{EditError, Result};
use crate::util::duration_millis;

/// Compute the wait before retry number `retry_count` (0-based).
///
/// `wait = initial_wait * base^retry_count + uniform(0, jitter_max)`
///
/// Grows without bound in `retry_count`; callers enforce their own retry
/// ceiling. Saturates at [`Duration::MAX`] instead of overflowing.
pub fn compute_wait(
    retry_count: u32,
    initial_wait: Duration,
    base: f64,
    jitter_max: Duration,
) -> Duration {
    compute_wait_with(
        &mut rand::thread_rng(),
        retry_count,
        initial_wait,
        base,
        jitter_max,
    )
}

/// Same as [`compute_wait`] but draws jitter from the given random source.
pub fn compute_wait_with<R: Rng + ?Sized>(
    rng: &mut R,
    retry_count: u32,
    initial_wait: Duration,
    base: f64,
    jitter_max: Duration,
) -> Duration {
    let floor = exponential_floor(retry_count, initial_wait, base);
    let jitter = if jitter_max.is_zero() {
        Duration::ZERO
    } else {
        rng.gen_range(Duration::ZERO..jitter_max)
    };
    floor.saturating_add(jitter)
}

fn exponential_floor(retry_count: u32, initial_wait: Duration, base: f64) -> Duration {
    let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
    let secs = initial_wait.as_secs_f64() * base.powi(exponent);
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Exponential backoff with additive jitter
///
/// Used by the worker pool between retries and by the consistency poller
/// between checks.
///
/// # Example
///
/// ```
/// use batchedit_core::BackoffPolicy;
/// use std::time::Duration;
///
/// let policy = BackoffPolicy::new()
///     .with_initial_wait(Duration::from_millis(500))
///     .with_base(2.0)
///     .without_jitter();
///
/// assert_eq!(policy.wait_for(0), Duration::from_millis(500));
/// assert_eq!(policy.wait_for(1), Duration::from_secs(1));
/// assert_eq!(policy.wait_for(2), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffPolicy {
    /// Wait before the first retry (excluding jitter)
    #[serde(with = "duration_millis")]
    pub initial_wait: Duration,

    /// Multiplier applied per retry
    pub base: f64,

    /// Upper bound (exclusive) of the random jitter added to every wait
    #[serde(with = "duration_millis")]
    pub jitter_max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_wait: Duration::from_millis(500),
            base: 2.0,
            jitter_max: Duration::from_millis(100),
        }
    }
}

impl BackoffPolicy {
    /// Create a policy with the default 500ms / 2x / 100ms jitter settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial wait
    pub fn with_initial_wait(mut self, wait: Duration) -> Self {
        self.initial_wait = wait;
        self
    }

    /// Set the backoff base
    pub fn with_base(mut self, base: f64) -> Self {
        self.base = base;
        self
    }

    /// Set the jitter upper bound
    pub fn with_jitter_max(mut self, jitter: Duration) -> Self {
        self.jitter_max = jitter;
        self
    }

    /// Disable jitter
    pub fn without_jitter(mut self) -> Self {
        self.jitter_max = Duration::ZERO;
        self
    }

    /// Wait before retry number `retry_count` (0-based)
    pub fn wait_for(&self, retry_count: u32) -> Duration {
        compute_wait(retry_count, self.initial_wait, self.base, self.jitter_max)
    }

    /// Like [`wait_for`](Self::wait_for) with an explicit random source
    pub fn wait_for_with<R: Rng + ?Sized>(&self, rng: &mut R, retry_count: u32) -> Duration {
        compute_wait_with(rng, retry_count, self.initial_wait, self.base, self.jitter_max)
    }

    /// Lower bound of the wait for `retry_count`, i.e. without jitter
    pub fn floor(&self, retry_count: u32) -> Duration {
        exponential_floor(retry_count, self.initial_wait, self.base)
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<()> {
        if !self.base.is_finite() || self.base < 1.0 {
            return Err(EditError::config(format!(
                "backoff base must be a finite number >= 1.0, got {}",
                self.base
            )));
        }
        Ok(())
    }
}
