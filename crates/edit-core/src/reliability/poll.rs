//! Consistency polling
//!
//! The backing store indexes writes asynchronously, so a successful write
//! response does not mean readers can see it yet. A [`ConsistencyPoll`]
//! re-runs a read-and-check until it succeeds or gives up.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::backoff::BackoffPolicy;
use crate::error::{EditError, Result};
use crate::util::{duration_millis, env_parse};

/// Repeats a check until it passes
///
/// `check` fails while the expected state is not visible and succeeds once it
/// is. Implementations must give up after a bounded number of attempts or
/// amount of time; the enclosing update treats that as fatal.
#[async_trait]
pub trait ConsistencyPoll: Send + Sync {
    async fn poll<T, F, Fut>(&self, check: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static;
}

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollConfig {
    /// Wait after the first failed check (grows with `backoff_base`)
    #[serde(with = "duration_millis")]
    pub poll_every: Duration,

    /// Overall time budget for one poll
    #[serde(with = "duration_millis")]
    pub max_wait: Duration,

    /// Maximum number of checks per poll
    pub max_attempts: u32,

    /// Multiplier applied to the wait after each failed check
    pub backoff_base: f64,

    /// Upper bound of the random jitter added to every wait
    #[serde(with = "duration_millis")]
    pub jitter_max: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_every: Duration::from_millis(500),
            max_wait: Duration::from_secs(20),
            max_attempts: 10,
            backoff_base: 2.0,
            jitter_max: Duration::from_millis(100),
        }
    }
}

impl PollConfig {
    /// Create a new poll configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// - `POLL_EVERY_MS` (default 500)
    /// - `POLL_MAX_WAIT_MS` (default 20000)
    /// - `POLL_MAX_ATTEMPTS` (default 10)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_every: env_parse("POLL_EVERY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_every),
            max_wait: env_parse("POLL_MAX_WAIT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_wait),
            max_attempts: env_parse("POLL_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            ..defaults
        }
    }

    /// Set the initial poll interval
    pub fn with_poll_every(mut self, interval: Duration) -> Self {
        self.poll_every = interval;
        self
    }

    /// Set the overall time budget
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Set the maximum number of checks
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the backoff base
    pub fn with_backoff_base(mut self, base: f64) -> Self {
        self.backoff_base = base;
        self
    }

    /// Set the jitter upper bound
    pub fn with_jitter_max(mut self, jitter: Duration) -> Self {
        self.jitter_max = jitter;
        self
    }

    /// Backoff policy used between checks
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new()
            .with_initial_wait(self.poll_every)
            .with_base(self.backoff_base)
            .with_jitter_max(self.jitter_max)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_wait.is_zero() {
            return Err(EditError::config("poll max_wait must be greater than zero"));
        }
        if self.max_attempts == 0 {
            return Err(EditError::config("poll max_attempts must be at least 1"));
        }
        self.backoff().validate()
    }
}

/// Consistency poller bounded by both attempts and wall-clock time
///
/// # Example
///
/// ```ignore
/// use batchedit_core::{ApiPoller, ConsistencyPoll, PollConfig};
///
/// let poller = ApiPoller::new(PollConfig::default());
/// let image = poller
///     .poll(move || {
///         let image = image.clone();
///         async move {
///             let current = image.get().await?;
///             if labels_match(&current) { Ok(current) } else { Err(EditError::not_consistent("labels")) }
///         }
///     })
///     .await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ApiPoller {
    config: PollConfig,
}

impl ApiPoller {
    /// Create a new poller
    pub fn new(config: PollConfig) -> Self {
        Self { config }
    }

    /// Get the configuration
    pub fn config(&self) -> &PollConfig {
        &self.config
    }
}

#[async_trait]
impl ConsistencyPoll for ApiPoller {
    async fn poll<T, F, Fut>(&self, mut check: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let started = Instant::now();
        let backoff = self.config.backoff();
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0u32;
        let mut last_error = None;

        let checking = async {
            loop {
                attempts += 1;
                match check().await {
                    Ok(value) => return Ok(value),
                    Err(err) if attempts >= max_attempts => {
                        debug!(attempts, error = %err, "consistency check exhausted its attempts");
                        return Err(EditError::ConsistencyTimeout {
                            attempts,
                            elapsed: started.elapsed(),
                            last_error: Some(Box::new(err)),
                        });
                    }
                    Err(err) => {
                        let wait = backoff.wait_for(attempts - 1);
                        trace!(attempts, error = %err, wait_ms = wait.as_millis() as u64, "write not visible yet");
                        last_error = Some(Box::new(err));
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        };

        let outcome = tokio::time::timeout(self.config.max_wait, checking).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                debug!(attempts, max_wait = ?self.config.max_wait, "consistency check timed out");
                Err(EditError::ConsistencyTimeout {
                    attempts,
                    elapsed: started.elapsed(),
                    last_error,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config() -> PollConfig {
        PollConfig::new()
            .with_poll_every(Duration::from_millis(10))
            .with_jitter_max(Duration::ZERO)
            .with_max_wait(Duration::from_secs(5))
    }

    #[test]
    fn test_poll_config_defaults() {
        let config = PollConfig::default();
        assert_eq!(config.poll_every, Duration::from_millis(500));
        assert_eq!(config.max_wait, Duration::from_secs(20));
        assert_eq!(config.backoff_base, 2.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_poll_config_validation() {
        assert!(PollConfig::new()
            .with_max_wait(Duration::ZERO)
            .validate()
            .is_err());
        assert!(PollConfig::new().with_backoff_base(0.0).validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_resolves_once_check_passes() {
        let poller = ApiPoller::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let result = poller
            .poll(move || {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n >= 3 {
                        Ok(n)
                    } else {
                        Err(EditError::not_consistent("not indexed"))
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_gives_up_after_max_attempts() {
        let poller = ApiPoller::new(fast_config().with_max_attempts(4));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let result: Result<()> = poller
            .poll(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(EditError::not_consistent("never"))
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(EditError::ConsistencyTimeout { attempts: 4, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_poll_carries_failing_read() {
        let poller = ApiPoller::new(fast_config().with_max_attempts(2));

        let result: Result<()> = poller
            .poll(|| async { Err(EditError::request("GET images/a: 503")) })
            .await;

        match result {
            Err(EditError::ConsistencyTimeout {
                attempts,
                last_error,
                ..
            }) => {
                assert_eq!(attempts, 2);
                assert_eq!(last_error, Some(Box::new(EditError::request("GET images/a: 503"))));
            }
            other => panic!("expected a consistency timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_is_bounded_by_max_wait() {
        let config = fast_config()
            .with_max_attempts(u32::MAX)
            .with_backoff_base(1.0)
            .with_max_wait(Duration::from_millis(95));
        let poller = ApiPoller::new(config);

        let started = Instant::now();
        let result: Result<()> = poller
            .poll(|| async { Err(EditError::not_consistent("never")) })
            .await;

        assert!(matches!(
            result,
            Err(EditError::ConsistencyTimeout {
                last_error: Some(_),
                ..
            })
        ));
        assert!(started.elapsed() >= Duration::from_millis(95));
        assert!(started.elapsed() < Duration::from_millis(200));
    }
}
