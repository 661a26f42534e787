// Engine configuration
//
// EditEngineConfig gathers the settings of every component the engine wires
// together. It can be:
// - Created directly with the builder setters
// - Read from the environment via `from_env`
// - Deserialized from JSON (durations as milliseconds)

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::reliability::PollConfig;
use crate::worker::WorkerPoolConfig;

/// Configuration for an [`EditEngine`](crate::EditEngine)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EditEngineConfig {
    /// Worker pool used by batch operations
    #[serde(default)]
    pub worker_pool: WorkerPoolConfig,

    /// Consistency polling after each write
    #[serde(default)]
    pub poll: PollConfig,
}

impl EditEngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// See [`WorkerPoolConfig::from_env`] and [`PollConfig::from_env`].
    pub fn from_env() -> Self {
        Self {
            worker_pool: WorkerPoolConfig::from_env(),
            poll: PollConfig::from_env(),
        }
    }

    /// Set the worker pool configuration
    pub fn with_worker_pool(mut self, worker_pool: WorkerPoolConfig) -> Self {
        self.worker_pool = worker_pool;
        self
    }

    /// Set the polling configuration
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.worker_pool.validate()?;
        self.poll.validate()
    }
}
