//! Remote resources
//!
//! Records live behind a hypermedia API and are addressed by URI. This crate
//! never interprets a record's fields; it only writes them, reads them back
//! and keys its bookkeeping by the URI.

mod memory;

pub use memory::InMemoryResource;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Stable key identifying a remotely stored, mutable record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Create an identity from a URI
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    /// The underlying URI
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ResourceId {
    fn from(uri: String) -> Self {
        Self(uri)
    }
}

impl From<&str> for ResourceId {
    fn from(uri: &str) -> Self {
        Self(uri.to_string())
    }
}

/// Snapshot of a record as returned by the API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub uri: ResourceId,
    pub data: Value,
}

impl Resource {
    pub fn new(uri: impl Into<ResourceId>, data: Value) -> Self {
        Self {
            uri: uri.into(),
            data,
        }
    }
}

/// A record reachable over the API
///
/// `get` must be safe to repeat; the consistency poller calls it until the
/// expected state shows up.
#[async_trait]
pub trait RemoteResource: Send + Sync {
    /// Identity of the record
    fn get_uri(&self) -> ResourceId;

    /// Read the current, possibly stale, state
    async fn get(&self) -> Result<Resource>;

    /// Replace the record's data
    async fn put(&self, data: Value) -> Result<Resource>;

    /// Add to the record, e.g. append to a collection
    async fn post(&self, data: Value) -> Result<Resource>;

    /// Invoke a named action, optionally with a body
    async fn perform(&self, action: &str, body: Option<Value>) -> Result<Resource>;

    /// Remove the record's data
    async fn delete(&self) -> Result<()>;
}
