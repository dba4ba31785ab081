//! Shared object storage.
//!
//! The object store is the only shared mutable resource outside the Raft
//! log. All writers go through write-temp-then-rename, so readers either
//! see a complete object or none at all; readers retry briefly on missing
//! objects to ride out in-flight renames.

mod fs;
pub mod paths;

pub use fs::FsStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{EngineError, Result};

/// Narrow contract over the external object store. Production backends are
/// out of scope; the filesystem implementation backs tests and single-box
/// clusters.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, uri: &str) -> Result<Vec<u8>>;

    /// Write the full object at `uri`, overwriting any existing object.
    /// Implementations must be atomic (temp name plus rename).
    async fn put(&self, uri: &str, data: &[u8]) -> Result<()>;

    /// Atomically rename `from` to `to`.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    async fn exists(&self, uri: &str) -> Result<bool>;

    async fn delete(&self, uri: &str) -> Result<()>;

    /// URIs under a prefix, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Fetch an object, retrying a missing read a few times to tolerate an
/// in-flight rename by the producer.
pub async fn get_with_retry(
    store: &Arc<dyn ObjectStore>,
    uri: &str,
    attempts: u32,
) -> Result<Vec<u8>> {
    let mut last = None;
    for attempt in 0..attempts {
        match store.get(uri).await {
            Ok(data) => return Ok(data),
            Err(err @ EngineError::ObjectNotFound(_)) => {
                last = Some(err);
                tokio::time::sleep(Duration::from_millis(50 << attempt.min(4))).await;
            }
            Err(other) => return Err(other),
        }
    }
    Err(last.unwrap_or_else(|| EngineError::ObjectNotFound(uri.to_string())))
}
