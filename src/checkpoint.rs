//! Reducer-side checkpoint management.
//!
//! A checkpoint is the serialized partial aggregate plus the watermark of
//! keys fully processed. The aggregate object is uploaded first; the
//! leader's `ReduceCheckpointed` log entry is the commit point, so a
//! checkpoint object with no matching entry is simply garbage to collect.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::ResumePoint;
use crate::error::{EngineError, Result};
use crate::model::TaskId;
use crate::storage::{self, ObjectStore};

/// On-store checkpoint payload. The aggregate bytes are opaque to the
/// engine; only the owning job's user code can interpret them.
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointPayload {
    pub processed_keys: u64,
    pub last_key: String,
    pub aggregate: Vec<u8>,
}

/// Write a checkpoint object for one reduce attempt. Returns the URI to
/// carry in the next heartbeat's checkpoint report.
pub async fn write_checkpoint(
    store: &Arc<dyn ObjectStore>,
    uri: &str,
    processed_keys: u64,
    last_key: &str,
    aggregate: Vec<u8>,
) -> Result<()> {
    let payload = CheckpointPayload {
        processed_keys,
        last_key: last_key.to_string(),
        aggregate,
    };
    store.put(uri, &serde_json::to_vec(&payload)?).await?;
    debug!(uri, processed_keys, last_key, "checkpoint written");
    Ok(())
}

/// Download and validate a committed checkpoint before resuming from it.
///
/// The payload must agree with the log entry it was committed under, and
/// its watermark key must actually occur in the shard set the replacement
/// attempt will read. Any mismatch demotes the resume to a clean restart.
pub async fn load_checkpoint(
    store: &Arc<dyn ObjectStore>,
    task: TaskId,
    resume: &ResumePoint,
    shard_records: &[Vec<(String, String)>],
) -> Result<CheckpointPayload> {
    let bytes = storage::get_with_retry(store, &resume.checkpoint_uri, 3).await?;
    let payload: CheckpointPayload = serde_json::from_slice(&bytes).map_err(|err| {
        EngineError::CheckpointInvalid {
            task,
            reason: format!("undecodable payload: {err}"),
        }
    })?;
    if payload.processed_keys != resume.processed_keys {
        return Err(EngineError::CheckpointInvalid {
            task,
            reason: format!(
                "processed-key count {} does not match committed record {}",
                payload.processed_keys, resume.processed_keys
            ),
        });
    }
    if payload.last_key != resume.last_key {
        return Err(EngineError::CheckpointInvalid {
            task,
            reason: "watermark key does not match committed record".into(),
        });
    }
    let key_present = shard_records
        .iter()
        .any(|records| records.iter().any(|(k, _)| k == &payload.last_key));
    if !key_present {
        return Err(EngineError::CheckpointInvalid {
            task,
            reason: format!("watermark key {:?} absent from shard set", payload.last_key),
        });
    }
    Ok(payload)
}

/// Best-effort removal of superseded checkpoint objects under a reduce
/// task's prefix, keeping `keep_uri`. The object store is the only durable
/// home, so failures here only delay reclamation.
pub async fn collect_superseded(
    store: &Arc<dyn ObjectStore>,
    prefix: &str,
    keep_uri: &str,
) {
    let Ok(uris) = store.list(prefix).await else {
        return;
    };
    for uri in uris {
        if uri == keep_uri || !uri.contains("/checkpoint-") {
            continue;
        }
        if let Err(err) = store.delete(&uri).await {
            warn!(%uri, %err, "failed to collect superseded checkpoint");
        }
    }
}
