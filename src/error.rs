//! Engine error types and retry classification.
//!
//! Every failure path in the engine maps to one of these kinds; the outer
//! retry loops classify the kind, never the message text.

use thiserror::Error;

use crate::model::{JobId, TaskId, WorkerId};

#[derive(Error, Debug)]
pub enum EngineError {
    /// This replica is not the Raft leader. Callers follow the hint, or
    /// round-robin over known peers when no hint is available.
    #[error("not the leader{}", leader_hint.as_deref().map(|h| format!(" (leader: {h})")).unwrap_or_default())]
    NotLeader { leader_hint: Option<String> },

    /// The consensus log or object store cannot make progress. Retryable.
    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    /// Transient network or RPC failure. Retryable with backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// A proposed state transition was rejected by the state machine.
    #[error("rejected transition: {0}")]
    Rejected(String),

    /// An intermediate shard failed its checksum.
    #[error("shard corrupt: job {job_id} map {map_index} partition {partition}")]
    ShardCorrupt {
        job_id: JobId,
        map_index: u32,
        partition: u32,
    },

    /// A downloaded checkpoint did not match its committed log record.
    #[error("checkpoint invalid for {task}: {reason}")]
    CheckpointInvalid { task: TaskId, reason: String },

    #[error("unknown job {0}")]
    JobNotFound(JobId),

    #[error("unknown worker {0}")]
    WorkerNotFound(WorkerId),

    #[error("job {job_id} failed: {reason}")]
    JobFailed { job_id: JobId, reason: String },

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{0:#}")]
    Anyhow(#[from] anyhow::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Whether a caller-side retry with backoff can make progress.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Transient(_)
                | EngineError::Unavailable(_)
                | EngineError::NotLeader { .. }
                | EngineError::ObjectNotFound(_)
                | EngineError::Request(_)
        )
    }

    /// Leader hint carried by a `NotLeader` rejection, if any.
    pub fn leader_hint(&self) -> Option<&str> {
        match self {
            EngineError::NotLeader { leader_hint } => leader_hint.as_deref(),
            _ => None,
        }
    }
}
