//! Log commands applied by the coordinator state machine.
//!
//! These are the `D`/`R` application types carried through the Raft log.
//! Every timestamp and deadline is computed on the leader and embedded in
//! the entry, so followers apply identical state without reading clocks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{JobId, JobManifest, OutputLocation, Phase, WorkerId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogCommand {
    JobSubmitted {
        job_id: JobId,
        manifest: JobManifest,
        map_count: u32,
        reduce_count: u32,
        submitted_at: DateTime<Utc>,
    },
    WorkerRegistered {
        worker_id: WorkerId,
        address: String,
        registered_at: DateTime<Utc>,
    },
    TaskAssigned {
        job_id: JobId,
        phase: Phase,
        index: u32,
        worker_id: WorkerId,
        attempt: u32,
        deadline: DateTime<Utc>,
        speculative: bool,
    },
    TaskProgress {
        job_id: JobId,
        phase: Phase,
        index: u32,
        worker_id: WorkerId,
        attempt: u32,
        progress: f64,
        last_key: Option<String>,
        /// Reducers only: newly ingested map shard indices.
        ingested_maps: Vec<u32>,
        reported_at: DateTime<Utc>,
    },
    TaskCompleted {
        job_id: JobId,
        phase: Phase,
        index: u32,
        worker_id: WorkerId,
        attempt: u32,
        outputs: Vec<OutputLocation>,
        completed_at: DateTime<Utc>,
    },
    TaskFailed {
        job_id: JobId,
        phase: Phase,
        index: u32,
        /// Absent when the failure was detected by the leader rather than
        /// reported by a worker (e.g. lost shards).
        worker_id: Option<WorkerId>,
        attempt: u32,
        reason: String,
        failed_at: DateTime<Utc>,
    },
    WorkerDead {
        worker_id: WorkerId,
        detected_at: DateTime<Utc>,
    },
    ReduceCheckpointed {
        job_id: JobId,
        reduce_index: u32,
        attempt: u32,
        seq: u32,
        processed_keys: u64,
        last_key: String,
        aggregate_uri: String,
        created_at: DateTime<Utc>,
    },
    JobCancelled {
        job_id: JobId,
        reason: String,
        cancelled_at: DateTime<Utc>,
    },
}

impl LogCommand {
    /// Short name for tracing.
    pub fn kind(&self) -> &'static str {
        match self {
            LogCommand::JobSubmitted { .. } => "JobSubmitted",
            LogCommand::WorkerRegistered { .. } => "WorkerRegistered",
            LogCommand::TaskAssigned { .. } => "TaskAssigned",
            LogCommand::TaskProgress { .. } => "TaskProgress",
            LogCommand::TaskCompleted { .. } => "TaskCompleted",
            LogCommand::TaskFailed { .. } => "TaskFailed",
            LogCommand::WorkerDead { .. } => "WorkerDead",
            LogCommand::ReduceCheckpointed { .. } => "ReduceCheckpointed",
            LogCommand::JobCancelled { .. } => "JobCancelled",
        }
    }
}

/// Result of applying one committed entry. Returned to the proposer via
/// the consensus layer's client-write response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    Accepted,
    /// The entry re-stated something already recorded (idempotent apply).
    Duplicate,
    /// The transition was invalid and state is unchanged. The leader only
    /// proposes valid transitions; followers still validate to defend
    /// against bugs, so a rejection here is always logged loudly.
    Rejected { reason: String },
}

impl ApplyOutcome {
    pub fn rejected(reason: impl Into<String>) -> Self {
        ApplyOutcome::Rejected {
            reason: reason.into(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, ApplyOutcome::Accepted | ApplyOutcome::Duplicate)
    }
}
