//! Wire types for the worker↔leader and client↔leader RPC surfaces.
//!
//! The heartbeat reply is the only control channel from leader to worker:
//! assignments, cancellation, and checkpoint resume data all ride on it, so
//! workers behind NAT need nothing but an outbound HTTP client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{JobId, JobManifest, JobState, OutputLocation, TaskId, WorkerId};

// ── Worker ↔ leader ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub worker_id: WorkerId,
    pub heartbeat_interval_secs: u64,
}

/// Worker-reported state of its single task slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskStatus {
    Idle,
    Running {
        task: TaskId,
        attempt: u32,
        progress: f64,
        /// Reducers only: highest key fully processed so far.
        last_key: Option<String>,
        /// Reducers only: map task indices whose shards have been ingested.
        ingested_maps: Vec<u32>,
    },
    /// The task finished; outputs are fully persisted. Repeated until the
    /// leader acknowledges (completion entries are idempotent).
    Completing {
        task: TaskId,
        attempt: u32,
        outputs: Vec<OutputLocation>,
    },
    /// Self-detected failure (disk full, panic, bad input).
    Failed {
        task: TaskId,
        attempt: u32,
        reason: String,
    },
}

/// A reducer checkpoint whose aggregate object is already uploaded; the
/// leader's `ReduceCheckpointed` entry is the commit point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointReport {
    pub task: TaskId,
    pub attempt: u32,
    pub seq: u32,
    pub processed_keys: u64,
    pub last_key: String,
    pub aggregate_uri: String,
}

/// A shard that failed its checksum at a reducer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CorruptShardReport {
    pub job: JobId,
    pub map_index: u32,
    pub partition: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: WorkerId,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub corrupt_shards: Vec<CorruptShardReport>,
}

/// Where a replacement reducer resumes from (the R3 recovery path).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub checkpoint_uri: String,
    pub last_key: String,
    pub processed_keys: u64,
}

/// What the assigned task should read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskInput {
    Map {
        /// Object-store URI of this task's input split.
        split_uri: String,
        reduce_count: u32,
    },
    Reduce {
        /// One shard URI per completed map task, all for this partition.
        shard_uris: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume: Option<ResumePoint>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task: TaskId,
    pub attempt: u32,
    pub deadline: DateTime<Utc>,
    pub speculative: bool,
    pub code_ref: String,
    pub input: TaskInput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<TaskAssignment>,
    /// Abort the current task, discard temp files, go idle.
    #[serde(default)]
    pub cancel: bool,
}

// ── Client ↔ leader ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    pub manifest: JobManifest,
    /// Map count; computed from the manifest's splits when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_hint: Option<u32>,
    pub reduce_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task: TaskId,
    pub state: crate::model::TaskState,
    pub attempt: u32,
    pub progress: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub tasks: Vec<TaskReport>,
    /// Canonical output URIs, present once the job completes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_uris: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub node_id: u64,
    pub is_leader: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<u64>,
    pub term: u64,
    pub peers: Vec<String>,
    pub healthy: bool,
}

/// JSON body of a rejected request on a non-leader replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotLeaderBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_hint: Option<String>,
}

impl NotLeaderBody {
    pub fn new(leader_hint: Option<String>) -> Self {
        Self {
            error: "not_leader".into(),
            leader_hint,
        }
    }
}
