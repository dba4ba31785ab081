//! Replicated data model: jobs, tasks, workers, checkpoints.
//!
//! All entities live inside the coordinator state machine and are addressed
//! by stable ids, never by reference. Everything here is serde-serializable
//! because the full state machine is shipped in Raft snapshots.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Job identifier. ULIDs sort by creation time, which keeps snapshot maps
/// and log output stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Ulid::from_string(s).ok().map(Self)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Worker identifier, assigned by the leader at registration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn generate() -> Self {
        Self(format!("w-{}", uuid::Uuid::new_v4()))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the shuffle a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Map,
    Reduce,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Map => write!(f, "map"),
            Phase::Reduce => write!(f, "reduce"),
        }
    }
}

/// Stable task address: (job, phase, index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub job: JobId,
    pub phase: Phase,
    pub index: u32,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.job, self.phase, self.index)
    }
}

/// Immutable per-job manifest supplied at submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobManifest {
    /// Object-store URIs of the input splits; one map task per split unless
    /// an explicit map count is given at submission.
    pub inputs: Vec<String>,
    /// Name of the registered mapper/reducer pair to run.
    pub code_ref: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Mapping,
    Reducing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Idle,
    Assigned,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Alive,
    Suspect,
    Dead,
}

/// One finished output object, with enough metadata for readers to detect
/// loss or corruption without re-reading the producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLocation {
    pub uri: String,
    pub size: u64,
    /// Hex SHA-256 of the object bytes.
    pub checksum: String,
}

/// A live lease of a task on a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub worker: WorkerId,
    pub attempt: u32,
    pub deadline: DateTime<Utc>,
    pub speculative: bool,
}

/// Durable record of reducer progress for one (job, reduceIndex, attempt).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceCheckpoint {
    pub attempt: u32,
    pub seq: u32,
    pub processed_keys: u64,
    pub last_key: String,
    pub aggregate_uri: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub state: TaskState,
    /// Live leases. At most one, except a speculative pair.
    pub assignments: Vec<Assignment>,
    /// Monotonic count of assignments ever made for this task.
    pub attempt: u32,
    pub last_deadline: Option<DateTime<Utc>>,
    /// Map: R shard locations. Reduce: one final location.
    pub output_locations: Vec<OutputLocation>,
    /// Attempt whose outputs were accepted, once `Completed`.
    pub completed_attempt: Option<u32>,
    /// Worker that produced the accepted outputs.
    pub completed_by: Option<WorkerId>,
    pub progress: f64,
    /// Highest attempt that has logged a `TaskProgress` entry.
    pub progress_attempt: Option<u32>,
    pub last_key: Option<String>,
    /// Reduce only: latest checkpoint per attempt, superseded in place.
    pub checkpoints: Vec<ReduceCheckpoint>,
    /// Reduce only: map task indices whose shards this reducer has ingested.
    pub ingested_maps: BTreeSet<u32>,
}

impl Task {
    pub fn new(id: TaskId) -> Self {
        Self {
            id,
            state: TaskState::Idle,
            assignments: Vec::new(),
            attempt: 0,
            last_deadline: None,
            output_locations: Vec::new(),
            completed_attempt: None,
            completed_by: None,
            progress: 0.0,
            progress_attempt: None,
            last_key: None,
            checkpoints: Vec::new(),
            ingested_maps: BTreeSet::new(),
        }
    }

    /// The primary assigned worker, when any lease is live.
    pub fn assigned_worker(&self) -> Option<&WorkerId> {
        self.assignments.first().map(|a| &a.worker)
    }

    pub fn assignment_for(&self, worker: &WorkerId) -> Option<&Assignment> {
        self.assignments.iter().find(|a| &a.worker == worker)
    }

    /// Latest committed checkpoint across all attempts, by (attempt, seq).
    pub fn latest_checkpoint(&self) -> Option<&ReduceCheckpoint> {
        self.checkpoints.iter().max_by_key(|c| (c.attempt, c.seq))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub address: String,
    pub state: WorkerState,
    /// Timestamp of the entry that last refreshed this worker. Liveness is
    /// tracked in leader memory; this field exists for status reporting.
    pub last_seen: DateTime<Utc>,
    pub current_task: Option<TaskId>,
    pub reported_progress: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub manifest: JobManifest,
    pub map_count: u32,
    pub reduce_count: u32,
    pub state: JobState,
    pub map_tasks: Vec<Task>,
    pub reduce_tasks: Vec<Task>,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl Job {
    pub fn new(
        id: JobId,
        manifest: JobManifest,
        map_count: u32,
        reduce_count: u32,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        let map_tasks = (0..map_count)
            .map(|index| {
                Task::new(TaskId {
                    job: id,
                    phase: Phase::Map,
                    index,
                })
            })
            .collect();
        let reduce_tasks = (0..reduce_count)
            .map(|index| {
                Task::new(TaskId {
                    job: id,
                    phase: Phase::Reduce,
                    index,
                })
            })
            .collect();
        Self {
            id,
            manifest,
            map_count,
            reduce_count,
            state: JobState::Pending,
            map_tasks,
            reduce_tasks,
            submitted_at,
            completed_at: None,
            failure_reason: None,
        }
    }

    pub fn task(&self, phase: Phase, index: u32) -> Option<&Task> {
        match phase {
            Phase::Map => self.map_tasks.get(index as usize),
            Phase::Reduce => self.reduce_tasks.get(index as usize),
        }
    }

    pub fn task_mut(&mut self, phase: Phase, index: u32) -> Option<&mut Task> {
        match phase {
            Phase::Map => self.map_tasks.get_mut(index as usize),
            Phase::Reduce => self.reduce_tasks.get_mut(index as usize),
        }
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.map_tasks.iter().chain(self.reduce_tasks.iter())
    }

    pub fn all_maps_completed(&self) -> bool {
        self.map_tasks.iter().all(|t| t.state == TaskState::Completed)
    }

    pub fn all_reduces_completed(&self) -> bool {
        self.reduce_tasks
            .iter()
            .all(|t| t.state == TaskState::Completed)
    }
}
