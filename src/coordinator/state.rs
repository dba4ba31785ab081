//! The replicated coordinator state machine.
//!
//! `CoordinatorState::apply` is a deterministic function from committed log
//! entries to job/task/worker state. It reads no clocks and calls no
//! external services; every timestamp arrives inside the entry. The leader
//! only proposes valid transitions, but apply validates anyway so a buggy
//! leader cannot diverge the replicas it is supposed to protect.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::command::{ApplyOutcome, LogCommand};
use crate::model::{
    Assignment, Job, JobId, JobState, Phase, ReduceCheckpoint, TaskState, Worker, WorkerId,
    WorkerState,
};

/// Snapshot format version. Bump when the layout changes.
const SNAPSHOT_VERSION: u32 = 1;

/// Shared, lock-guarded state machine handle. Apply holds the write lock
/// briefly and never across an await; readers (scheduler, RPC handlers)
/// take the read side.
pub type SharedState = std::sync::Arc<std::sync::RwLock<CoordinatorState>>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorState {
    /// Task attempt budget, shared cluster-wide through configuration so
    /// apply stays deterministic across replicas.
    max_attempts: u32,
    jobs: BTreeMap<JobId, Job>,
    workers: BTreeMap<WorkerId, Worker>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateSnapshot {
    version: u32,
    state: CoordinatorState,
}

impl CoordinatorState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            jobs: BTreeMap::new(),
            workers: BTreeMap::new(),
        }
    }

    pub fn job(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn worker(&self, id: &WorkerId) -> Option<&Worker> {
        self.workers.get(id)
    }

    pub fn workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Serialize the full state machine as a versioned snapshot record.
    pub fn to_snapshot_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&StateSnapshot {
            version: SNAPSHOT_VERSION,
            state: self.clone(),
        })
    }

    /// Replace this state machine with a snapshot produced by
    /// [`Self::to_snapshot_bytes`].
    pub fn restore_snapshot(&mut self, bytes: &[u8]) -> serde_json::Result<()> {
        let snapshot: StateSnapshot = serde_json::from_slice(bytes)?;
        *self = snapshot.state;
        Ok(())
    }

    /// Apply one committed entry. Deterministic; never touches a clock.
    pub fn apply(&mut self, command: &LogCommand) -> ApplyOutcome {
        let outcome = self.apply_inner(command);
        if let ApplyOutcome::Rejected { reason } = &outcome {
            warn!(kind = command.kind(), %reason, "rejected log entry");
        }
        outcome
    }

    fn apply_inner(&mut self, command: &LogCommand) -> ApplyOutcome {
        match command {
            LogCommand::JobSubmitted {
                job_id,
                manifest,
                map_count,
                reduce_count,
                submitted_at,
            } => {
                if self.jobs.contains_key(job_id) {
                    return ApplyOutcome::Duplicate;
                }
                if *map_count == 0 || *reduce_count == 0 {
                    return ApplyOutcome::rejected("job must have at least one map and one reduce");
                }
                self.jobs.insert(
                    *job_id,
                    Job::new(*job_id, manifest.clone(), *map_count, *reduce_count, *submitted_at),
                );
                ApplyOutcome::Accepted
            }

            LogCommand::WorkerRegistered {
                worker_id,
                address,
                registered_at,
            } => match self.workers.get_mut(worker_id) {
                Some(worker) => {
                    worker.address = address.clone();
                    worker.state = WorkerState::Alive;
                    worker.last_seen = *registered_at;
                    ApplyOutcome::Duplicate
                }
                None => {
                    self.workers.insert(
                        worker_id.clone(),
                        Worker {
                            id: worker_id.clone(),
                            address: address.clone(),
                            state: WorkerState::Alive,
                            last_seen: *registered_at,
                            current_task: None,
                            reported_progress: 0.0,
                        },
                    );
                    ApplyOutcome::Accepted
                }
            },

            LogCommand::TaskAssigned {
                job_id,
                phase,
                index,
                worker_id,
                attempt,
                deadline,
                speculative,
            } => self.apply_assigned(job_id, *phase, *index, worker_id, *attempt, deadline, *speculative),

            LogCommand::TaskProgress {
                job_id,
                phase,
                index,
                worker_id,
                attempt,
                progress,
                last_key,
                ingested_maps,
                reported_at,
            } => {
                let Some(job) = self.jobs.get_mut(job_id) else {
                    return ApplyOutcome::rejected(format!("unknown job {job_id}"));
                };
                let Some(task) = job.task_mut(*phase, *index) else {
                    return ApplyOutcome::rejected(format!("unknown task {phase}/{index}"));
                };
                if task.assignment_for(worker_id).map(|a| a.attempt) != Some(*attempt) {
                    // A report that raced a reassignment or worker death.
                    return ApplyOutcome::Duplicate;
                }
                task.progress = task.progress.max(*progress);
                task.progress_attempt = Some(*attempt);
                if last_key.is_some() {
                    task.last_key = last_key.clone();
                }
                task.ingested_maps.extend(ingested_maps.iter().copied());
                if let Some(worker) = self.workers.get_mut(worker_id) {
                    worker.reported_progress = *progress;
                    worker.last_seen = *reported_at;
                }
                ApplyOutcome::Accepted
            }

            LogCommand::TaskCompleted {
                job_id,
                phase,
                index,
                worker_id,
                attempt,
                outputs,
                completed_at,
            } => self.apply_completed(job_id, *phase, *index, worker_id, *attempt, outputs, completed_at),

            LogCommand::TaskFailed {
                job_id,
                phase,
                index,
                worker_id,
                attempt,
                reason,
                ..
            } => self.apply_failed(job_id, *phase, *index, worker_id.as_ref(), *attempt, reason),

            LogCommand::WorkerDead {
                worker_id,
                detected_at,
            } => {
                let Some(worker) = self.workers.get_mut(worker_id) else {
                    return ApplyOutcome::rejected(format!("unknown worker {worker_id}"));
                };
                if worker.state == WorkerState::Dead {
                    return ApplyOutcome::Duplicate;
                }
                worker.state = WorkerState::Dead;
                worker.last_seen = *detected_at;
                worker.current_task = None;
                for job in self.jobs.values_mut() {
                    if job.state.is_terminal() {
                        continue;
                    }
                    for task in job
                        .map_tasks
                        .iter_mut()
                        .chain(job.reduce_tasks.iter_mut())
                    {
                        if task.state != TaskState::Assigned {
                            continue;
                        }
                        let before = task.assignments.len();
                        task.assignments.retain(|a| &a.worker != worker_id);
                        if task.assignments.len() != before && task.assignments.is_empty() {
                            task.state = TaskState::Idle;
                        }
                    }
                }
                ApplyOutcome::Accepted
            }

            LogCommand::ReduceCheckpointed {
                job_id,
                reduce_index,
                attempt,
                seq,
                processed_keys,
                last_key,
                aggregate_uri,
                created_at,
            } => {
                let Some(job) = self.jobs.get_mut(job_id) else {
                    return ApplyOutcome::rejected(format!("unknown job {job_id}"));
                };
                let Some(task) = job.task_mut(Phase::Reduce, *reduce_index) else {
                    return ApplyOutcome::rejected(format!("unknown reduce task {reduce_index}"));
                };
                if *attempt > task.attempt {
                    return ApplyOutcome::rejected(format!(
                        "checkpoint for future attempt {attempt} (task at {})",
                        task.attempt
                    ));
                }
                if let Some(prev) = task.checkpoints.iter().find(|c| c.attempt == *attempt) {
                    // Within one attempt the watermark only moves forward.
                    if *seq <= prev.seq
                        || *processed_keys < prev.processed_keys
                        || last_key.as_str() < prev.last_key.as_str()
                    {
                        return ApplyOutcome::rejected(format!(
                            "checkpoint regression for attempt {attempt}: seq {seq} keys {processed_keys}"
                        ));
                    }
                }
                let row = ReduceCheckpoint {
                    attempt: *attempt,
                    seq: *seq,
                    processed_keys: *processed_keys,
                    last_key: last_key.clone(),
                    aggregate_uri: aggregate_uri.clone(),
                    created_at: *created_at,
                };
                task.checkpoints.retain(|c| c.attempt != *attempt);
                task.checkpoints.push(row);
                ApplyOutcome::Accepted
            }

            LogCommand::JobCancelled {
                job_id,
                reason,
                cancelled_at,
            } => {
                let Some(job) = self.jobs.get_mut(job_id) else {
                    return ApplyOutcome::rejected(format!("unknown job {job_id}"));
                };
                if job.state.is_terminal() {
                    return ApplyOutcome::Duplicate;
                }
                job.state = JobState::Failed;
                job.failure_reason = Some(reason.clone());
                job.completed_at = Some(*cancelled_at);
                let mut released = Vec::new();
                for task in job.map_tasks.iter_mut().chain(job.reduce_tasks.iter_mut()) {
                    for assignment in task.assignments.drain(..) {
                        released.push(assignment.worker);
                    }
                    if task.state == TaskState::Assigned {
                        task.state = TaskState::Idle;
                    }
                }
                for worker_id in released {
                    if let Some(worker) = self.workers.get_mut(&worker_id) {
                        worker.current_task = None;
                    }
                }
                ApplyOutcome::Accepted
            }
        }
    }

    fn apply_assigned(
        &mut self,
        job_id: &JobId,
        phase: Phase,
        index: u32,
        worker_id: &WorkerId,
        attempt: u32,
        deadline: &chrono::DateTime<chrono::Utc>,
        speculative: bool,
    ) -> ApplyOutcome {
        match self.workers.get(worker_id) {
            None => return ApplyOutcome::rejected(format!("unknown worker {worker_id}")),
            Some(worker) => {
                if worker.state != WorkerState::Alive {
                    return ApplyOutcome::rejected(format!("worker {worker_id} is not alive"));
                }
                if worker.current_task.is_some() {
                    return ApplyOutcome::rejected(format!("worker {worker_id} is busy"));
                }
            }
        }
        let Some(job) = self.jobs.get_mut(job_id) else {
            return ApplyOutcome::rejected(format!("unknown job {job_id}"));
        };
        if job.state.is_terminal() {
            return ApplyOutcome::rejected(format!("job {job_id} is terminal"));
        }
        // No reduce work may start before the map phase has fully closed.
        if phase == Phase::Reduce && !job.all_maps_completed() {
            return ApplyOutcome::rejected("map phase not complete");
        }
        let Some(task) = job.task_mut(phase, index) else {
            return ApplyOutcome::rejected(format!("unknown task {phase}/{index}"));
        };
        if attempt != task.attempt + 1 {
            return ApplyOutcome::rejected(format!(
                "non-monotonic attempt {attempt} (task at {})",
                task.attempt
            ));
        }
        match task.state {
            TaskState::Idle => {}
            TaskState::Assigned => {
                // A second live lease is only legal as a speculative pair.
                if !speculative || task.assignments.len() != 1 {
                    return ApplyOutcome::rejected("task already assigned");
                }
                for existing in &mut task.assignments {
                    existing.speculative = true;
                }
            }
            TaskState::Completed | TaskState::Failed => {
                return ApplyOutcome::rejected(format!("task is {:?}", task.state));
            }
        }
        task.state = TaskState::Assigned;
        task.attempt = attempt;
        task.last_deadline = Some(*deadline);
        task.assignments.push(Assignment {
            worker: worker_id.clone(),
            attempt,
            deadline: *deadline,
            speculative,
        });
        let task_id = task.id;
        if job.state == JobState::Pending {
            job.state = JobState::Mapping;
        }
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.current_task = Some(task_id);
        }
        ApplyOutcome::Accepted
    }

    fn apply_completed(
        &mut self,
        job_id: &JobId,
        phase: Phase,
        index: u32,
        worker_id: &WorkerId,
        attempt: u32,
        outputs: &[crate::model::OutputLocation],
        completed_at: &chrono::DateTime<chrono::Utc>,
    ) -> ApplyOutcome {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return ApplyOutcome::rejected(format!("unknown job {job_id}"));
        };
        let reduce_count = job.reduce_count;
        let Some(task) = job.task_mut(phase, index) else {
            return ApplyOutcome::rejected(format!("unknown task {phase}/{index}"));
        };
        if task.state == TaskState::Completed {
            // Workers may repeat completion reports; first one wins.
            return ApplyOutcome::Duplicate;
        }
        // Only the currently-leased attempt may complete; a canceled
        // worker's late report for an older attempt is dropped.
        if task.assignment_for(worker_id).map(|a| a.attempt) != Some(attempt) {
            return ApplyOutcome::rejected(format!(
                "completion from {worker_id} attempt {attempt} does not match a live lease"
            ));
        }
        let expected = match phase {
            Phase::Map => reduce_count as usize,
            Phase::Reduce => 1,
        };
        if outputs.len() != expected {
            return ApplyOutcome::rejected(format!(
                "expected {expected} output locations, got {}",
                outputs.len()
            ));
        }
        task.state = TaskState::Completed;
        task.completed_attempt = Some(attempt);
        task.completed_by = Some(worker_id.clone());
        task.output_locations = outputs.to_vec();
        task.progress = 1.0;
        if phase == Phase::Reduce {
            // Superseded resume data has no further use.
            task.checkpoints.clear();
        }
        let released: Vec<WorkerId> = task.assignments.drain(..).map(|a| a.worker).collect();
        if phase == Phase::Map && job.all_maps_completed() && job.state == JobState::Mapping {
            job.state = JobState::Reducing;
        }
        if phase == Phase::Reduce && job.all_reduces_completed() {
            job.state = JobState::Completed;
            job.completed_at = Some(*completed_at);
        }
        for id in released {
            if let Some(worker) = self.workers.get_mut(&id) {
                if worker.current_task == Some(crate::model::TaskId { job: *job_id, phase, index }) {
                    worker.current_task = None;
                }
            }
        }
        ApplyOutcome::Accepted
    }

    fn apply_failed(
        &mut self,
        job_id: &JobId,
        phase: Phase,
        index: u32,
        worker_id: Option<&WorkerId>,
        attempt: u32,
        reason: &str,
    ) -> ApplyOutcome {
        let max_attempts = self.max_attempts;
        let Some(job) = self.jobs.get_mut(job_id) else {
            return ApplyOutcome::rejected(format!("unknown job {job_id}"));
        };
        if job.state.is_terminal() {
            return ApplyOutcome::Duplicate;
        }
        let mut released = Vec::new();
        let mut reopened_map = false;
        let (task_attempt, task_state) = {
            let Some(task) = job.task_mut(phase, index) else {
                return ApplyOutcome::rejected(format!("unknown task {phase}/{index}"));
            };
            match task.state {
                TaskState::Completed => {
                    // Re-opening a completed map whose shards were lost or
                    // corrupted. Reducers holding those shards are demoted
                    // separately by the scheduler.
                    if phase != Phase::Map {
                        return ApplyOutcome::rejected("completed reduce output is canonical");
                    }
                    task.state = TaskState::Idle;
                    task.completed_attempt = None;
                    task.completed_by = None;
                    task.output_locations.clear();
                    task.progress = 0.0;
                    reopened_map = true;
                }
                TaskState::Assigned => {
                    if attempt != task.attempt
                        && task.assignments.iter().all(|a| a.attempt != attempt)
                    {
                        return ApplyOutcome::Duplicate;
                    }
                    for a in task.assignments.iter() {
                        if a.attempt == attempt || worker_id == Some(&a.worker) {
                            released.push(a.worker.clone());
                        }
                    }
                    task.assignments
                        .retain(|a| a.attempt != attempt && worker_id != Some(&a.worker));
                    if task.assignments.is_empty() {
                        task.state = TaskState::Idle;
                    }
                    task.progress = 0.0;
                }
                TaskState::Idle => return ApplyOutcome::Duplicate,
                TaskState::Failed => return ApplyOutcome::Duplicate,
            }
            if task.attempt >= max_attempts && task.state == TaskState::Idle {
                task.state = TaskState::Failed;
            }
            (task.attempt, task.state)
        };
        if reopened_map && job.state == JobState::Reducing {
            job.state = JobState::Mapping;
        }
        if task_state == TaskState::Failed && task_attempt >= max_attempts {
            job.state = JobState::Failed;
            job.failure_reason = Some(format!(
                "{phase} task {index} exhausted {max_attempts} attempts: {reason}"
            ));
        }
        for id in released {
            if let Some(worker) = self.workers.get_mut(&id) {
                worker.current_task = None;
            }
        }
        ApplyOutcome::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobManifest, OutputLocation};
    use chrono::{TimeZone, Utc};

    fn ts(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn manifest() -> JobManifest {
        JobManifest {
            inputs: vec!["in/a".into(), "in/b".into()],
            code_ref: "wordcount".into(),
        }
    }

    fn submit(state: &mut CoordinatorState, maps: u32, reduces: u32) -> JobId {
        let job_id = JobId::new();
        let outcome = state.apply(&LogCommand::JobSubmitted {
            job_id,
            manifest: manifest(),
            map_count: maps,
            reduce_count: reduces,
            submitted_at: ts(0),
        });
        assert_eq!(outcome, ApplyOutcome::Accepted);
        job_id
    }

    fn register(state: &mut CoordinatorState, name: &str) -> WorkerId {
        let worker_id = WorkerId(name.to_string());
        state.apply(&LogCommand::WorkerRegistered {
            worker_id: worker_id.clone(),
            address: format!("{name}.local:9000"),
            registered_at: ts(0),
        });
        worker_id
    }

    fn assign(
        state: &mut CoordinatorState,
        job_id: JobId,
        phase: Phase,
        index: u32,
        worker: &WorkerId,
        attempt: u32,
    ) -> ApplyOutcome {
        state.apply(&LogCommand::TaskAssigned {
            job_id,
            phase,
            index,
            worker_id: worker.clone(),
            attempt,
            deadline: ts(120),
            speculative: false,
        })
    }

    fn complete_map(
        state: &mut CoordinatorState,
        job_id: JobId,
        index: u32,
        worker: &WorkerId,
        attempt: u32,
        reduces: u32,
    ) -> ApplyOutcome {
        let outputs = (0..reduces)
            .map(|r| OutputLocation {
                uri: format!("jobs/{job_id}/map/{index}/attempt-{attempt}/part-{r}"),
                size: 64,
                checksum: "ab".repeat(32),
            })
            .collect();
        state.apply(&LogCommand::TaskCompleted {
            job_id,
            phase: Phase::Map,
            index,
            worker_id: worker.clone(),
            attempt,
            outputs,
            completed_at: ts(60),
        })
    }

    #[test]
    fn submit_creates_idle_tasks_and_is_idempotent() {
        let mut state = CoordinatorState::new(4);
        let job_id = submit(&mut state, 2, 2);
        let job = state.job(&job_id).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.map_tasks.len(), 2);

        let duplicate = state.apply(&LogCommand::JobSubmitted {
            job_id,
            manifest: manifest(),
            map_count: 2,
            reduce_count: 2,
            submitted_at: ts(1),
        });
        assert_eq!(duplicate, ApplyOutcome::Duplicate);
    }

    #[test]
    fn assignment_enforces_single_live_lease() {
        let mut state = CoordinatorState::new(4);
        let job_id = submit(&mut state, 2, 1);
        let w1 = register(&mut state, "w1");
        let w2 = register(&mut state, "w2");

        assert_eq!(assign(&mut state, job_id, Phase::Map, 0, &w1, 1), ApplyOutcome::Accepted);
        assert_eq!(state.job(&job_id).unwrap().state, JobState::Mapping);

        // Second non-speculative lease on the same task is rejected.
        let second = assign(&mut state, job_id, Phase::Map, 0, &w2, 2);
        assert!(matches!(second, ApplyOutcome::Rejected { .. }));

        // A busy worker cannot take more work.
        let busy = assign(&mut state, job_id, Phase::Map, 1, &w1, 1);
        assert!(matches!(busy, ApplyOutcome::Rejected { .. }));
    }

    #[test]
    fn attempts_are_monotonic() {
        let mut state = CoordinatorState::new(4);
        let job_id = submit(&mut state, 1, 1);
        let w1 = register(&mut state, "w1");
        assert_eq!(assign(&mut state, job_id, Phase::Map, 0, &w1, 1), ApplyOutcome::Accepted);
        state.apply(&LogCommand::TaskFailed {
            job_id,
            phase: Phase::Map,
            index: 0,
            worker_id: Some(w1.clone()),
            attempt: 1,
            reason: "panic".into(),
            failed_at: ts(10),
        });
        // Reassignment must use attempt 2, not 1.
        let stale = assign(&mut state, job_id, Phase::Map, 0, &w1, 1);
        assert!(matches!(stale, ApplyOutcome::Rejected { .. }));
        assert_eq!(assign(&mut state, job_id, Phase::Map, 0, &w1, 2), ApplyOutcome::Accepted);
        assert_eq!(state.job(&job_id).unwrap().task(Phase::Map, 0).unwrap().attempt, 2);
    }

    #[test]
    fn reduce_cannot_start_before_maps_finish() {
        let mut state = CoordinatorState::new(4);
        let job_id = submit(&mut state, 1, 1);
        let w1 = register(&mut state, "w1");
        let premature = assign(&mut state, job_id, Phase::Reduce, 0, &w1, 1);
        assert!(matches!(premature, ApplyOutcome::Rejected { .. }));

        assert_eq!(assign(&mut state, job_id, Phase::Map, 0, &w1, 1), ApplyOutcome::Accepted);
        assert_eq!(complete_map(&mut state, job_id, 0, &w1, 1, 1), ApplyOutcome::Accepted);
        assert_eq!(state.job(&job_id).unwrap().state, JobState::Reducing);
        assert_eq!(assign(&mut state, job_id, Phase::Reduce, 0, &w1, 1), ApplyOutcome::Accepted);
    }

    #[test]
    fn duplicate_completion_is_ignored() {
        let mut state = CoordinatorState::new(4);
        let job_id = submit(&mut state, 1, 1);
        let w1 = register(&mut state, "w1");
        assign(&mut state, job_id, Phase::Map, 0, &w1, 1);
        assert_eq!(complete_map(&mut state, job_id, 0, &w1, 1, 1), ApplyOutcome::Accepted);
        assert_eq!(complete_map(&mut state, job_id, 0, &w1, 1, 1), ApplyOutcome::Duplicate);
        let task = state.job(&job_id).unwrap().task(Phase::Map, 0).unwrap();
        assert_eq!(task.completed_attempt, Some(1));
        assert_eq!(task.output_locations.len(), 1);
    }

    #[test]
    fn stale_completion_after_reassignment_is_rejected() {
        let mut state = CoordinatorState::new(4);
        let job_id = submit(&mut state, 1, 1);
        let w1 = register(&mut state, "w1");
        let w2 = register(&mut state, "w2");
        assign(&mut state, job_id, Phase::Map, 0, &w1, 1);
        state.apply(&LogCommand::WorkerDead {
            worker_id: w1.clone(),
            detected_at: ts(30),
        });
        assign(&mut state, job_id, Phase::Map, 0, &w2, 2);
        // w1 reconnects and reports its old attempt.
        let late = complete_map(&mut state, job_id, 0, &w1, 1, 1);
        assert!(matches!(late, ApplyOutcome::Rejected { .. }));
    }

    #[test]
    fn worker_death_re_idles_assigned_tasks() {
        let mut state = CoordinatorState::new(4);
        let job_id = submit(&mut state, 1, 1);
        let w1 = register(&mut state, "w1");
        assign(&mut state, job_id, Phase::Map, 0, &w1, 1);
        state.apply(&LogCommand::WorkerDead {
            worker_id: w1.clone(),
            detected_at: ts(30),
        });
        let task = state.job(&job_id).unwrap().task(Phase::Map, 0).unwrap();
        assert_eq!(task.state, TaskState::Idle);
        assert!(task.assignments.is_empty());
        assert_eq!(state.worker(&w1).unwrap().state, WorkerState::Dead);
        // Dead worker entry is retained for late-RPC idempotence.
        assert!(state.worker(&w1).is_some());
    }

    #[test]
    fn exhausted_attempts_fail_the_job() {
        let mut state = CoordinatorState::new(2);
        let job_id = submit(&mut state, 1, 1);
        let w1 = register(&mut state, "w1");
        for attempt in 1..=2 {
            assert_eq!(
                assign(&mut state, job_id, Phase::Map, 0, &w1, attempt),
                ApplyOutcome::Accepted
            );
            state.apply(&LogCommand::TaskFailed {
                job_id,
                phase: Phase::Map,
                index: 0,
                worker_id: Some(w1.clone()),
                attempt,
                reason: "always fails".into(),
                failed_at: ts(attempt as i64 * 10),
            });
        }
        let job = state.job(&job_id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.task(Phase::Map, 0).unwrap().state, TaskState::Failed);
        assert!(job.failure_reason.as_deref().unwrap().contains("exhausted"));
    }

    #[test]
    fn checkpoint_rows_supersede_within_attempt() {
        let mut state = CoordinatorState::new(4);
        let job_id = submit(&mut state, 1, 1);
        let w1 = register(&mut state, "w1");
        assign(&mut state, job_id, Phase::Map, 0, &w1, 1);
        complete_map(&mut state, job_id, 0, &w1, 1, 1);
        assign(&mut state, job_id, Phase::Reduce, 0, &w1, 1);

        let ckpt = |seq, keys: u64, last: &str| LogCommand::ReduceCheckpointed {
            job_id,
            reduce_index: 0,
            attempt: 1,
            seq,
            processed_keys: keys,
            last_key: last.into(),
            aggregate_uri: format!("jobs/{job_id}/reduce/0/attempt-1/checkpoint-{seq}"),
            created_at: ts(100),
        };
        assert_eq!(state.apply(&ckpt(1, 100, "dog")), ApplyOutcome::Accepted);
        assert_eq!(state.apply(&ckpt(2, 250, "quick")), ApplyOutcome::Accepted);

        let task = state.job(&job_id).unwrap().task(Phase::Reduce, 0).unwrap();
        assert_eq!(task.checkpoints.len(), 1);
        assert_eq!(task.latest_checkpoint().unwrap().processed_keys, 250);

        // Watermark regression is rejected.
        let regression = state.apply(&ckpt(3, 200, "lazy"));
        assert!(matches!(regression, ApplyOutcome::Rejected { .. }));
    }

    #[test]
    fn completed_reduce_discards_checkpoints() {
        let mut state = CoordinatorState::new(4);
        let job_id = submit(&mut state, 1, 1);
        let w1 = register(&mut state, "w1");
        assign(&mut state, job_id, Phase::Map, 0, &w1, 1);
        complete_map(&mut state, job_id, 0, &w1, 1, 1);
        assign(&mut state, job_id, Phase::Reduce, 0, &w1, 1);
        state.apply(&LogCommand::ReduceCheckpointed {
            job_id,
            reduce_index: 0,
            attempt: 1,
            seq: 1,
            processed_keys: 10,
            last_key: "k".into(),
            aggregate_uri: "ckpt".into(),
            created_at: ts(100),
        });
        let done = state.apply(&LogCommand::TaskCompleted {
            job_id,
            phase: Phase::Reduce,
            index: 0,
            worker_id: w1.clone(),
            attempt: 1,
            outputs: vec![OutputLocation {
                uri: format!("jobs/{job_id}/output/part-0"),
                size: 10,
                checksum: "cd".repeat(32),
            }],
            completed_at: ts(200),
        });
        assert_eq!(done, ApplyOutcome::Accepted);
        let job = state.job(&job_id).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.task(Phase::Reduce, 0).unwrap().checkpoints.is_empty());
    }

    #[test]
    fn speculative_pair_is_admitted_and_normal_double_assign_is_not() {
        let mut state = CoordinatorState::new(4);
        let job_id = submit(&mut state, 1, 1);
        let w1 = register(&mut state, "w1");
        let w2 = register(&mut state, "w2");
        assign(&mut state, job_id, Phase::Map, 0, &w1, 1);
        let speculative = state.apply(&LogCommand::TaskAssigned {
            job_id,
            phase: Phase::Map,
            index: 0,
            worker_id: w2.clone(),
            attempt: 2,
            deadline: ts(120),
            speculative: true,
        });
        assert_eq!(speculative, ApplyOutcome::Accepted);
        let task = state.job(&job_id).unwrap().task(Phase::Map, 0).unwrap();
        assert_eq!(task.assignments.len(), 2);
        assert!(task.assignments.iter().all(|a| a.speculative));
        let attempts: Vec<u32> = task.assignments.iter().map(|a| a.attempt).collect();
        assert_eq!(attempts, vec![1, 2]);

        // First completion wins; the loser's lease is dropped with it.
        let won = complete_map(&mut state, job_id, 0, &w2, 2, 1);
        assert_eq!(won, ApplyOutcome::Accepted);
        let task = state.job(&job_id).unwrap().task(Phase::Map, 0).unwrap();
        assert_eq!(task.completed_attempt, Some(2));
        assert!(task.assignments.is_empty());
    }

    #[test]
    fn reopening_completed_map_rolls_job_back_to_mapping() {
        let mut state = CoordinatorState::new(4);
        let job_id = submit(&mut state, 1, 1);
        let w1 = register(&mut state, "w1");
        assign(&mut state, job_id, Phase::Map, 0, &w1, 1);
        complete_map(&mut state, job_id, 0, &w1, 1, 1);
        assert_eq!(state.job(&job_id).unwrap().state, JobState::Reducing);

        let reopened = state.apply(&LogCommand::TaskFailed {
            job_id,
            phase: Phase::Map,
            index: 0,
            worker_id: None,
            attempt: 1,
            reason: "shard checksum mismatch".into(),
            failed_at: ts(300),
        });
        assert_eq!(reopened, ApplyOutcome::Accepted);
        let job = state.job(&job_id).unwrap();
        assert_eq!(job.state, JobState::Mapping);
        let task = job.task(Phase::Map, 0).unwrap();
        assert_eq!(task.state, TaskState::Idle);
        assert!(task.output_locations.is_empty());
    }

    #[test]
    fn cancellation_fails_job_and_releases_workers() {
        let mut state = CoordinatorState::new(4);
        let job_id = submit(&mut state, 1, 1);
        let w1 = register(&mut state, "w1");
        assign(&mut state, job_id, Phase::Map, 0, &w1, 1);
        let outcome = state.apply(&LogCommand::JobCancelled {
            job_id,
            reason: "cancelled by client".into(),
            cancelled_at: ts(50),
        });
        assert_eq!(outcome, ApplyOutcome::Accepted);
        assert_eq!(state.job(&job_id).unwrap().state, JobState::Failed);
        assert_eq!(state.worker(&w1).unwrap().current_task, None);
    }

    #[test]
    fn replay_reproduces_identical_state() {
        let commands = {
            let mut state = CoordinatorState::new(4);
            let job_id = JobId::new();
            let w1 = WorkerId("w1".into());
            let cmds = vec![
                LogCommand::JobSubmitted {
                    job_id,
                    manifest: manifest(),
                    map_count: 2,
                    reduce_count: 1,
                    submitted_at: ts(0),
                },
                LogCommand::WorkerRegistered {
                    worker_id: w1.clone(),
                    address: "w1:9000".into(),
                    registered_at: ts(1),
                },
                LogCommand::TaskAssigned {
                    job_id,
                    phase: Phase::Map,
                    index: 0,
                    worker_id: w1.clone(),
                    attempt: 1,
                    deadline: ts(120),
                    speculative: false,
                },
                LogCommand::TaskProgress {
                    job_id,
                    phase: Phase::Map,
                    index: 0,
                    worker_id: w1.clone(),
                    attempt: 1,
                    progress: 0.4,
                    last_key: None,
                    ingested_maps: vec![],
                    reported_at: ts(30),
                },
            ];
            for c in &cmds {
                state.apply(c);
            }
            cmds
        };

        let mut a = CoordinatorState::new(4);
        let mut b = CoordinatorState::new(4);
        for c in &commands {
            a.apply(c);
        }
        for c in &commands {
            b.apply(c);
        }
        assert_eq!(
            a.to_snapshot_bytes().unwrap(),
            b.to_snapshot_bytes().unwrap()
        );
    }

    #[test]
    fn snapshot_round_trip_preserves_state() {
        let mut state = CoordinatorState::new(4);
        let job_id = submit(&mut state, 2, 2);
        let w1 = register(&mut state, "w1");
        assign(&mut state, job_id, Phase::Map, 0, &w1, 1);

        let bytes = state.to_snapshot_bytes().unwrap();
        let mut restored = CoordinatorState::new(4);
        restored.restore_snapshot(&bytes).unwrap();
        assert_eq!(
            restored.to_snapshot_bytes().unwrap(),
            state.to_snapshot_bytes().unwrap()
        );
        assert_eq!(restored.job(&job_id).unwrap().map_tasks.len(), 2);
    }
}
