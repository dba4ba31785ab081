//! Leader-side task scheduler.
//!
//! Runs only on the current Raft leader. Every decision is proposed to the
//! log before it takes effect; the scheduler's own memory holds nothing
//! but heartbeat arrival times, and that memory is rebuilt from the state
//! machine whenever this node gains leadership. No lock is held across a
//! proposal await or any other I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::command::{ApplyOutcome, LogCommand};
use super::state::SharedState;
use crate::api::{
    CheckpointReport, CorruptShardReport, HeartbeatRequest, HeartbeatResponse, RegisterRequest,
    RegisterResponse, ResumePoint, TaskAssignment, TaskInput, TaskStatus,
};
use crate::config::ClusterConfig;
use crate::error::{EngineError, Result};
use crate::model::{
    Job, JobState, OutputLocation, Phase, Task, TaskId, TaskState, WorkerId, WorkerState,
};
use crate::storage::ObjectStore;

/// The consensus log as the scheduler sees it: propose-and-wait. The Raft
/// handle implements this in production; tests use a loopback that applies
/// directly to a local state machine.
#[async_trait]
pub trait ProposeLog: Send + Sync {
    async fn propose(&self, command: LogCommand) -> Result<ApplyOutcome>;
}

/// How a replacement reducer attempt starts, per the records available.
#[derive(Debug, Clone, PartialEq)]
pub enum ReduceRecovery {
    /// No progress was ever logged for the failed attempt: clean restart
    /// over the same shard set.
    CleanRestart,
    /// Progress existed but no checkpoint was committed: the partial
    /// aggregate died with the worker, so restart from scratch.
    RestartLostProgress,
    /// A committed checkpoint exists: resume behind its watermark.
    ResumeFromCheckpoint(ResumePoint),
}

struct SchedulerInner {
    active: bool,
    last_heartbeat: HashMap<WorkerId, Instant>,
}

pub struct Scheduler {
    config: Arc<ClusterConfig>,
    state: SharedState,
    log: Arc<dyn ProposeLog>,
    store: Arc<dyn ObjectStore>,
    inner: Mutex<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        config: Arc<ClusterConfig>,
        state: SharedState,
        log: Arc<dyn ProposeLog>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            config,
            state,
            log,
            store,
            inner: Mutex::new(SchedulerInner {
                active: false,
                last_heartbeat: HashMap::new(),
            }),
        }
    }

    /// Rebuild or clear the in-memory timer wheel as leadership moves.
    /// Called before this node serves any worker RPC as leader.
    pub fn on_leadership_change(&self, is_leader: bool) {
        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        inner.active = is_leader;
        inner.last_heartbeat.clear();
        if is_leader {
            // Give every known-alive worker a full timeout window before
            // declaring it dead under the new leader.
            let now = Instant::now();
            let state = self.state.read().expect("state lock poisoned");
            for worker in state.workers() {
                if worker.state == WorkerState::Alive {
                    inner.last_heartbeat.insert(worker.id.clone(), now);
                }
            }
            info!(workers = inner.last_heartbeat.len(), "timer wheel rebuilt");
        } else {
            info!("stepped down, timer wheel cleared");
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().expect("scheduler lock poisoned").active
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(EngineError::NotLeader { leader_hint: None })
        }
    }

    fn touch(&self, worker_id: &WorkerId) {
        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        inner.last_heartbeat.insert(worker_id.clone(), Instant::now());
    }

    // ── Worker RPC entry points ──────────────────────────────────────────

    pub async fn handle_register(&self, request: RegisterRequest) -> Result<RegisterResponse> {
        self.ensure_active()?;
        let worker_id = WorkerId::generate();
        let outcome = self
            .log
            .propose(LogCommand::WorkerRegistered {
                worker_id: worker_id.clone(),
                address: request.address,
                registered_at: Utc::now(),
            })
            .await?;
        if !outcome.is_accepted() {
            return Err(EngineError::Internal(format!(
                "registration rejected: {outcome:?}"
            )));
        }
        self.touch(&worker_id);
        info!(%worker_id, "worker registered");
        Ok(RegisterResponse {
            worker_id,
            heartbeat_interval_secs: self.config.heartbeat_secs,
        })
    }

    pub async fn handle_heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatResponse> {
        self.ensure_active()?;
        let worker_id = request.worker_id.clone();
        match self
            .state
            .read()
            .expect("state lock poisoned")
            .worker(&worker_id)
            .map(|w| w.state)
        {
            // Unknown or declared-dead workers must re-register before
            // they can carry work again.
            None | Some(WorkerState::Dead) => {
                return Err(EngineError::WorkerNotFound(worker_id));
            }
            Some(_) => {}
        }
        self.touch(&worker_id);

        for report in &request.corrupt_shards {
            self.handle_corrupt_shard(report).await?;
        }

        let mut cancel = false;
        let mut idle = false;
        match &request.status {
            TaskStatus::Idle => idle = true,
            TaskStatus::Running {
                task,
                attempt,
                progress,
                last_key,
                ingested_maps,
            } => {
                cancel = self
                    .handle_progress(
                        &worker_id,
                        *task,
                        *attempt,
                        *progress,
                        last_key.clone(),
                        ingested_maps,
                        request.checkpoint.as_ref(),
                    )
                    .await?;
            }
            TaskStatus::Completing {
                task,
                attempt,
                outputs,
            } => {
                let outcome = self
                    .log
                    .propose(LogCommand::TaskCompleted {
                        job_id: task.job,
                        phase: task.phase,
                        index: task.index,
                        worker_id: worker_id.clone(),
                        attempt: *attempt,
                        outputs: outputs.clone(),
                        completed_at: Utc::now(),
                    })
                    .await?;
                match outcome {
                    ApplyOutcome::Accepted | ApplyOutcome::Duplicate => idle = true,
                    ApplyOutcome::Rejected { reason } => {
                        // A speculative loser or a revoked lease: drop the
                        // output and recycle the worker.
                        debug!(%worker_id, %task, %reason, "stale completion discarded");
                        cancel = true;
                    }
                }
            }
            TaskStatus::Failed {
                task,
                attempt,
                reason,
            } => {
                self.log
                    .propose(LogCommand::TaskFailed {
                        job_id: task.job,
                        phase: task.phase,
                        index: task.index,
                        worker_id: Some(worker_id.clone()),
                        attempt: *attempt,
                        reason: reason.clone(),
                        failed_at: Utc::now(),
                    })
                    .await?;
                idle = true;
            }
        }

        let assignment = if idle {
            self.assign_work(&worker_id).await?
        } else {
            None
        };
        Ok(HeartbeatResponse { assignment, cancel })
    }

    /// Returns `true` when the worker should cancel its current task.
    #[allow(clippy::too_many_arguments)]
    async fn handle_progress(
        &self,
        worker_id: &WorkerId,
        task_id: TaskId,
        attempt: u32,
        progress: f64,
        last_key: Option<String>,
        ingested_maps: &[u32],
        checkpoint: Option<&CheckpointReport>,
    ) -> Result<bool> {
        let (lease_live, recorded_progress, recorded_ingests) = {
            let state = self.state.read().expect("state lock poisoned");
            let Some(job) = state.job(&task_id.job) else {
                return Ok(true);
            };
            if job.state.is_terminal() {
                return Ok(true);
            }
            let Some(task) = job.task(task_id.phase, task_id.index) else {
                return Ok(true);
            };
            let live = task
                .assignment_for(worker_id)
                .map(|a| a.attempt == attempt)
                .unwrap_or(false);
            let new_ingest = ingested_maps
                .iter()
                .any(|m| !task.ingested_maps.contains(m));
            (live, task.progress, new_ingest)
        };
        if !lease_live {
            // Lease was revoked (timeout raced a reconnect, or a
            // speculative peer won). Cooperative cancel.
            return Ok(true);
        }

        let advanced = progress - recorded_progress >= self.config.progress_delta;
        if advanced || recorded_ingests || checkpoint.is_some() {
            self.log
                .propose(LogCommand::TaskProgress {
                    job_id: task_id.job,
                    phase: task_id.phase,
                    index: task_id.index,
                    worker_id: worker_id.clone(),
                    attempt,
                    progress,
                    last_key,
                    ingested_maps: ingested_maps.to_vec(),
                    reported_at: Utc::now(),
                })
                .await?;
        }
        if let Some(report) = checkpoint {
            let outcome = self
                .log
                .propose(LogCommand::ReduceCheckpointed {
                    job_id: report.task.job,
                    reduce_index: report.task.index,
                    attempt: report.attempt,
                    seq: report.seq,
                    processed_keys: report.processed_keys,
                    last_key: report.last_key.clone(),
                    aggregate_uri: report.aggregate_uri.clone(),
                    created_at: Utc::now(),
                })
                .await?;
            if let ApplyOutcome::Rejected { reason } = outcome {
                warn!(%worker_id, task = %report.task, %reason, "checkpoint rejected");
            }
        }
        Ok(false)
    }

    /// A reducer observed a checksum mismatch in shard (map_index,
    /// partition): re-open the producing map task, and demote every
    /// reducer that already ingested from it to a clean restart.
    async fn handle_corrupt_shard(&self, report: &CorruptShardReport) -> Result<()> {
        warn!(
            job = %report.job,
            map_index = report.map_index,
            partition = report.partition,
            "shard corruption reported"
        );
        let (map_attempt, tainted_reducers) = {
            let state = self.state.read().expect("state lock poisoned");
            let Some(job) = state.job(&report.job) else {
                return Ok(());
            };
            let map_attempt = job
                .task(Phase::Map, report.map_index)
                .filter(|t| t.state == TaskState::Completed)
                .and_then(|t| t.completed_attempt);
            let tainted: Vec<(TaskId, u32)> = job
                .reduce_tasks
                .iter()
                .filter(|t| {
                    t.state == TaskState::Assigned && t.ingested_maps.contains(&report.map_index)
                })
                .map(|t| (t.id, t.attempt))
                .collect();
            (map_attempt, tainted)
        };
        if let Some(attempt) = map_attempt {
            self.log
                .propose(LogCommand::TaskFailed {
                    job_id: report.job,
                    phase: Phase::Map,
                    index: report.map_index,
                    worker_id: None,
                    attempt,
                    reason: format!("shard part-{} failed checksum", report.partition),
                    failed_at: Utc::now(),
                })
                .await?;
        }
        for (task_id, attempt) in tainted_reducers {
            self.log
                .propose(LogCommand::TaskFailed {
                    job_id: task_id.job,
                    phase: Phase::Reduce,
                    index: task_id.index,
                    worker_id: None,
                    attempt,
                    reason: format!("ingested corrupt shard from map {}", report.map_index),
                    failed_at: Utc::now(),
                })
                .await?;
        }
        Ok(())
    }

    // ── Assignment ───────────────────────────────────────────────────────

    async fn assign_work(&self, worker_id: &WorkerId) -> Result<Option<TaskAssignment>> {
        let candidate = {
            let state = self.state.read().expect("state lock poisoned");
            pick_task(state.jobs(), &self.config)
        };
        let Some(candidate) = candidate else {
            return Ok(None);
        };
        let deadline =
            Utc::now() + chrono::Duration::from_std(self.config.deadline_for(candidate.task.phase))
                .unwrap_or_else(|_| chrono::Duration::seconds(120));
        let outcome = self
            .log
            .propose(LogCommand::TaskAssigned {
                job_id: candidate.task.job,
                phase: candidate.task.phase,
                index: candidate.task.index,
                worker_id: worker_id.clone(),
                attempt: candidate.attempt,
                deadline,
                speculative: candidate.speculative,
            })
            .await?;
        if !outcome.is_accepted() {
            // Lost a race with a concurrent heartbeat; the worker will ask
            // again on its next beat.
            debug!(%worker_id, task = %candidate.task, ?outcome, "assignment raced, skipped");
            return Ok(None);
        }
        let assignment = self.build_assignment(&candidate, deadline)?;
        info!(
            %worker_id,
            task = %candidate.task,
            attempt = candidate.attempt,
            speculative = candidate.speculative,
            recovery = ?candidate.recovery,
            "task assigned"
        );
        Ok(Some(assignment))
    }

    fn build_assignment(
        &self,
        candidate: &Candidate,
        deadline: chrono::DateTime<Utc>,
    ) -> Result<TaskAssignment> {
        let state = self.state.read().expect("state lock poisoned");
        let job = state
            .job(&candidate.task.job)
            .ok_or(EngineError::JobNotFound(candidate.task.job))?;
        let input = match candidate.task.phase {
            Phase::Map => TaskInput::Map {
                split_uri: job
                    .manifest
                    .inputs
                    .get(candidate.task.index as usize)
                    .cloned()
                    .ok_or_else(|| {
                        EngineError::Internal(format!(
                            "no input split for map {}",
                            candidate.task.index
                        ))
                    })?,
                reduce_count: job.reduce_count,
            },
            Phase::Reduce => {
                let shard_uris = reduce_shard_uris(job, candidate.task.index)?;
                let resume = match &candidate.recovery {
                    Some(ReduceRecovery::ResumeFromCheckpoint(point)) => Some(point.clone()),
                    _ => None,
                };
                TaskInput::Reduce { shard_uris, resume }
            }
        };
        Ok(TaskAssignment {
            task: candidate.task,
            attempt: candidate.attempt,
            deadline,
            speculative: candidate.speculative,
            code_ref: job.manifest.code_ref.clone(),
            input,
        })
    }

    // ── Timeout detection and worker loss ────────────────────────────────

    /// One pass of the heartbeat timeout detector. Called periodically by
    /// [`run`] on the leader.
    pub async fn check_timeouts(&self) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        let timeout = self.config.heartbeat_timeout();
        let expired: Vec<WorkerId> = {
            let mut inner = self.inner.lock().expect("scheduler lock poisoned");
            let now = Instant::now();
            let expired: Vec<WorkerId> = inner
                .last_heartbeat
                .iter()
                .filter(|(_, last)| now.duration_since(**last) > timeout)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                inner.last_heartbeat.remove(id);
            }
            expired
        };
        for worker_id in expired {
            warn!(%worker_id, "heartbeat timeout, declaring worker dead");
            self.log
                .propose(LogCommand::WorkerDead {
                    worker_id: worker_id.clone(),
                    detected_at: Utc::now(),
                })
                .await?;
            self.audit_completed_outputs(&worker_id).await?;
        }
        Ok(())
    }

    /// Mapper failure algorithm, completed-output side: a dead worker's
    /// `Assigned` tasks were already re-idled by the `WorkerDead` apply.
    /// Its completed map outputs are safe as long as they either have been
    /// ingested by every reducer or are still present in the object store;
    /// otherwise the map task is re-opened with a fresh attempt.
    async fn audit_completed_outputs(&self, worker_id: &WorkerId) -> Result<()> {
        let produced: Vec<(TaskId, u32, Vec<OutputLocation>)> = {
            let state = self.state.read().expect("state lock poisoned");
            state
                .jobs()
                .filter(|job| !job.state.is_terminal())
                .flat_map(|job| {
                    let fully_ingested = |map_index: u32| {
                        job.reduce_tasks
                            .iter()
                            .all(|r| r.ingested_maps.contains(&map_index))
                    };
                    job.map_tasks
                        .iter()
                        .filter(|t| {
                            t.state == TaskState::Completed
                                && t.completed_by.as_ref() == Some(worker_id)
                                && !fully_ingested(t.id.index)
                        })
                        .map(|t| {
                            (
                                t.id,
                                t.completed_attempt.unwrap_or(t.attempt),
                                t.output_locations.clone(),
                            )
                        })
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        for (task_id, attempt, outputs) in produced {
            let mut lost = false;
            for output in &outputs {
                if !self.store.exists(&output.uri).await? {
                    lost = true;
                    break;
                }
            }
            if lost {
                warn!(task = %task_id, "intermediate shards lost with worker, re-opening map");
                self.log
                    .propose(LogCommand::TaskFailed {
                        job_id: task_id.job,
                        phase: Phase::Map,
                        index: task_id.index,
                        worker_id: None,
                        attempt,
                        reason: "intermediate shards lost with worker".into(),
                        failed_at: Utc::now(),
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Drive the scheduler: follow leadership changes and run the timeout
    /// detector every half heartbeat interval.
    pub async fn run(self: Arc<Self>, mut leadership: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval() / 2);
        // Leadership may have been decided before this task subscribed.
        let initial = *leadership.borrow_and_update();
        if initial != self.is_active() {
            self.on_leadership_change(initial);
        }
        loop {
            tokio::select! {
                changed = leadership.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let is_leader = *leadership.borrow();
                    self.on_leadership_change(is_leader);
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.check_timeouts().await {
                        // Propose timeouts leave the entry's fate unknown;
                        // state is re-read on the next pass.
                        warn!(%err, "timeout pass failed");
                    }
                }
            }
        }
    }
}

// ── Pure assignment policy ───────────────────────────────────────────────

#[derive(Debug)]
struct Candidate {
    task: TaskId,
    attempt: u32,
    speculative: bool,
    recovery: Option<ReduceRecovery>,
}

/// Classify how a replacement attempt of a reduce task starts, from the
/// records the state machine holds for it.
pub fn classify_reduce_recovery(task: &Task) -> ReduceRecovery {
    if let Some(checkpoint) = task.latest_checkpoint() {
        return ReduceRecovery::ResumeFromCheckpoint(ResumePoint {
            checkpoint_uri: checkpoint.aggregate_uri.clone(),
            last_key: checkpoint.last_key.clone(),
            processed_keys: checkpoint.processed_keys,
        });
    }
    if task.progress_attempt.is_some() {
        return ReduceRecovery::RestartLostProgress;
    }
    ReduceRecovery::CleanRestart
}

/// Pick the highest-priority runnable task: map work before reduce work,
/// fewer attempts first, then lowest index. Falls back to a speculative
/// duplicate of a straggler when enabled and nothing is idle.
fn pick_task<'a>(
    jobs: impl Iterator<Item = &'a Job>,
    config: &ClusterConfig,
) -> Option<Candidate> {
    let jobs: Vec<&Job> = jobs.filter(|j| !j.state.is_terminal()).collect();

    let runnable = |t: &&Task| t.state == TaskState::Idle && t.attempt < config.max_attempts;
    let priority = |t: &&Task| (t.attempt, t.id.index);

    // Map work drains first; reduces only run in jobs whose map phase has
    // closed. Ties break toward fewer attempts, then lowest index.
    let best = jobs
        .iter()
        .flat_map(|job| job.map_tasks.iter())
        .filter(runnable)
        .min_by_key(priority)
        .map(|task| (task, Phase::Map))
        .or_else(|| {
            jobs.iter()
                .filter(|job| job.state == JobState::Reducing)
                .flat_map(|job| job.reduce_tasks.iter())
                .filter(runnable)
                .min_by_key(priority)
                .map(|task| (task, Phase::Reduce))
        });
    if let Some((task, phase)) = best {
        let recovery = (phase == Phase::Reduce).then(|| classify_reduce_recovery(task));
        return Some(Candidate {
            task: task.id,
            attempt: task.attempt + 1,
            speculative: false,
            recovery,
        });
    }

    if config.speculation.enabled {
        return pick_straggler(&jobs, config);
    }
    None
}

/// Straggler mitigation: once enough of the phase is complete, duplicate
/// the slowest task when its progress trails the phase median.
fn pick_straggler(jobs: &[&Job], config: &ClusterConfig) -> Option<Candidate> {
    for job in jobs {
        let phase_tasks: &[Task] = match job.state {
            JobState::Mapping => &job.map_tasks,
            JobState::Reducing => &job.reduce_tasks,
            _ => continue,
        };
        let total = phase_tasks.len();
        if total == 0 {
            continue;
        }
        let completed = phase_tasks
            .iter()
            .filter(|t| t.state == TaskState::Completed)
            .count();
        if (completed as f64) / (total as f64) < config.speculation.phase_completion_threshold {
            continue;
        }
        let mut progresses: Vec<f64> = phase_tasks.iter().map(|t| t.progress).collect();
        progresses.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = progresses[progresses.len() / 2];
        let straggler = match phase_tasks.iter().find(|t| {
            t.state == TaskState::Assigned
                && t.assignments.len() == 1
                && t.attempt < config.max_attempts
                && t.progress < median * config.speculation.progress_ratio
        }) {
            Some(task) => task,
            None => continue,
        };
        let recovery =
            (straggler.id.phase == Phase::Reduce).then(|| classify_reduce_recovery(straggler));
        return Some(Candidate {
            task: straggler.id,
            attempt: straggler.attempt + 1,
            speculative: true,
            recovery,
        });
    }
    None
}

/// Shard URIs a reducer for `partition` must merge: one per map task, from
/// the accepted attempt's outputs.
fn reduce_shard_uris(job: &Job, partition: u32) -> Result<Vec<String>> {
    job.map_tasks
        .iter()
        .map(|task| {
            task.output_locations
                .get(partition as usize)
                .map(|loc| loc.uri.clone())
                .ok_or_else(|| {
                    EngineError::Internal(format!(
                        "map {} has no output for partition {partition}",
                        task.id.index
                    ))
                })
        })
        .collect()
}
