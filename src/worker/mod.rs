//! Worker runtime.
//!
//! A worker is a single-slot executor plus a heartbeat loop. The
//! heartbeat reply is the only control channel: it delivers assignments,
//! cancellation, and (implicitly, through the registration error path)
//! the order to re-register after this worker was declared dead.

pub mod executor;
pub mod feed;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::api::{
    CorruptShardReport, HeartbeatRequest, HeartbeatResponse, RegisterRequest, TaskAssignment,
    TaskStatus,
};
use crate::client::LeaderClient;
use crate::error::{EngineError, Result};
use crate::mapreduce::FunctionRegistry;
use crate::model::{TaskId, WorkerId};
use crate::storage::{FsStore, ObjectStore};
use executor::{CheckpointPolicy, TaskResult};
use feed::TaskFeed;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Coordinator peer addresses.
    pub coordinators: Vec<String>,
    /// Root of the shared object store (filesystem backend).
    pub store_root: PathBuf,
    /// Address reported at registration, for operator visibility.
    pub address: String,
    #[serde(default = "default_checkpoint_interval_keys")]
    pub checkpoint_interval_keys: u64,
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
}

fn default_checkpoint_interval_keys() -> u64 {
    10_000
}

fn default_checkpoint_interval_secs() -> u64 {
    30
}

impl WorkerConfig {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }
}

struct Slot {
    task: TaskId,
    attempt: u32,
    feed: Arc<TaskFeed>,
    phase: SlotPhase,
}

enum SlotPhase {
    Running(JoinHandle<TaskResult>),
    /// Finished; the result is reported until the leader acknowledges.
    Finished(TaskResult),
}

pub struct WorkerRuntime {
    config: WorkerConfig,
    client: LeaderClient,
    store: Arc<dyn ObjectStore>,
    registry: Arc<FunctionRegistry>,
    policy: CheckpointPolicy,
}

impl WorkerRuntime {
    pub fn new(config: WorkerConfig, registry: FunctionRegistry) -> Result<Self> {
        let client = LeaderClient::new(config.coordinators.clone())?;
        let store: Arc<dyn ObjectStore> = Arc::new(FsStore::new(config.store_root.clone()));
        let policy = CheckpointPolicy {
            interval_keys: config.checkpoint_interval_keys,
            interval: Duration::from_secs(config.checkpoint_interval_secs),
        };
        Ok(Self {
            config,
            client,
            store,
            registry: Arc::new(registry),
            policy,
        })
    }

    /// Register and heartbeat forever. Returns only on unrecoverable
    /// configuration errors.
    pub async fn run(&self) -> Result<()> {
        loop {
            let (worker_id, interval) = self.register().await?;
            info!(%worker_id, "worker registered");
            if let Err(err) = self.heartbeat_loop(&worker_id, interval).await {
                match err {
                    EngineError::WorkerNotFound(_) => {
                        // Declared dead while partitioned; shed state and
                        // come back as a fresh worker.
                        warn!(%worker_id, "declared dead by leader, re-registering");
                        continue;
                    }
                    other => return Err(other),
                }
            }
        }
    }

    async fn register(&self) -> Result<(WorkerId, Duration)> {
        let response: crate::api::RegisterResponse = self
            .client
            .post(
                "/api/register",
                &RegisterRequest {
                    address: self.config.address.clone(),
                },
            )
            .await?;
        Ok((
            response.worker_id,
            Duration::from_secs(response.heartbeat_interval_secs.max(1)),
        ))
    }

    async fn heartbeat_loop(&self, worker_id: &WorkerId, interval: Duration) -> Result<()> {
        let mut slot: Option<Slot> = None;
        loop {
            settle_slot(&mut slot).await;
            let (status, checkpoint, corrupt_shards) = describe_slot(&slot);
            let request = HeartbeatRequest {
                worker_id: worker_id.clone(),
                status,
                checkpoint: checkpoint.clone(),
                corrupt_shards,
            };
            match self.client.post::<_, HeartbeatResponse>("/api/heartbeat", &request).await {
                Ok(response) => {
                    self.apply_reply(&mut slot, &request, response);
                }
                Err(err @ EngineError::WorkerNotFound(_)) => {
                    if let Some(slot) = &slot {
                        slot.feed.cancel();
                    }
                    return Err(err);
                }
                Err(err) => {
                    // Leadership churn or a transient partition; keep the
                    // slot and retry on the next beat.
                    warn!(%err, "heartbeat failed");
                    if let (Some(slot), Some(report)) = (&slot, checkpoint) {
                        slot.feed.return_checkpoint(report);
                    }
                }
            }
            sleep(interval).await;
        }
    }

    fn apply_reply(
        &self,
        slot: &mut Option<Slot>,
        request: &HeartbeatRequest,
        response: HeartbeatResponse,
    ) {
        if response.cancel {
            if let Some(active) = slot.take() {
                info!(task = %active.task, "task cancelled by leader");
                active.feed.cancel();
            }
        } else {
            match &request.status {
                // The leader saw and recorded the terminal report.
                TaskStatus::Completing { .. } | TaskStatus::Failed { .. } => {
                    *slot = None;
                }
                _ => {}
            }
        }
        if let Some(assignment) = response.assignment {
            if slot.is_none() {
                *slot = Some(self.start_task(assignment));
            } else {
                warn!("assignment received while busy, ignoring");
            }
        }
    }

    fn start_task(&self, assignment: TaskAssignment) -> Slot {
        info!(
            task = %assignment.task,
            attempt = assignment.attempt,
            speculative = assignment.speculative,
            "starting task"
        );
        let feed = Arc::new(TaskFeed::new());
        let functions = match self.registry.resolve(&assignment.code_ref) {
            Ok(functions) => functions,
            Err(err) => {
                let task = assignment.task;
                let attempt = assignment.attempt;
                return Slot {
                    task,
                    attempt,
                    feed,
                    phase: SlotPhase::Finished(Err(err)),
                };
            }
        };
        let task = assignment.task;
        let attempt = assignment.attempt;
        let handle = tokio::spawn(executor::run_task(
            self.store.clone(),
            functions,
            assignment,
            self.policy.clone(),
            feed.clone(),
        ));
        Slot {
            task,
            attempt,
            feed,
            phase: SlotPhase::Running(handle),
        }
    }
}

/// Fold a just-finished executor join handle into a reportable result.
async fn settle_slot(slot: &mut Option<Slot>) {
    let finished = matches!(
        slot,
        Some(Slot {
            phase: SlotPhase::Running(handle),
            ..
        }) if handle.is_finished()
    );
    if !finished {
        return;
    }
    if let Some(mut active) = slot.take() {
        if let SlotPhase::Running(handle) = active.phase {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(EngineError::Internal(format!(
                    "executor panicked: {join_err}"
                ))),
            };
            // A cancelled task leaves nothing to report; free the slot.
            if matches!(result, Ok(None)) {
                return;
            }
            active.phase = SlotPhase::Finished(result);
        }
        *slot = Some(active);
    }
}

/// Render the slot as heartbeat fields.
fn describe_slot(
    slot: &Option<Slot>,
) -> (
    TaskStatus,
    Option<crate::api::CheckpointReport>,
    Vec<CorruptShardReport>,
) {
    match slot {
        None => (TaskStatus::Idle, None, Vec::new()),
        Some(active) => match &active.phase {
            SlotPhase::Running(_) => {
                let (progress, last_key, ingested_maps) = active.feed.snapshot();
                (
                    TaskStatus::Running {
                        task: active.task,
                        attempt: active.attempt,
                        progress,
                        last_key,
                        ingested_maps,
                    },
                    active.feed.take_checkpoint(),
                    Vec::new(),
                )
            }
            SlotPhase::Finished(Ok(Some(outputs))) => (
                TaskStatus::Completing {
                    task: active.task,
                    attempt: active.attempt,
                    outputs: outputs.clone(),
                },
                active.feed.take_checkpoint(),
                Vec::new(),
            ),
            // Cancelled mid-flight: nothing to report, slot is recycled.
            SlotPhase::Finished(Ok(None)) => (TaskStatus::Idle, None, Vec::new()),
            SlotPhase::Finished(Err(err)) => {
                let corrupt = match err {
                    EngineError::ShardCorrupt {
                        job_id,
                        map_index,
                        partition,
                    } => vec![CorruptShardReport {
                        job: *job_id,
                        map_index: *map_index,
                        partition: *partition,
                    }],
                    _ => Vec::new(),
                };
                (
                    TaskStatus::Failed {
                        task: active.task,
                        attempt: active.attempt,
                        reason: err.to_string(),
                    },
                    None,
                    corrupt,
                )
            }
        },
    }
}

/// Run a worker process against the given configuration.
pub async fn run(config: WorkerConfig) -> Result<()> {
    let runtime = WorkerRuntime::new(config, FunctionRegistry::builtin())?;
    runtime.run().await
}
