//! End-to-end pipeline scenarios.
//!
//! A single-process harness wires the real scheduler, state machine, and
//! task executors together over a loopback log and a tempdir-backed
//! object store, so every fault-injection path runs deterministically.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use gristmill::api::{
    CorruptShardReport, HeartbeatRequest, HeartbeatResponse, RegisterRequest, TaskAssignment,
    TaskStatus,
};
use gristmill::checkpoint;
use gristmill::config::ClusterConfig;
use gristmill::coordinator::command::LogCommand;
use gristmill::coordinator::scheduler::{ProposeLog, Scheduler};
use gristmill::coordinator::state::{CoordinatorState, SharedState};
use gristmill::error::EngineError;
use gristmill::mapreduce::merge::GroupedMerge;
use gristmill::mapreduce::{partition_for, shard, Aggregate, FunctionRegistry, JobFunctions, Reducer};
use gristmill::model::{JobId, JobManifest, JobState, Phase, TaskState, WorkerId};
use gristmill::storage::{paths, FsStore, ObjectStore};
use gristmill::testing::LoopbackLog;
use gristmill::worker::executor::{self, CheckpointPolicy};
use gristmill::worker::feed::TaskFeed;

const CORPUS: [&str; 4] = [
    "the quick brown fox",
    "the lazy dog",
    "quick brown dog",
    "fox fox fox",
];

fn expected_counts() -> BTreeMap<&'static str, u64> {
    BTreeMap::from([
        ("brown", 2),
        ("dog", 2),
        ("fox", 4),
        ("lazy", 1),
        ("quick", 2),
        ("the", 2),
    ])
}

struct Cluster {
    scheduler: Arc<Scheduler>,
    state: SharedState,
    log: Arc<LoopbackLog>,
    store: Arc<dyn ObjectStore>,
    registry: FunctionRegistry,
    policy: CheckpointPolicy,
    _dir: tempfile::TempDir,
}

impl Cluster {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(tweak: impl FnOnce(&mut ClusterConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ClusterConfig::single_node("127.0.0.1:0", dir.path().to_path_buf());
        tweak(&mut config);
        let (log, state) = LoopbackLog::new(config.max_attempts);
        let store: Arc<dyn ObjectStore> = Arc::new(FsStore::new(dir.path()));
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(config),
            state.clone(),
            log.clone(),
            store.clone(),
        ));
        scheduler.on_leadership_change(true);
        Self {
            scheduler,
            state,
            log,
            store,
            registry: FunctionRegistry::builtin(),
            policy: CheckpointPolicy {
                interval_keys: 2,
                interval: Duration::from_secs(3600),
            },
            _dir: dir,
        }
    }

    async fn seed_inputs(&self, texts: &[&str]) -> Vec<String> {
        let mut uris = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            let uri = format!("in/split-{i}");
            self.store.put(&uri, text.as_bytes()).await.unwrap();
            uris.push(uri);
        }
        uris
    }

    async fn submit(&self, inputs: Vec<String>, reduce_count: u32) -> JobId {
        let job_id = JobId::new();
        let map_count = inputs.len() as u32;
        self.log
            .propose(LogCommand::JobSubmitted {
                job_id,
                manifest: JobManifest {
                    inputs,
                    code_ref: "wordcount".into(),
                },
                map_count,
                reduce_count,
                submitted_at: Utc::now(),
            })
            .await
            .unwrap();
        job_id
    }

    async fn register(&self) -> WorkerId {
        self.scheduler
            .handle_register(RegisterRequest {
                address: "sim:0".into(),
            })
            .await
            .unwrap()
            .worker_id
    }

    async fn heartbeat(&self, worker: &WorkerId, status: TaskStatus) -> HeartbeatResponse {
        self.scheduler
            .handle_heartbeat(HeartbeatRequest {
                worker_id: worker.clone(),
                status,
                checkpoint: None,
                corrupt_shards: vec![],
            })
            .await
            .unwrap()
    }

    async fn idle(&self, worker: &WorkerId) -> Option<TaskAssignment> {
        self.heartbeat(worker, TaskStatus::Idle).await.assignment
    }

    fn functions(&self) -> Arc<dyn JobFunctions> {
        self.registry.resolve("wordcount").unwrap()
    }

    /// One scheduling round for a simulated worker: ask for work, run it
    /// with the real executor, and report outcomes over heartbeats,
    /// following chained assignments until the reply comes back empty.
    async fn drive_once(&self, worker: &WorkerId) -> bool {
        let Some(assignment) = self.idle(worker).await else {
            return false;
        };
        self.execute_chain(worker, assignment).await;
        true
    }

    async fn execute_chain(&self, worker: &WorkerId, first: TaskAssignment) {
        let mut current = Some(first);
        while let Some(assignment) = current {
            current = self.execute(worker, assignment).await;
        }
    }

    /// Run one assignment to completion and report it. Returns the next
    /// assignment the completion reply chained, if any.
    async fn execute(
        &self,
        worker: &WorkerId,
        assignment: TaskAssignment,
    ) -> Option<TaskAssignment> {
        let feed = Arc::new(TaskFeed::new());
        let result = executor::run_task(
            self.store.clone(),
            self.functions(),
            assignment.clone(),
            self.policy.clone(),
            feed.clone(),
        )
        .await;
        match result {
            Ok(Some(outputs)) => {
                // Flush any checkpoint the executor produced before the
                // completion report, as the live heartbeat loop would.
                if let Some(report) = feed.take_checkpoint() {
                    let (progress, last_key, ingested_maps) = feed.snapshot();
                    self.scheduler
                        .handle_heartbeat(HeartbeatRequest {
                            worker_id: worker.clone(),
                            status: TaskStatus::Running {
                                task: assignment.task,
                                attempt: assignment.attempt,
                                progress,
                                last_key,
                                ingested_maps,
                            },
                            checkpoint: Some(report),
                            corrupt_shards: vec![],
                        })
                        .await
                        .unwrap();
                }
                self.heartbeat(
                    worker,
                    TaskStatus::Completing {
                        task: assignment.task,
                        attempt: assignment.attempt,
                        outputs,
                    },
                )
                .await
                .assignment
            }
            Ok(None) => None,
            Err(err) => {
                let corrupt_shards = match &err {
                    EngineError::ShardCorrupt {
                        job_id,
                        map_index,
                        partition,
                    } => vec![CorruptShardReport {
                        job: *job_id,
                        map_index: *map_index,
                        partition: *partition,
                    }],
                    _ => vec![],
                };
                self.scheduler
                    .handle_heartbeat(HeartbeatRequest {
                        worker_id: worker.clone(),
                        status: TaskStatus::Failed {
                            task: assignment.task,
                            attempt: assignment.attempt,
                            reason: err.to_string(),
                        },
                        checkpoint: None,
                        corrupt_shards,
                    })
                    .await
                    .unwrap()
                    .assignment
            }
        }
    }

    async fn run_to_terminal(&self, workers: &[WorkerId], job_id: JobId) -> JobState {
        for _ in 0..64 {
            let state = self.job_state(job_id);
            if state.is_terminal() {
                return state;
            }
            for worker in workers {
                self.drive_once(worker).await;
            }
        }
        self.job_state(job_id)
    }

    fn job_state(&self, job_id: JobId) -> JobState {
        self.state.read().unwrap().job(&job_id).unwrap().state
    }

    async fn read_counts(&self, job_id: JobId, reduce_count: u32) -> BTreeMap<String, u64> {
        let mut counts = BTreeMap::new();
        for r in 0..reduce_count {
            let uri = paths::canonical_output(job_id, r);
            let body = String::from_utf8(self.store.get(&uri).await.unwrap()).unwrap();
            for line in body.lines() {
                let (word, count) = line.split_once('\t').unwrap();
                counts.insert(word.to_string(), count.parse().unwrap());
            }
        }
        counts
    }
}

fn assert_expected_output(counts: &BTreeMap<String, u64>) {
    let expected = expected_counts();
    assert_eq!(counts.len(), expected.len());
    for (word, count) in expected {
        assert_eq!(counts.get(word), Some(&count), "count for {word:?}");
    }
}

// ── Scenario 1: happy path ───────────────────────────────────────────────

#[tokio::test]
async fn happy_path_produces_reference_counts() {
    let cluster = Cluster::new();
    let inputs = cluster.seed_inputs(&CORPUS).await;
    let job_id = cluster.submit(inputs, 2).await;
    let workers = [cluster.register().await, cluster.register().await];

    let state = cluster.run_to_terminal(&workers, job_id).await;
    assert_eq!(state, JobState::Completed);

    let counts = cluster.read_counts(job_id, 2).await;
    assert_expected_output(&counts);

    // Each word landed in exactly the partition its hash selects.
    for r in 0..2u32 {
        let uri = paths::canonical_output(job_id, r);
        let body = String::from_utf8(cluster.store.get(&uri).await.unwrap()).unwrap();
        for line in body.lines() {
            let (word, _) = line.split_once('\t').unwrap();
            assert_eq!(partition_for(word, 2), r, "partition for {word:?}");
        }
    }
}

// ── Scenario 2: map worker dies after emit, before any ingest ────────────

#[tokio::test(start_paused = true)]
async fn durable_map_output_survives_its_worker() {
    let cluster = Cluster::new();
    let inputs = cluster.seed_inputs(&CORPUS).await;
    let job_id = cluster.submit(inputs, 2).await;
    let w1 = cluster.register().await;

    // w1 runs all four maps, then vanishes before any reducer starts.
    let mut next = cluster.idle(&w1).await;
    for _ in 0..4 {
        let assignment = next.unwrap();
        assert_eq!(assignment.task.phase, Phase::Map);
        next = cluster.execute(&w1, assignment).await;
    }
    assert_eq!(cluster.job_state(job_id), JobState::Reducing);

    let _ = next;
    tokio::time::advance(Duration::from_secs(7)).await;
    cluster.scheduler.check_timeouts().await.unwrap();

    // Shards live in the object store, so no map is re-executed.
    {
        let guard = cluster.state.read().unwrap();
        let job = guard.job(&job_id).unwrap();
        assert!(job.map_tasks.iter().all(|t| t.state == TaskState::Completed));
        assert!(job.map_tasks.iter().all(|t| t.attempt == 1));
    }

    let w2 = cluster.register().await;
    let state = cluster.run_to_terminal(&[w2], job_id).await;
    assert_eq!(state, JobState::Completed);
    assert_expected_output(&cluster.read_counts(job_id, 2).await);
}

// ── Scenario 3: reducer dies mid-partition with a committed checkpoint ───

#[tokio::test(start_paused = true)]
async fn replacement_reducer_resumes_from_checkpoint() {
    let cluster = Cluster::new();
    let inputs = cluster.seed_inputs(&CORPUS).await;
    let job_id = cluster.submit(inputs, 2).await;
    let w1 = cluster.register().await;
    let mut pending = cluster.idle(&w1).await;
    for _ in 0..4 {
        let map_assignment = pending.unwrap();
        assert_eq!(map_assignment.task.phase, Phase::Map);
        pending = cluster.execute(&w1, map_assignment).await;
    }

    // w1 takes reduce work until it holds a partition with at least two
    // key groups, finishing any that are too small to interrupt usefully.
    let (assignment, groups) = loop {
        let assignment = match pending.take() {
            Some(assignment) => assignment,
            None => cluster.idle(&w1).await.unwrap(),
        };
        assert_eq!(assignment.task.phase, Phase::Reduce);
        let gristmill::api::TaskInput::Reduce { shard_uris, resume } = &assignment.input else {
            panic!("expected reduce input");
        };
        assert!(resume.is_none());
        let mut shards = Vec::new();
        for (m, uri) in shard_uris.iter().enumerate() {
            let bytes = cluster.store.get(uri).await.unwrap();
            shards.push(shard::decode(&bytes, job_id, m as u32, assignment.task.index).unwrap());
        }
        let groups: Vec<(String, Vec<String>)> = GroupedMerge::new(shards).collect();
        if groups.len() >= 2 {
            break (assignment, groups);
        }
        pending = cluster.execute(&w1, assignment).await;
    };
    let reduce_index = assignment.task.index;
    let half = groups.len() / 2;

    let functions = cluster.functions();
    let reducer = functions.reducer();
    let mut aggregate = functions.new_aggregate();
    for (key, values) in &groups[..half] {
        aggregate.merge(key, &reducer.reduce(key, values));
    }
    let last_key = groups[half - 1].0.clone();
    let checkpoint_uri = paths::reduce_checkpoint(job_id, reduce_index, assignment.attempt, 1);
    checkpoint::write_checkpoint(
        &cluster.store,
        &checkpoint_uri,
        half as u64,
        &last_key,
        aggregate.serialize().unwrap(),
    )
    .await
    .unwrap();
    cluster
        .scheduler
        .handle_heartbeat(HeartbeatRequest {
            worker_id: w1.clone(),
            status: TaskStatus::Running {
                task: assignment.task,
                attempt: assignment.attempt,
                progress: 0.5,
                last_key: Some(last_key.clone()),
                ingested_maps: (0..4).collect(),
            },
            checkpoint: Some(gristmill::api::CheckpointReport {
                task: assignment.task,
                attempt: assignment.attempt,
                seq: 1,
                processed_keys: half as u64,
                last_key: last_key.clone(),
                aggregate_uri: checkpoint_uri.clone(),
            }),
            corrupt_shards: vec![],
        })
        .await
        .unwrap();

    // w1 dies; the replacement is offered the committed checkpoint.
    tokio::time::advance(Duration::from_secs(7)).await;
    cluster.scheduler.check_timeouts().await.unwrap();

    let w2 = cluster.register().await;
    // The scheduler prefers fresher tasks; drain other reduce work until
    // the interrupted partition comes up.
    let mut offer = cluster.idle(&w2).await;
    let replacement = loop {
        let candidate = match offer.take() {
            Some(candidate) => candidate,
            None => cluster.idle(&w2).await.unwrap(),
        };
        if candidate.task.index == reduce_index {
            break candidate;
        }
        offer = cluster.execute(&w2, candidate).await;
    };
    assert_eq!(replacement.attempt, 2);
    let gristmill::api::TaskInput::Reduce { resume, .. } = &replacement.input else {
        panic!("expected reduce input");
    };
    let point = resume.as_ref().expect("resume point offered");
    assert_eq!(point.last_key, last_key);
    assert_eq!(point.processed_keys, half as u64);

    cluster.execute_chain(&w2, replacement).await;
    let state = cluster.run_to_terminal(&[w2.clone()], job_id).await;
    assert_eq!(state, JobState::Completed);
    assert_expected_output(&cluster.read_counts(job_id, 2).await);

    // The winning attempt is 2, and exactly one completion was logged for
    // this reduce task.
    {
        let guard = cluster.state.read().unwrap();
        let task = guard
            .job(&job_id)
            .unwrap()
            .task(Phase::Reduce, reduce_index)
            .unwrap();
        assert_eq!(task.attempt, 2);
        assert_eq!(task.completed_attempt, Some(2));
    }
    let completions = cluster
        .log
        .entries()
        .into_iter()
        .filter(|cmd| {
            matches!(
                cmd,
                LogCommand::TaskCompleted { phase: Phase::Reduce, index, .. }
                    if *index == reduce_index
            )
        })
        .count();
    assert_eq!(completions, 1);
}

// ── Scenario 4: leader fails while a reduce task is assigned ─────────────

#[tokio::test]
async fn leader_handoff_preserves_in_flight_attempts() {
    let cluster = Cluster::new();
    let inputs = cluster.seed_inputs(&CORPUS).await;
    let job_id = cluster.submit(inputs, 2).await;
    let worker = cluster.register().await;
    let mut next = cluster.idle(&worker).await;
    for _ in 0..4 {
        let map_assignment = next.unwrap();
        assert_eq!(map_assignment.task.phase, Phase::Map);
        next = cluster.execute(&worker, map_assignment).await;
    }
    let assignment = next.unwrap();
    assert_eq!(assignment.task.phase, Phase::Reduce);

    // The old leader steps down; a new scheduler over the same replicated
    // state takes over and rebuilds its timer wheel.
    cluster.scheduler.on_leadership_change(false);
    assert!(matches!(
        cluster
            .scheduler
            .handle_heartbeat(HeartbeatRequest {
                worker_id: worker.clone(),
                status: TaskStatus::Idle,
                checkpoint: None,
                corrupt_shards: vec![],
            })
            .await,
        Err(EngineError::NotLeader { .. })
    ));

    let new_leader = Arc::new(Scheduler::new(
        Arc::new(ClusterConfig::single_node(
            "127.0.0.1:0",
            cluster._dir.path().to_path_buf(),
        )),
        cluster.state.clone(),
        cluster.log.clone(),
        cluster.store.clone(),
    ));
    new_leader.on_leadership_change(true);

    // The in-flight lease survived the handoff untouched.
    {
        let guard = cluster.state.read().unwrap();
        let task = guard
            .job(&job_id)
            .unwrap()
            .task(assignment.task.phase, assignment.task.index)
            .unwrap();
        assert_eq!(task.state, TaskState::Assigned);
        assert_eq!(task.attempt, assignment.attempt);
    }

    // Finish under the new leader.
    let swap = Cluster {
        scheduler: new_leader,
        state: cluster.state.clone(),
        log: cluster.log.clone(),
        store: cluster.store.clone(),
        registry: FunctionRegistry::builtin(),
        policy: cluster.policy.clone(),
        _dir: tempfile::tempdir().unwrap(),
    };
    swap.execute_chain(&worker, assignment).await;
    let state = swap.run_to_terminal(&[worker.clone()], job_id).await;
    assert_eq!(state, JobState::Completed);
    assert_expected_output(&swap.read_counts(job_id, 2).await);

    // No attempt was restarted purely because of the leader change.
    let guard = swap.state.read().unwrap();
    assert!(guard
        .job(&job_id)
        .unwrap()
        .tasks()
        .all(|t| t.attempt == 1));
}

// ── Scenario 5: intermediate shard corruption ────────────────────────────

#[tokio::test]
async fn corrupt_shard_triggers_map_reexecution_and_clean_reduce_restart() {
    let cluster = Cluster::new();
    let inputs = cluster.seed_inputs(&CORPUS).await;
    let job_id = cluster.submit(inputs, 2).await;
    let worker = cluster.register().await;
    let mut next = cluster.idle(&worker).await;
    for _ in 0..4 {
        let map_assignment = next.unwrap();
        assert_eq!(map_assignment.task.phase, Phase::Map);
        next = cluster.execute(&worker, map_assignment).await;
    }

    // Flip bytes in shard (map 1, partition 0) after completion.
    let shard_uri = {
        let guard = cluster.state.read().unwrap();
        guard.job(&job_id).unwrap().task(Phase::Map, 1).unwrap().output_locations[0]
            .uri
            .clone()
    };
    let mut bytes = cluster.store.get(&shard_uri).await.unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xFF;
    cluster.store.put(&shard_uri, &bytes).await.unwrap();

    // The chained reduce assignment hits the corrupt shard, reports it,
    // and the recovery plays out to completion.
    cluster.execute_chain(&worker, next.unwrap()).await;
    let state = cluster.run_to_terminal(&[worker.clone()], job_id).await;
    assert_eq!(state, JobState::Completed);
    assert_expected_output(&cluster.read_counts(job_id, 2).await);

    // Map 1 ran twice; the corruption report is in the log.
    let guard = cluster.state.read().unwrap();
    let map1 = guard.job(&job_id).unwrap().task(Phase::Map, 1).unwrap();
    assert_eq!(map1.attempt, 2);
    assert_eq!(map1.completed_attempt, Some(2));
    drop(guard);
    assert!(cluster.log.entries().iter().any(|cmd| matches!(
        cmd,
        LogCommand::TaskFailed { phase: Phase::Map, index: 1, reason, .. }
            if reason.contains("checksum")
    )));
}

// ── Scenario 6: a task that always fails exhausts its attempts ───────────

#[tokio::test]
async fn exhausted_retries_fail_the_job_without_canonical_output() {
    let cluster = Cluster::with_config(|config| config.max_attempts = 2);
    let inputs = cluster.seed_inputs(&CORPUS).await;
    let job_id = cluster.submit(inputs, 2).await;
    let worker = cluster.register().await;

    // The worker reports failure for everything it is handed.
    let mut next = cluster.idle(&worker).await;
    for _ in 0..16 {
        if cluster.job_state(job_id).is_terminal() {
            break;
        }
        let Some(assignment) = next.take() else {
            break;
        };
        next = cluster
            .heartbeat(
                &worker,
                TaskStatus::Failed {
                    task: assignment.task,
                    attempt: assignment.attempt,
                    reason: "simulated permanent failure".into(),
                },
            )
            .await
            .assignment;
    }

    assert_eq!(cluster.job_state(job_id), JobState::Failed);
    {
        let guard = cluster.state.read().unwrap();
        let job = guard.job(&job_id).unwrap();
        assert!(job.failure_reason.as_deref().unwrap().contains("exhausted"));
    }
    let outputs = cluster
        .store
        .list(&format!("jobs/{job_id}/output/"))
        .await
        .unwrap();
    assert!(outputs.is_empty(), "no canonical outputs for a failed job");
}

// ── Log replay determinism ───────────────────────────────────────────────

#[tokio::test]
async fn replaying_the_log_reproduces_the_state_machine() {
    let cluster = Cluster::new();
    let inputs = cluster.seed_inputs(&CORPUS).await;
    let job_id = cluster.submit(inputs, 2).await;
    let workers = [cluster.register().await, cluster.register().await];
    let state = cluster.run_to_terminal(&workers, job_id).await;
    assert_eq!(state, JobState::Completed);

    let mut replayed = CoordinatorState::new(4);
    for command in cluster.log.entries() {
        replayed.apply(&command);
    }
    assert_eq!(
        replayed.to_snapshot_bytes().unwrap(),
        cluster.state.read().unwrap().to_snapshot_bytes().unwrap()
    );
}
