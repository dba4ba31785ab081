//! Task execution.
//!
//! One map or reduce task at a time. All outputs go through the object
//! store's temp-write-plus-rename, so a task killed mid-flight leaves no
//! partially visible object behind. Cancellation is cooperative: the
//! executor polls its feed between key groups and unwinds cleanly.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::feed::TaskFeed;
use crate::api::{CheckpointReport, ResumePoint, TaskAssignment, TaskInput};
use crate::checkpoint;
use crate::error::{EngineError, Result};
use crate::mapreduce::merge::GroupedMerge;
use crate::mapreduce::{partition_for, shard, Aggregate, JobFunctions};
use crate::model::OutputLocation;
use crate::storage::{self, paths, ObjectStore};

/// Reducer checkpoint cadence.
#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    pub interval_keys: u64,
    pub interval: Duration,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            interval_keys: 10_000,
            interval: Duration::from_secs(30),
        }
    }
}

/// `Ok(None)` means the task was cancelled and produced nothing.
pub type TaskResult = Result<Option<Vec<OutputLocation>>>;

pub async fn run_task(
    store: Arc<dyn ObjectStore>,
    functions: Arc<dyn JobFunctions>,
    assignment: TaskAssignment,
    policy: CheckpointPolicy,
    feed: Arc<TaskFeed>,
) -> TaskResult {
    match &assignment.input {
        TaskInput::Map { .. } => run_map(&store, &functions, &assignment, &feed).await,
        TaskInput::Reduce { .. } => {
            run_reduce(&store, &functions, &assignment, &policy, &feed).await
        }
    }
}

/// Map side: read the split, run the user mapper, partition by key hash,
/// write one sorted shard per reduce partition.
async fn run_map(
    store: &Arc<dyn ObjectStore>,
    functions: &Arc<dyn JobFunctions>,
    assignment: &TaskAssignment,
    feed: &Arc<TaskFeed>,
) -> TaskResult {
    let TaskInput::Map {
        split_uri,
        reduce_count,
    } = &assignment.input
    else {
        return Err(EngineError::Internal("map task without map input".into()));
    };
    let raw = storage::get_with_retry(store, split_uri, 3).await?;
    let contents = String::from_utf8(raw)
        .map_err(|err| EngineError::Internal(format!("input split is not UTF-8: {err}")))?;
    feed.set_progress(0.2, None);

    let mapper = functions.mapper();
    let emitted = mapper.map(split_uri, &contents);
    feed.set_progress(0.5, None);
    if feed.is_cancelled() {
        return Ok(None);
    }

    let mut buckets: Vec<Vec<(String, String)>> = vec![Vec::new(); *reduce_count as usize];
    for (key, value) in emitted {
        let partition = partition_for(&key, *reduce_count) as usize;
        buckets[partition].push((key, value));
    }

    let mut outputs = Vec::with_capacity(buckets.len());
    for (partition, mut records) in buckets.into_iter().enumerate() {
        if feed.is_cancelled() {
            return Ok(None);
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        let bytes = shard::encode(&records);
        let uri = paths::map_shard(
            assignment.task.job,
            assignment.task.index,
            assignment.attempt,
            partition as u32,
        );
        store.put(&uri, &bytes).await?;
        outputs.push(OutputLocation {
            uri,
            size: bytes.len() as u64,
            checksum: shard::object_checksum(&bytes),
        });
        feed.set_progress(
            0.5 + 0.5 * (partition as f64 + 1.0) / f64::from(*reduce_count),
            None,
        );
    }
    info!(task = %assignment.task, attempt = assignment.attempt, "map task finished");
    Ok(Some(outputs))
}

/// Reduce side: stream-merge this partition across all map shards in key
/// order, checkpointing as it goes, then atomically publish the canonical
/// output.
async fn run_reduce(
    store: &Arc<dyn ObjectStore>,
    functions: &Arc<dyn JobFunctions>,
    assignment: &TaskAssignment,
    policy: &CheckpointPolicy,
    feed: &Arc<TaskFeed>,
) -> TaskResult {
    let TaskInput::Reduce { shard_uris, resume } = &assignment.input else {
        return Err(EngineError::Internal(
            "reduce task without reduce input".into(),
        ));
    };
    let task = assignment.task;

    let mut shards = Vec::with_capacity(shard_uris.len());
    let mut total_records = 0usize;
    for (map_index, uri) in shard_uris.iter().enumerate() {
        let bytes = storage::get_with_retry(store, uri, 3).await?;
        let records = shard::decode(&bytes, task.job, map_index as u32, task.index)?;
        total_records += records.len();
        feed.record_ingest(map_index as u32);
        shards.push(records);
    }
    feed.set_progress(0.05, None);

    let (mut aggregate, mut processed, watermark) =
        restore_or_fresh(store, functions, task, resume.as_ref(), &shards).await;

    let reducer = functions.reducer();
    let mut seq = 0u32;
    let mut since_checkpoint = 0u64;
    let mut last_checkpoint_at = Instant::now();
    let mut last_key: Option<String> = watermark.clone();

    for (key, values) in GroupedMerge::new(shards) {
        if feed.is_cancelled() {
            return Ok(None);
        }
        // On resume, every group at or below the watermark is already
        // folded into the restored aggregate.
        if watermark.as_deref().is_some_and(|w| key.as_str() <= w) {
            continue;
        }
        let outputs = reducer.reduce(&key, &values);
        aggregate.merge(&key, &outputs);
        processed += 1;
        since_checkpoint += 1;
        last_key = Some(key);

        let due = since_checkpoint >= policy.interval_keys
            || last_checkpoint_at.elapsed() >= policy.interval;
        if due {
            seq += 1;
            let report = write_checkpoint(
                store,
                &*aggregate,
                task,
                assignment.attempt,
                seq,
                processed,
                last_key.as_deref().unwrap_or_default(),
            )
            .await?;
            feed.offer_checkpoint(report);
            since_checkpoint = 0;
            last_checkpoint_at = Instant::now();
        }
        if total_records > 0 {
            feed.set_progress(
                0.05 + 0.9 * (processed as f64 / total_records as f64).min(1.0),
                last_key.clone(),
            );
        }
    }

    let records = aggregate.finish();
    let mut body = String::new();
    for (key, value) in &records {
        body.push_str(key);
        body.push('\t');
        body.push_str(value);
        body.push('\n');
    }
    let temp = paths::reduce_output_temp(task.job, task.index, assignment.attempt);
    let canonical = paths::canonical_output(task.job, task.index);
    store.put(&temp, body.as_bytes()).await?;
    // The canonical object is written exactly once per partition; a
    // speculative loser finds it already present and stands down.
    if store.exists(&canonical).await? {
        debug!(task = %task, "canonical output already present, discarding duplicate");
        store.delete(&temp).await?;
    } else {
        store.rename(&temp, &canonical).await?;
    }
    checkpoint::collect_superseded(
        store,
        &paths::reduce_checkpoint_prefix(task.job, task.index),
        "",
    )
    .await;
    feed.set_progress(1.0, last_key);
    info!(task = %task, attempt = assignment.attempt, processed, "reduce task finished");
    Ok(Some(vec![OutputLocation {
        uri: canonical,
        size: body.len() as u64,
        checksum: shard::object_checksum(body.as_bytes()),
    }]))
}

/// Resume from a committed checkpoint when one is offered and valid;
/// otherwise start clean. An invalid checkpoint demotes the resume to a
/// restart instead of failing the attempt.
async fn restore_or_fresh(
    store: &Arc<dyn ObjectStore>,
    functions: &Arc<dyn JobFunctions>,
    task: crate::model::TaskId,
    resume: Option<&ResumePoint>,
    shards: &[Vec<(String, String)>],
) -> (Box<dyn Aggregate>, u64, Option<String>) {
    if let Some(point) = resume {
        match checkpoint::load_checkpoint(store, task, point, shards).await {
            Ok(payload) => match functions.restore_aggregate(&payload.aggregate) {
                Ok(aggregate) => {
                    info!(
                        task = %task,
                        processed_keys = payload.processed_keys,
                        last_key = %payload.last_key,
                        "resuming from checkpoint"
                    );
                    return (aggregate, payload.processed_keys, Some(payload.last_key));
                }
                Err(err) => {
                    warn!(task = %task, %err, "aggregate restore failed, restarting clean");
                }
            },
            Err(err) => {
                warn!(task = %task, %err, "checkpoint invalid, restarting clean");
            }
        }
    }
    (functions.new_aggregate(), 0, None)
}

async fn write_checkpoint(
    store: &Arc<dyn ObjectStore>,
    aggregate: &dyn Aggregate,
    task: crate::model::TaskId,
    attempt: u32,
    seq: u32,
    processed_keys: u64,
    last_key: &str,
) -> Result<CheckpointReport> {
    let uri = paths::reduce_checkpoint(task.job, task.index, attempt, seq);
    checkpoint::write_checkpoint(store, &uri, processed_keys, last_key, aggregate.serialize()?)
        .await?;
    Ok(CheckpointReport {
        task,
        attempt,
        seq,
        processed_keys,
        last_key: last_key.to_string(),
        aggregate_uri: uri,
    })
}
