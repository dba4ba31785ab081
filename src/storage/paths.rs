//! Object-store URI layout.
//!
//! Paths are attempt-scoped so a re-executed or speculative attempt never
//! races a prior attempt's objects; only the canonical output path is
//! attempt-free, and it is written exactly once per partition per job.

use crate::model::JobId;

/// Intermediate shard produced by one map attempt for one partition.
pub fn map_shard(job: JobId, map_index: u32, attempt: u32, partition: u32) -> String {
    format!("jobs/{job}/map/{map_index}/attempt-{attempt}/part-{partition}")
}

/// Reducer checkpoint object.
pub fn reduce_checkpoint(job: JobId, reduce_index: u32, attempt: u32, seq: u32) -> String {
    format!("jobs/{job}/reduce/{reduce_index}/attempt-{attempt}/checkpoint-{seq}")
}

/// Prefix holding every checkpoint of one reduce task, for lazy GC.
pub fn reduce_checkpoint_prefix(job: JobId, reduce_index: u32) -> String {
    format!("jobs/{job}/reduce/{reduce_index}/")
}

/// Temp location a reducer writes before committing its final output.
pub fn reduce_output_temp(job: JobId, reduce_index: u32, attempt: u32) -> String {
    format!("jobs/{job}/reduce/{reduce_index}/attempt-{attempt}/out")
}

/// Canonical final output for one reduce partition.
pub fn canonical_output(job: JobId, reduce_index: u32) -> String {
    format!("jobs/{job}/output/part-{reduce_index}")
}
