//! Shared state between the executor and the heartbeat loop.
//!
//! The executor writes progress and pending checkpoint reports; the
//! heartbeat loop drains them into requests and flips the cancel flag
//! when the leader revokes the lease. Plain mutex, never held across an
//! await.

use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::api::CheckpointReport;

#[derive(Default)]
pub struct TaskFeed {
    inner: Mutex<FeedInner>,
}

#[derive(Default)]
struct FeedInner {
    progress: f64,
    last_key: Option<String>,
    ingested_maps: BTreeSet<u32>,
    pending_checkpoint: Option<CheckpointReport>,
    cancelled: bool,
}

impl TaskFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_progress(&self, progress: f64, last_key: Option<String>) {
        let mut inner = self.inner.lock().expect("feed lock poisoned");
        inner.progress = progress;
        if last_key.is_some() {
            inner.last_key = last_key;
        }
    }

    pub fn record_ingest(&self, map_index: u32) {
        self.inner
            .lock()
            .expect("feed lock poisoned")
            .ingested_maps
            .insert(map_index);
    }

    /// Queue a checkpoint for the next heartbeat. A newer checkpoint
    /// supersedes an unsent older one; the committed log row is what
    /// matters, not every intermediate report.
    pub fn offer_checkpoint(&self, report: CheckpointReport) {
        self.inner.lock().expect("feed lock poisoned").pending_checkpoint = Some(report);
    }

    pub fn take_checkpoint(&self) -> Option<CheckpointReport> {
        self.inner
            .lock()
            .expect("feed lock poisoned")
            .pending_checkpoint
            .take()
    }

    /// Restore an unacknowledged checkpoint after a failed heartbeat so it
    /// rides the next one.
    pub fn return_checkpoint(&self, report: CheckpointReport) {
        let mut inner = self.inner.lock().expect("feed lock poisoned");
        let stale = inner
            .pending_checkpoint
            .as_ref()
            .is_some_and(|p| p.seq >= report.seq);
        if !stale {
            inner.pending_checkpoint = Some(report);
        }
    }

    pub fn cancel(&self) {
        self.inner.lock().expect("feed lock poisoned").cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().expect("feed lock poisoned").cancelled
    }

    pub fn snapshot(&self) -> (f64, Option<String>, Vec<u32>) {
        let inner = self.inner.lock().expect("feed lock poisoned");
        (
            inner.progress,
            inner.last_key.clone(),
            inner.ingested_maps.iter().copied().collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobId, Phase, TaskId};

    fn report(seq: u32) -> CheckpointReport {
        CheckpointReport {
            task: TaskId {
                job: JobId::new(),
                phase: Phase::Reduce,
                index: 0,
            },
            attempt: 1,
            seq,
            processed_keys: 10 * u64::from(seq),
            last_key: "k".into(),
            aggregate_uri: format!("ckpt-{seq}"),
        }
    }

    #[test]
    fn newer_checkpoint_supersedes_pending() {
        let feed = TaskFeed::new();
        feed.offer_checkpoint(report(1));
        feed.offer_checkpoint(report(2));
        assert_eq!(feed.take_checkpoint().unwrap().seq, 2);
        assert!(feed.take_checkpoint().is_none());
    }

    #[test]
    fn returned_checkpoint_does_not_clobber_newer() {
        let feed = TaskFeed::new();
        let first = report(1);
        feed.offer_checkpoint(first.clone());
        let taken = feed.take_checkpoint().unwrap();
        feed.offer_checkpoint(report(2));
        feed.return_checkpoint(taken);
        assert_eq!(feed.take_checkpoint().unwrap().seq, 2);
        let _ = first;
    }

    #[test]
    fn ingests_accumulate_without_duplicates() {
        let feed = TaskFeed::new();
        feed.record_ingest(1);
        feed.record_ingest(0);
        feed.record_ingest(1);
        let (_, _, ingested) = feed.snapshot();
        assert_eq!(ingested, vec![0, 1]);
    }
}
