use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use crate::scheduler::job::{CompilationJob, JobId};

/// Higher priority first, then submission order.
///
/// The submission sequence number stands in for `submitted_at` so that wall
/// clock adjustments can never reorder jobs.
type QueueKey = (Reverse<i32>, u64);

/// Jobs waiting for a free compilation slot, kept in service order.
#[derive(Debug, Default)]
pub struct PendingQueue {
    ordered: BTreeMap<QueueKey, CompilationJob>,
    index: HashMap<JobId, QueueKey>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(job: &CompilationJob) -> QueueKey {
        (Reverse(job.priority), job.seq)
    }

    /// Add a job. A job whose id is already queued is replaced.
    pub fn push(&mut self, job: CompilationJob) {
        if let Some(old) = self.index.remove(&job.id) {
            self.ordered.remove(&old);
        }
        let key = Self::key(&job);
        self.index.insert(job.id, key);
        self.ordered.insert(key, job);
    }

    /// Take the job that should be served next.
    pub fn pop(&mut self) -> Option<CompilationJob> {
        let (_, job) = self.ordered.pop_first()?;
        self.index.remove(&job.id);
        Some(job)
    }

    /// Remove a specific job, returning it if it was queued.
    pub fn remove(&mut self, id: &JobId) -> Option<CompilationJob> {
        let key = self.index.remove(id)?;
        self.ordered.remove(&key)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.index.contains_key(id)
    }

    /// Remove every job, in service order.
    pub fn drain(&mut self) -> Vec<CompilationJob> {
        self.index.clear();
        std::mem::take(&mut self.ordered).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}
