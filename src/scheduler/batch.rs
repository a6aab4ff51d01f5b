//! Waiting on a known set of jobs.
//!
//! The event channel drops the oldest events when a subscriber falls behind,
//! so a waiter that only counts final events can miss some of them and wait
//! forever. [`CompileScheduler::wait_for_jobs`] reconciles with the scheduler
//! after every lag and reports jobs whose final event was dropped as
//! [`JobOutcome::Lost`].

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::job::{CompilationResult, JobId};
use super::service::CompileScheduler;
use crate::events::SchedulerEvent;

const RECONCILE_INTERVAL: Duration = Duration::from_millis(250);

/// How a waited-on job ended.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(Box<CompilationResult>),
    Cancelled,
    /// The job finished but its final event was dropped by a lagging receiver
    Lost,
}

impl JobOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Completed(result) if result.success => "completed",
            JobOutcome::Completed(_) => "failed",
            JobOutcome::Cancelled => "cancelled",
            JobOutcome::Lost => "lost",
        }
    }
}

#[derive(Default)]
struct Tally {
    waiting: HashSet<JobId>,
    outcomes: HashMap<JobId, JobOutcome>,
}

impl Tally {
    fn record(&mut self, event: SchedulerEvent) {
        let job_id = event.job_id();
        if !self.waiting.contains(&job_id) {
            return;
        }
        match event {
            SchedulerEvent::Progress(progress) => {
                tracing::debug!(
                    job_id = %job_id,
                    stage = %progress.stage,
                    percent = progress.percent,
                    "{}",
                    progress.message
                );
            }
            SchedulerEvent::Completed(result) => {
                self.settle(job_id, JobOutcome::Completed(result));
            }
            SchedulerEvent::Cancelled { .. } => self.settle(job_id, JobOutcome::Cancelled),
        }
    }

    fn settle(&mut self, job_id: JobId, outcome: JobOutcome) {
        if self.waiting.remove(&job_id) {
            self.outcomes.insert(job_id, outcome);
        }
    }

    /// Record everything already buffered. Returns true if the receiver lagged.
    fn drain(&mut self, events: &mut broadcast::Receiver<SchedulerEvent>) -> bool {
        let mut lagged = false;
        loop {
            match events.try_recv() {
                Ok(event) => self.record(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event receiver lagged while draining");
                    lagged = true;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return lagged,
            }
        }
    }

    fn give_up(mut self) -> HashMap<JobId, JobOutcome> {
        for job_id in self.waiting.drain() {
            self.outcomes.insert(job_id, JobOutcome::Lost);
        }
        self.outcomes
    }
}

impl CompileScheduler {
    /// Wait until every job in `job_ids` has produced its final event.
    ///
    /// `events` must have been subscribed before the jobs were submitted.
    /// When `interrupt` fires, everything in the scheduler is cleared and the
    /// call returns once the resulting `Cancelled` events are collected. Every
    /// id in `job_ids` appears in the returned map.
    pub async fn wait_for_jobs(
        &self,
        events: &mut broadcast::Receiver<SchedulerEvent>,
        job_ids: &[JobId],
        interrupt: &CancellationToken,
    ) -> HashMap<JobId, JobOutcome> {
        let mut tally = Tally {
            waiting: job_ids.iter().copied().collect(),
            outcomes: HashMap::with_capacity(job_ids.len()),
        };
        let mut lagged = false;
        let mut reconcile = tokio::time::interval(RECONCILE_INTERVAL);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !tally.waiting.is_empty() {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => tally.record(event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event receiver lagged, reconciling with the scheduler");
                        lagged = true;
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = reconcile.tick(), if lagged => {
                    lagged = self.reconcile(events, &mut tally).await;
                }
                _ = interrupt.cancelled() => {
                    tracing::warn!(outstanding = tally.waiting.len(), "Interrupted, cancelling outstanding jobs");
                    // clear() resolves after every final event has been sent
                    self.clear().await;
                    tally.drain(events);
                    break;
                }
            }
        }

        tally.give_up()
    }

    /// Settle jobs the scheduler no longer holds. Returns true if the receiver
    /// lagged again and another round is needed.
    async fn reconcile(
        &self,
        events: &mut broadcast::Receiver<SchedulerEvent>,
        tally: &mut Tally,
    ) -> bool {
        let ids: Vec<JobId> = tally.waiting.iter().copied().collect();
        // A job missing here has already sent its final event, so it is
        // either still buffered or was dropped.
        let held = self.tracked(ids.clone()).await;
        if tally.drain(events) {
            return true;
        }
        let mut lost = 0usize;
        for (job_id, held) in ids.into_iter().zip(held) {
            if !held && tally.waiting.contains(&job_id) {
                tally.settle(job_id, JobOutcome::Lost);
                lost += 1;
            }
        }
        if lost > 0 {
            tracing::warn!(lost, "Final events dropped for finished jobs");
        }
        false
    }
}
