//! The multiplexed event channel shared by the scheduler and its processors.
//!
//! Every notification carries the job id, so one subscription can follow any
//! number of jobs. Subscribers that fall more than `event_capacity` events
//! behind lose the oldest ones (see [`tokio::sync::broadcast`]).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::scheduler::job::{CompilationResult, JobId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilationStage {
    Queued,
    Preparing,
    Compiling,
    Processing,
    Completed,
    Failed,
}

impl CompilationStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CompilationStage::Completed | CompilationStage::Failed)
    }
}

impl std::fmt::Display for CompilationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompilationStage::Queued => write!(f, "queued"),
            CompilationStage::Preparing => write!(f, "preparing"),
            CompilationStage::Compiling => write!(f, "compiling"),
            CompilationStage::Processing => write!(f, "processing"),
            CompilationStage::Completed => write!(f, "completed"),
            CompilationStage::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationProgress {
    pub job_id: JobId,
    pub stage: CompilationStage,
    pub percent: u8,
    pub message: String,
}

/// Notifications delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    Progress(CompilationProgress),
    /// Exactly one per job that was not cancelled
    Completed(Box<CompilationResult>),
    /// Exactly one per cancelled job, in place of `Completed`
    Cancelled { job_id: JobId },
}

impl SchedulerEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            SchedulerEvent::Progress(progress) => progress.job_id,
            SchedulerEvent::Completed(result) => result.job_id,
            SchedulerEvent::Cancelled { job_id } => *job_id,
        }
    }

    /// True for the last event a job will ever produce.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            SchedulerEvent::Completed(_) | SchedulerEvent::Cancelled { .. }
        )
    }
}

/// Sending half of the event channel.
///
/// Sends never block; having no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventChannel {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`, skipping over any events lost to lag.
    pub fn stream(&self) -> impl Stream<Item = SchedulerEvent> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|event| match event {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(error = %e, "Event subscriber lagged");
                None
            }
        })
    }

    pub fn progress(
        &self,
        job_id: JobId,
        stage: CompilationStage,
        percent: u8,
        message: impl Into<String>,
    ) {
        self.emit(SchedulerEvent::Progress(CompilationProgress {
            job_id,
            stage,
            percent: percent.min(100),
            message: message.into(),
        }));
    }

    pub fn completed(&self, result: CompilationResult) {
        self.emit(SchedulerEvent::Completed(Box::new(result)));
    }

    pub fn cancelled(&self, job_id: JobId) {
        self.emit(SchedulerEvent::Cancelled { job_id });
    }

    fn emit(&self, event: SchedulerEvent) {
        // Err only means nobody is listening right now
        let _ = self.tx.send(event);
    }
}
