use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::{Result, TexschedError};
use crate::events::{CompilationStage, EventChannel, SchedulerEvent};
use crate::scheduler::job::{CompilationJob, CompilationOptions, CompilationResult, JobId};
use crate::scheduler::queue::PendingQueue;
use crate::worker::{AvailabilityReport, CompilerProber, JobProcessor, ProcessOutcome};

/// Point-in-time counts of the scheduler's jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub pending: usize,
    pub active: usize,
    pub total: usize,
}

/// Message types for the scheduler event loop
#[derive(Debug)]
enum SchedulerMessage {
    Submit(CompilationJob),
    Cancel {
        job_id: JobId,
        response_tx: oneshot::Sender<bool>,
    },
    Status {
        response_tx: oneshot::Sender<SchedulerStatus>,
    },
    /// For each id, whether it is still pending or active
    Tracked {
        job_ids: Vec<JobId>,
        response_tx: oneshot::Sender<Vec<bool>>,
    },
    /// Cancel everything; answered once no job is active any more
    Clear {
        response_tx: oneshot::Sender<()>,
    },
    SetMaxConcurrent(usize),
    /// Sent by a processor task when its job leaves the processor
    JobFinished {
        job_id: JobId,
        outcome: ProcessOutcome,
    },
    Shutdown {
        response_tx: Option<oneshot::Sender<()>>,
    },
}

/// Handle to a running compilation scheduler.
///
/// All queue state lives in a single event-loop task; this handle only sends
/// it messages, so every mutation happens on one logical thread of control.
/// Dropping the handle cancels every outstanding job.
pub struct CompileScheduler {
    message_tx: mpsc::UnboundedSender<SchedulerMessage>,
    events: EventChannel,
    prober: CompilerProber,
    next_seq: AtomicU64,
}

impl CompileScheduler {
    /// Create a scheduler and spawn its event loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: SchedulerConfig) -> Self {
        let config = Arc::new(config);
        let events = EventChannel::new(config.event_capacity);
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        let processor = Arc::new(JobProcessor::new(config.clone(), events.clone()));
        let event_loop = SchedulerLoop {
            max_concurrent: config.max_concurrent.max(1),
            pending: PendingQueue::new(),
            active: HashMap::new(),
            processor,
            events: events.clone(),
            message_tx: message_tx.downgrade(),
            drain_waiters: Vec::new(),
            stopping: false,
        };
        tokio::spawn(event_loop.run(message_rx));

        let prober = CompilerProber::new(
            config.compilers.clone(),
            config.probe_candidates.clone(),
            Duration::from_millis(config.probe_timeout_ms),
        );

        tracing::info!(
            max_concurrent = config.max_concurrent,
            temp_root = %config.temp_root.display(),
            "Compile scheduler started"
        );

        Self {
            message_tx,
            events,
            prober,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Queue `source` for compilation at default priority.
    pub fn submit(&self, source: impl Into<String>, options: CompilationOptions) -> JobId {
        self.submit_with_priority(source, options, 0)
    }

    /// Queue `source` for compilation. Never blocks and always returns an id;
    /// a `queued` progress event follows on the event channel.
    pub fn submit_with_priority(
        &self,
        source: impl Into<String>,
        options: CompilationOptions,
        priority: i32,
    ) -> JobId {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let job = CompilationJob::new(source.into(), options, priority, seq);
        let job_id = job.id;

        if self.message_tx.send(SchedulerMessage::Submit(job)).is_err() {
            tracing::warn!(job_id = %job_id, "Scheduler stopped, job dropped");
            self.events.cancelled(job_id);
        }
        job_id
    }

    /// Cancel a pending or active job.
    ///
    /// Returns false if the job is unknown or already finished. A pending job
    /// is removed at once; an active job's compiler is signalled and the
    /// `cancelled` event follows once the process has exited.
    pub async fn cancel(&self, job_id: JobId) -> bool {
        self.request(|response_tx| SchedulerMessage::Cancel {
            job_id,
            response_tx,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn status(&self) -> SchedulerStatus {
        self.request(|response_tx| SchedulerMessage::Status { response_tx })
            .await
            .unwrap_or_default()
    }

    /// True while the job is queued or compiling. Once this returns false the
    /// job's final event has already been sent.
    pub async fn contains(&self, job_id: JobId) -> bool {
        self.tracked(vec![job_id])
            .await
            .first()
            .copied()
            .unwrap_or(false)
    }

    /// [`contains`](Self::contains) for many ids in one round trip. A stopped
    /// scheduler holds nothing.
    pub(crate) async fn tracked(&self, job_ids: Vec<JobId>) -> Vec<bool> {
        let len = job_ids.len();
        self.request(|response_tx| SchedulerMessage::Tracked {
            job_ids,
            response_tx,
        })
        .await
        .unwrap_or_else(|_| vec![false; len])
    }

    /// Cancel every pending and active job and wait until none is active.
    pub async fn clear(&self) {
        if let Err(e) = self
            .request(|response_tx| SchedulerMessage::Clear { response_tx })
            .await
        {
            tracing::debug!(error = %e, "Clear on stopped scheduler");
        }
    }

    /// Change the concurrency ceiling. Values below 1 are treated as 1.
    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        if self
            .message_tx
            .send(SchedulerMessage::SetMaxConcurrent(max_concurrent))
            .is_err()
        {
            tracing::warn!("Scheduler stopped, ceiling change ignored");
        }
    }

    /// Cancel everything, wait for running compilers to exit, then stop the
    /// event loop. Later submissions are reported as cancelled.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|tx| SchedulerMessage::Shutdown {
            response_tx: Some(tx),
        })
        .await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub fn event_stream(&self) -> impl Stream<Item = SchedulerEvent> + Send + 'static {
        self.events.stream()
    }

    pub async fn probe_availability(&self) -> AvailabilityReport {
        self.prober.probe().await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SchedulerMessage,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.message_tx
            .send(build(response_tx))
            .map_err(|_| TexschedError::SchedulerStopped)?;
        response_rx
            .await
            .map_err(|_| TexschedError::SchedulerStopped)
    }
}

impl Drop for CompileScheduler {
    fn drop(&mut self) {
        let _ = self
            .message_tx
            .send(SchedulerMessage::Shutdown { response_tx: None });
    }
}

struct ActiveJob {
    cancel: CancellationToken,
    cancel_requested: bool,
}

/// State owned by the scheduler's event loop task.
struct SchedulerLoop {
    max_concurrent: usize,
    pending: PendingQueue,
    active: HashMap<JobId, ActiveJob>,
    processor: Arc<JobProcessor>,
    events: EventChannel,
    /// Weak so that the loop ends once every handle and job task is gone
    message_tx: mpsc::WeakUnboundedSender<SchedulerMessage>,
    drain_waiters: Vec<oneshot::Sender<()>>,
    stopping: bool,
}

impl SchedulerLoop {
    async fn run(mut self, mut message_rx: mpsc::UnboundedReceiver<SchedulerMessage>) {
        while let Some(msg) = message_rx.recv().await {
            self.handle(msg);
            if self.stopping && self.active.is_empty() {
                break;
            }
        }

        message_rx.close();
        while let Ok(msg) = message_rx.try_recv() {
            self.reject(msg);
        }
        for job in self.pending.drain() {
            self.events.cancelled(job.id);
        }
        tracing::info!("Compile scheduler stopped");
    }

    fn handle(&mut self, msg: SchedulerMessage) {
        match msg {
            SchedulerMessage::Submit(job) => self.enqueue(job),
            SchedulerMessage::Cancel {
                job_id,
                response_tx,
            } => {
                let _ = response_tx.send(self.cancel(job_id));
            }
            SchedulerMessage::Status { response_tx } => {
                let _ = response_tx.send(self.status());
            }
            SchedulerMessage::Tracked {
                job_ids,
                response_tx,
            } => {
                let _ = response_tx.send(job_ids.iter().map(|id| self.tracks(id)).collect());
            }
            SchedulerMessage::Clear { response_tx } => {
                self.clear();
                self.wait_for_drain(response_tx);
            }
            SchedulerMessage::SetMaxConcurrent(max_concurrent) => {
                self.max_concurrent = max_concurrent.max(1);
                tracing::info!(max_concurrent = self.max_concurrent, "Concurrency ceiling changed");
                self.schedule();
            }
            SchedulerMessage::JobFinished { job_id, outcome } => self.finish(job_id, outcome),
            SchedulerMessage::Shutdown { response_tx } => {
                self.stopping = true;
                self.clear();
                if let Some(response_tx) = response_tx {
                    self.wait_for_drain(response_tx);
                }
            }
        }
    }

    /// Answer messages that arrive after the loop has stopped.
    fn reject(&mut self, msg: SchedulerMessage) {
        match msg {
            SchedulerMessage::Submit(job) => self.events.cancelled(job.id),
            SchedulerMessage::Cancel { response_tx, .. } => {
                let _ = response_tx.send(false);
            }
            SchedulerMessage::Status { response_tx } => {
                let _ = response_tx.send(self.status());
            }
            SchedulerMessage::Tracked {
                job_ids,
                response_tx,
            } => {
                let _ = response_tx.send(vec![false; job_ids.len()]);
            }
            SchedulerMessage::Clear { response_tx } => {
                let _ = response_tx.send(());
            }
            SchedulerMessage::Shutdown { response_tx } => {
                if let Some(response_tx) = response_tx {
                    let _ = response_tx.send(());
                }
            }
            SchedulerMessage::SetMaxConcurrent(_) | SchedulerMessage::JobFinished { .. } => {}
        }
    }

    fn enqueue(&mut self, job: CompilationJob) {
        if self.stopping {
            self.events.cancelled(job.id);
            return;
        }
        let job_id = job.id;
        tracing::info!(job_id = %job_id, priority = job.priority, "Job queued");
        self.pending.push(job);
        self.events.progress(
            job_id,
            CompilationStage::Queued,
            0,
            "Waiting for a free compilation slot",
        );
        self.schedule();
    }

    /// Start queued jobs until the ceiling is reached.
    fn schedule(&mut self) {
        if self.stopping {
            return;
        }
        while self.active.len() < self.max_concurrent {
            let Some(job) = self.pending.pop() else {
                break;
            };
            self.start(job);
        }
        tracing::debug!(
            pending = self.pending.len(),
            active = self.active.len(),
            max_concurrent = self.max_concurrent,
            "Scheduling pass"
        );
    }

    fn start(&mut self, job: CompilationJob) {
        let job_id = job.id;
        let Some(message_tx) = self.message_tx.upgrade() else {
            tracing::warn!(job_id = %job_id, "Scheduler handle dropped, job not started");
            self.events.cancelled(job_id);
            return;
        };

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let processor = self.processor.clone();
        tokio::spawn(async move {
            let processing = tokio::spawn(async move { processor.process(job, token).await });
            let outcome = match processing.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Job processor task failed");
                    let error = TexschedError::Internal(e.to_string());
                    ProcessOutcome::Finished(CompilationResult::fatal(job_id, error.to_string(), 0))
                }
            };
            let _ = message_tx.send(SchedulerMessage::JobFinished { job_id, outcome });
        });

        self.active.insert(
            job_id,
            ActiveJob {
                cancel,
                cancel_requested: false,
            },
        );
        tracing::info!(job_id = %job_id, active = self.active.len(), "Job started");
    }

    fn finish(&mut self, job_id: JobId, outcome: ProcessOutcome) {
        let Some(active) = self.active.remove(&job_id) else {
            tracing::warn!(job_id = %job_id, "Finished job was not active");
            return;
        };

        match outcome {
            _ if active.cancel_requested => {
                tracing::info!(job_id = %job_id, "Job cancelled");
                self.events.cancelled(job_id);
            }
            ProcessOutcome::Cancelled => {
                tracing::info!(job_id = %job_id, "Job cancelled");
                self.events.cancelled(job_id);
            }
            ProcessOutcome::Finished(result) => {
                tracing::info!(
                    job_id = %job_id,
                    success = result.success,
                    passes = result.passes,
                    errors = result.errors.len(),
                    warnings = result.warnings.len(),
                    duration_ms = result.duration_ms,
                    "Job finished"
                );
                let (stage, message) = if result.success {
                    (CompilationStage::Completed, "Compilation succeeded".to_string())
                } else {
                    (
                        CompilationStage::Failed,
                        format!("Compilation failed with {} error(s)", result.errors.len()),
                    )
                };
                self.events.progress(job_id, stage, 100, message);
                self.events.completed(result);
            }
        }

        self.schedule();
        self.notify_drained();
    }

    fn cancel(&mut self, job_id: JobId) -> bool {
        if self.pending.remove(&job_id).is_some() {
            tracing::info!(job_id = %job_id, "Pending job cancelled");
            self.events.cancelled(job_id);
            return true;
        }
        match self.active.get_mut(&job_id) {
            Some(active) => {
                if !active.cancel_requested {
                    tracing::info!(job_id = %job_id, "Cancelling active job");
                    active.cancel_requested = true;
                    active.cancel.cancel();
                }
                true
            }
            None => false,
        }
    }

    fn clear(&mut self) {
        let pending = self.pending.drain();
        for job in &pending {
            self.events.cancelled(job.id);
        }
        let mut signalled = 0usize;
        for active in self.active.values_mut() {
            if !active.cancel_requested {
                active.cancel_requested = true;
                active.cancel.cancel();
                signalled += 1;
            }
        }
        if !pending.is_empty() || signalled > 0 {
            tracing::info!(pending = pending.len(), active = signalled, "Cleared scheduler");
        }
    }

    fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            pending: self.pending.len(),
            active: self.active.len(),
            total: self.pending.len() + self.active.len(),
        }
    }

    fn tracks(&self, job_id: &JobId) -> bool {
        self.pending.contains(job_id) || self.active.contains_key(job_id)
    }

    fn wait_for_drain(&mut self, response_tx: oneshot::Sender<()>) {
        if self.active.is_empty() {
            let _ = response_tx.send(());
        } else {
            self.drain_waiters.push(response_tx);
        }
    }

    fn notify_drained(&mut self) {
        if !self.active.is_empty() {
            return;
        }
        for waiter in self.drain_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}
