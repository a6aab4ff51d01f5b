//! Job queueing and the scheduling event loop.
//!
//! - [`job`]: job, options and result types
//! - [`queue`]: pending jobs in service order (priority, then submission)
//! - [`service`]: [`CompileScheduler`], the handle callers submit through
//! - [`batch`]: waiting on a set of submitted jobs

pub mod batch;
pub mod job;
pub mod queue;
pub mod service;

pub use batch::JobOutcome;
pub use job::{CompilationJob, CompilationOptions, CompilationResult, JobId};
pub use queue::PendingQueue;
pub use service::{CompileScheduler, SchedulerStatus};
